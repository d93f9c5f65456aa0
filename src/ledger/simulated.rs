//! In-memory chain with deposit holders and adjudicator rules.
//!
//! Every accepted transaction is mined into its own block. Time only moves
//! through [SimulatedLedger::advance_time], and additional (empty) blocks only
//! through [SimulatedLedger::mine]. Reorgs are not simulated.

use super::{ChannelPhase, Ledger, LedgerError, OnChainDispute, Receipt, Transaction, TxHash};
use crate::{
    abiencode::{
        self,
        types::{Address, Hash, U256},
    },
    channel::{funding_id, Asset, SignedState, SignedWithdrawalAuth},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info};

fn reject(reason: impl Into<String>) -> LedgerError {
    LedgerError::Rejected(reason.into())
}

#[derive(Debug, Default)]
struct Chain {
    height: u64,
    time: u64,
    unreachable: bool,
    tx_count: u64,
    // Keyed by asset id.
    tokens: HashSet<Hash>,
    balances: HashMap<(Hash, Address), U256>,
    allowances: HashMap<(Hash, Address), U256>,
    holdings: HashMap<(Hash, Hash), U256>,
    disputes: HashMap<Hash, OnChainDispute>,
    included: HashMap<TxHash, u64>,
}

/// Signatures, dimensions and the channel id of `signed` are consistent.
fn verify_signed(signed: &SignedState) -> Result<(), LedgerError> {
    let outcome = &signed.state.outcome;
    outcome
        .valid()
        .map_err(|e| reject(format!("malformed outcome: {}", e)))?;
    if outcome.num_parts() != signed.params.num_parts() {
        return Err(reject("outcome does not match the participants"));
    }
    if signed.state.channel_id() != signed.params.channel_id() {
        return Err(reject("state does not belong to the parameters"));
    }
    signed
        .verify()
        .map_err(|e| reject(format!("invalid signatures: {}", e)))
}

fn new_dispute(signed: &SignedState, timeout: u64, phase: ChannelPhase) -> OnChainDispute {
    OnChainDispute {
        state: signed.clone(),
        timeout,
        phase,
        refutations: 0,
        withdrawn: vec![vec![false; signed.state.outcome.num_assets()]; signed.params.num_parts()],
    }
}

impl Chain {
    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.unreachable {
            Err(LedgerError::Unreachable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn holding(&self, asset: Hash, fid: Hash) -> U256 {
        self.holdings.get(&(asset, fid)).copied().unwrap_or_default()
    }

    // All checks happen before the first write, a rejected transaction
    // leaves no trace.
    fn execute(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        match tx {
            Transaction::Approve {
                asset,
                owner,
                amount,
            } => {
                self.allowances.insert((asset.id(), *owner), *amount);
                Ok(())
            }
            Transaction::Deposit {
                asset,
                funding_id,
                from,
                amount,
            } => self.deposit(asset, *funding_id, *from, *amount),
            Transaction::Register(signed) => self.register(signed),
            Transaction::Conclude(channel) => self.conclude(*channel),
            Transaction::ConcludeFinal(signed) => self.conclude_final(signed),
            Transaction::Withdraw { asset, auth } => self.withdraw(asset, auth),
        }
    }

    fn deposit(
        &mut self,
        asset: &Asset,
        fid: Hash,
        from: Address,
        amount: U256,
    ) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Err(reject("zero deposit"));
        }
        let id = asset.id();
        let balance = self.balances.get(&(id, from)).copied().unwrap_or_default();
        if balance < amount {
            return Err(reject(format!("insufficient funds: {} < {}", balance, amount)));
        }
        if self.tokens.contains(&id) {
            let allowance = self.allowances.get(&(id, from)).copied().unwrap_or_default();
            if allowance < amount {
                return Err(reject(format!(
                    "insufficient allowance: {} < {}",
                    allowance, amount
                )));
            }
            self.allowances.insert((id, from), allowance - amount);
        }
        self.balances.insert((id, from), balance - amount);
        let held = self.holding(id, fid);
        self.holdings.insert((id, fid), held.saturating_add(amount));
        Ok(())
    }

    fn register(&mut self, signed: &SignedState) -> Result<(), LedgerError> {
        verify_signed(signed)?;
        let channel = signed.channel_id();
        let now = self.time;

        if let Some(d) = self.disputes.get_mut(&channel) {
            if d.phase == ChannelPhase::Concluded {
                return Err(reject("channel already concluded"));
            }
            if now >= d.timeout {
                return Err(reject("challenge window elapsed"));
            }
            if signed.version() <= d.version() {
                return Err(reject(format!(
                    "version {} does not supersede registered version {}",
                    signed.version(),
                    d.version()
                )));
            }
            // The challenge window is not extended by a refutation.
            d.state = signed.clone();
            d.refutations += 1;
            return Ok(());
        }

        let timeout = now.saturating_add(signed.params.challenge_duration);
        self.disputes
            .insert(channel, new_dispute(signed, timeout, ChannelPhase::Dispute));
        Ok(())
    }

    /// Set the holdings of every participant to its share of the outcome.
    fn payout(&mut self, signed: &SignedState) -> Result<(), LedgerError> {
        let outcome = &signed.state.outcome;
        if !outcome.locked.is_empty() {
            return Err(reject("outcome has funds locked in sub-channels"));
        }
        let channel = signed.channel_id();
        let fids: Vec<Hash> = signed
            .params
            .participants
            .iter()
            .map(|p| funding_id(channel, *p))
            .collect();

        for (a, asset) in outcome.assets.iter().enumerate() {
            let held = fids
                .iter()
                .fold(U256::zero(), |acc, fid| acc.saturating_add(self.holding(asset.id(), *fid)));
            let owed = outcome
                .balances
                .iter()
                .fold(U256::zero(), |acc, b| acc.saturating_add(b[a]));
            if held < owed {
                return Err(reject(format!(
                    "asset {} underfunded: holdings {} < outcome {}",
                    a, held, owed
                )));
            }
        }
        for (a, asset) in outcome.assets.iter().enumerate() {
            for (p, fid) in fids.iter().enumerate() {
                self.holdings
                    .insert((asset.id(), *fid), outcome.balances[p][a]);
            }
        }
        Ok(())
    }

    fn conclude(&mut self, channel: Hash) -> Result<(), LedgerError> {
        let d = self
            .disputes
            .get(&channel)
            .ok_or_else(|| reject("channel not registered"))?;
        if d.phase == ChannelPhase::Concluded {
            return Err(reject("channel already concluded"));
        }
        if self.time < d.timeout {
            return Err(reject(format!("challenge window open until {}", d.timeout)));
        }
        let signed = d.state.clone();
        self.payout(&signed)?;
        if let Some(d) = self.disputes.get_mut(&channel) {
            d.phase = ChannelPhase::Concluded;
        }
        Ok(())
    }

    fn conclude_final(&mut self, signed: &SignedState) -> Result<(), LedgerError> {
        verify_signed(signed)?;
        if !signed.state.is_final {
            return Err(reject("state is not final"));
        }
        let channel = signed.channel_id();
        let refutations = match self.disputes.get(&channel) {
            Some(d) if d.phase == ChannelPhase::Concluded => {
                return Err(reject("channel already concluded"))
            }
            Some(d) => d.refutations,
            None => 0,
        };
        self.payout(signed)?;
        let mut d = new_dispute(signed, self.time, ChannelPhase::Concluded);
        d.refutations = refutations;
        self.disputes.insert(channel, d);
        Ok(())
    }

    fn withdraw(&mut self, asset: &Asset, auth: &SignedWithdrawalAuth) -> Result<(), LedgerError> {
        let channel = auth.auth.channel_id;
        let d = self
            .disputes
            .get(&channel)
            .ok_or_else(|| reject("channel not registered"))?;
        if d.phase != ChannelPhase::Concluded {
            return Err(reject("channel not concluded"));
        }
        if !auth.verify() {
            return Err(reject("invalid withdrawal signature"));
        }
        let part = d
            .state
            .params
            .index_of(&auth.auth.participant)
            .ok_or_else(|| reject("not a participant of the channel"))?;
        let a = d
            .state
            .state
            .outcome
            .assets
            .iter()
            .position(|x| x == asset)
            .ok_or_else(|| reject("asset not part of the channel"))?;
        if d.has_withdrawn(part, a) {
            return Err(reject("already withdrawn"));
        }

        let key = (asset.id(), funding_id(channel, auth.auth.participant));
        let held = self.holding(key.0, key.1);
        if auth.auth.amount != held {
            return Err(reject(format!(
                "amount {} does not match holdings {}",
                auth.auth.amount, held
            )));
        }
        self.holdings.insert(key, U256::zero());
        let bal = self
            .balances
            .get(&(key.0, auth.auth.receiver))
            .copied()
            .unwrap_or_default();
        self.balances
            .insert((key.0, auth.auth.receiver), bal.saturating_add(held));
        if let Some(d) = self.disputes.get_mut(&channel) {
            d.withdrawn[part][a] = true;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SimulatedLedger {
    chain: Mutex<Chain>,
    // Latest block height, for waking up confirmation waiters.
    blocks: watch::Sender<u64>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLedger {
    pub fn new() -> Self {
        let (blocks, _) = watch::channel(0);
        SimulatedLedger {
            chain: Mutex::new(Chain::default()),
            blocks,
        }
    }

    /// Deposits of `asset` need a prior [Transaction::Approve].
    pub fn register_token(&self, asset: Asset) {
        self.chain.lock().tokens.insert(asset.id());
    }

    /// Credit `amount` of `asset` to an external account.
    pub fn mint(&self, asset: &Asset, account: Address, amount: U256) {
        let mut chain = self.chain.lock();
        let bal = chain.balances.entry((asset.id(), account)).or_default();
        *bal = bal.saturating_add(amount);
    }

    pub fn advance_time(&self, secs: u64) {
        let mut chain = self.chain.lock();
        chain.time = chain.time.saturating_add(secs);
        debug!(time = chain.time, "ledger time advanced");
    }

    /// While unreachable, every call fails with [LedgerError::Unreachable].
    pub fn set_reachable(&self, reachable: bool) {
        self.chain.lock().unreachable = !reachable;
    }

    /// Append `n` empty blocks.
    pub fn mine(&self, n: u64) {
        let height = {
            let mut chain = self.chain.lock();
            chain.height += n;
            chain.height
        };
        self.blocks.send_replace(height);
    }

    pub fn height(&self) -> u64 {
        self.chain.lock().height
    }
}

#[async_trait]
impl Ledger for SimulatedLedger {
    async fn submit(&self, tx: Transaction) -> Result<TxHash, LedgerError> {
        let (hash, height) = {
            let mut chain = self.chain.lock();
            chain.check_reachable()?;
            if let Err(e) = chain.execute(&tx) {
                debug!(kind = tx.kind(), error = %e, "transaction rejected");
                return Err(e);
            }
            chain.tx_count += 1;
            chain.height += 1;
            let hash = abiencode::to_hash(&chain.tx_count);
            let height = chain.height;
            chain.included.insert(hash, height);
            (hash, height)
        };
        info!(kind = tx.kind(), block = height, "transaction included");
        self.blocks.send_replace(height);
        Ok(hash)
    }

    async fn await_confirmation(
        &self,
        tx: TxHash,
        finality_depth: u64,
        deadline: Instant,
    ) -> Result<Receipt, LedgerError> {
        // Subscribe first, so a block mined after the check below wakes us.
        let mut blocks = self.blocks.subscribe();
        loop {
            {
                let chain = self.chain.lock();
                chain.check_reachable()?;
                let block = *chain
                    .included
                    .get(&tx)
                    .ok_or_else(|| reject("unknown transaction"))?;
                let confirmations = chain.height - block + 1;
                if confirmations >= finality_depth {
                    return Ok(Receipt {
                        tx,
                        block,
                        confirmations,
                    });
                }
            }
            match tokio::time::timeout_at(deadline, blocks.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Err(LedgerError::Timeout),
            }
        }
    }

    async fn dispute(&self, channel: Hash) -> Result<Option<OnChainDispute>, LedgerError> {
        let chain = self.chain.lock();
        chain.check_reachable()?;
        Ok(chain.disputes.get(&channel).cloned())
    }

    async fn holdings(&self, asset: &Asset, funding_id: Hash) -> Result<U256, LedgerError> {
        let chain = self.chain.lock();
        chain.check_reachable()?;
        Ok(chain.holding(asset.id(), funding_id))
    }

    async fn balance(&self, asset: &Asset, account: Address) -> Result<U256, LedgerError> {
        let chain = self.chain.lock();
        chain.check_reachable()?;
        Ok(chain
            .balances
            .get(&(asset.id(), account))
            .copied()
            .unwrap_or_default())
    }

    async fn timestamp(&self) -> Result<u64, LedgerError> {
        let chain = self.chain.lock();
        chain.check_reachable()?;
        Ok(chain.time)
    }
}
