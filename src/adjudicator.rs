//! Dispute engine: registers, refutes, concludes and withdraws on the
//! ledger.
//!
//! Nothing is remembered between calls. Every operation reads the current
//! on-chain record first and derives what (if anything) is left to do from
//! it, so repeating an operation that already took effect is a no-op.

use crate::{
    abiencode::types::Address,
    channel::{make_signed_withdrawal_auths, PartIdx, SignatureError, SignedState},
    config::ClientConfig,
    ledger::{ChannelPhase, Ledger, LedgerError, OnChainDispute, Transaction, TxHash},
    sig::Account,
    Hash,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum AdjudicatorError {
    #[error("{0}")]
    Ledger(#[from] LedgerError),
    #[error("state is not fully signed: {0}")]
    NotFullySigned(#[from] SignatureError),
    #[error("registered version {registered} supersedes ours ({ours})")]
    Superseded { registered: u64, ours: u64 },
    #[error("channel was concluded with version {0}")]
    AlreadyConcluded(u64),
    #[error("channel is not registered")]
    NotRegistered,
    #[error("challenge window is open until {timeout}")]
    ChallengeWindowOpen { timeout: u64 },
    #[error("channel is not concluded")]
    NotConcluded,
    #[error("participant {0} has nothing to withdraw")]
    NothingToWithdraw(PartIdx),
    #[error("account does not belong to participant {0}")]
    InvalidParticipant(PartIdx),
    #[error("challenge window did not elapse before the deadline")]
    Timeout,
}

/// Where a channel is in its on-chain life, from the view of one
/// participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputePhase {
    Unregistered,
    /// A state is registered and was not refuted so far.
    Registered,
    /// The first registration was superseded by a higher version.
    Disputed,
    Concluded,
    /// The participant had funds and withdrew all of them.
    Withdrawn,
}

fn phase_of(d: &OnChainDispute, part_idx: PartIdx) -> DisputePhase {
    match d.phase {
        ChannelPhase::Dispute if d.refutations == 0 => DisputePhase::Registered,
        ChannelPhase::Dispute => DisputePhase::Disputed,
        ChannelPhase::Concluded => {
            let outcome = &d.state.state.outcome;
            let funded: Vec<usize> = (0..outcome.num_assets())
                .filter(|a| outcome.balance(part_idx, *a).map_or(false, |b| !b.is_zero()))
                .collect();
            if !funded.is_empty() && funded.iter().all(|a| d.has_withdrawn(part_idx, *a)) {
                DisputePhase::Withdrawn
            } else {
                DisputePhase::Concluded
            }
        }
    }
}

#[derive(Debug)]
pub struct Adjudicator {
    ledger: Arc<dyn Ledger>,
    account: Arc<dyn Account>,
    finality_depth: u64,
    tx_timeout: Duration,
    poll_interval: Duration,
}

impl Adjudicator {
    pub fn new(ledger: Arc<dyn Ledger>, account: Arc<dyn Account>, config: &ClientConfig) -> Self {
        Adjudicator {
            ledger,
            account,
            finality_depth: config.finality_depth,
            tx_timeout: config.tx_timeout,
            poll_interval: config.poll_interval,
        }
    }

    async fn submit_and_confirm(&self, tx: Transaction) -> Result<TxHash, LedgerError> {
        let kind = tx.kind();
        let hash = self.ledger.submit(tx).await?;
        let deadline = Instant::now() + self.tx_timeout;
        self.ledger
            .await_confirmation(hash, self.finality_depth, deadline)
            .await?;
        debug!(kind, "transaction confirmed");
        Ok(hash)
    }

    /// Make `signed` the registered state of its channel: register it if
    /// nothing is registered, refute if a lower version is.
    ///
    /// Returns `None` if `signed` is registered already.
    #[instrument(skip_all, fields(channel = ?signed.channel_id(), version = signed.version()))]
    pub async fn register(&self, signed: &SignedState) -> Result<Option<TxHash>, AdjudicatorError> {
        signed.verify()?;
        let channel = signed.channel_id();
        let ours = signed.version();

        match self.ledger.dispute(channel).await? {
            Some(d) if d.version() == ours => {
                debug!("already registered");
                return Ok(None);
            }
            Some(d) if d.version() > ours => {
                return Err(AdjudicatorError::Superseded {
                    registered: d.version(),
                    ours,
                })
            }
            Some(d) if d.phase == ChannelPhase::Concluded => {
                return Err(AdjudicatorError::AlreadyConcluded(d.version()))
            }
            Some(d) => info!(registered = d.version(), "refuting"),
            None => info!("registering"),
        }

        match self
            .submit_and_confirm(Transaction::Register(signed.clone()))
            .await
        {
            Ok(tx) => Ok(Some(tx)),
            Err(e @ LedgerError::Rejected(_)) => {
                // Somebody else may have registered the same state meanwhile.
                match self.ledger.dispute(channel).await? {
                    Some(d) if d.version() == ours => Ok(None),
                    Some(d) if d.version() > ours => Err(AdjudicatorError::Superseded {
                        registered: d.version(),
                        ours,
                    }),
                    _ => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Conclude the channel. A final state concludes immediately, otherwise
    /// the registered state is concluded once its challenge window elapsed.
    ///
    /// Returns `None` if the channel is concluded already.
    #[instrument(skip_all, fields(channel = ?signed.channel_id(), version = signed.version()))]
    pub async fn conclude(&self, signed: &SignedState) -> Result<Option<TxHash>, AdjudicatorError> {
        let channel = signed.channel_id();
        let dispute = self.ledger.dispute(channel).await?;
        if matches!(&dispute, Some(d) if d.phase == ChannelPhase::Concluded) {
            debug!("already concluded");
            return Ok(None);
        }

        let tx = if signed.state.is_final {
            signed.verify()?;
            Transaction::ConcludeFinal(signed.clone())
        } else {
            let d = dispute.ok_or(AdjudicatorError::NotRegistered)?;
            if self.ledger.timestamp().await? < d.timeout {
                return Err(AdjudicatorError::ChallengeWindowOpen { timeout: d.timeout });
            }
            Transaction::Conclude(channel)
        };

        match self.submit_and_confirm(tx).await {
            Ok(tx) => {
                info!("concluded");
                Ok(Some(tx))
            }
            Err(e @ LedgerError::Rejected(_)) => match self.ledger.dispute(channel).await? {
                Some(d) if d.phase == ChannelPhase::Concluded => Ok(None),
                _ => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the challenge window of the registered state elapsed.
    pub async fn wait_for_timeout(
        &self,
        channel: Hash,
        deadline: Instant,
    ) -> Result<(), AdjudicatorError> {
        loop {
            let d = self
                .ledger
                .dispute(channel)
                .await?
                .ok_or(AdjudicatorError::NotRegistered)?;
            if d.phase == ChannelPhase::Concluded || self.ledger.timestamp().await? >= d.timeout {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AdjudicatorError::Timeout);
            }
            tokio::time::sleep_until(deadline.min(now + self.poll_interval)).await;
        }
    }

    /// Pay out our share of every asset of the concluded channel to
    /// `receiver`. Assets already withdrawn are skipped.
    #[instrument(skip(self))]
    pub async fn withdraw(
        &self,
        channel: Hash,
        part_idx: PartIdx,
        receiver: Address,
    ) -> Result<Vec<TxHash>, AdjudicatorError> {
        let d = self
            .ledger
            .dispute(channel)
            .await?
            .ok_or(AdjudicatorError::NotRegistered)?;
        if d.phase != ChannelPhase::Concluded {
            return Err(AdjudicatorError::NotConcluded);
        }
        let params = &d.state.params;
        if params.participants.get(part_idx) != Some(&self.account.address()) {
            return Err(AdjudicatorError::InvalidParticipant(part_idx));
        }

        let state = &d.state.state;
        let auths =
            make_signed_withdrawal_auths(&*self.account, params, state, receiver, part_idx);
        let mut has_funds = false;
        let mut txs = vec![];
        for (idx, auth) in auths.into_iter().enumerate() {
            if auth.auth.amount.is_zero() {
                continue;
            }
            has_funds = true;
            if d.has_withdrawn(part_idx, idx) {
                debug!(asset = idx, "already withdrawn");
                continue;
            }
            let tx = Transaction::Withdraw {
                asset: state.outcome.assets[idx],
                auth,
            };
            txs.push(self.submit_and_confirm(tx).await?);
            info!(asset = idx, amount = %auth.auth.amount, "withdrawn");
        }
        if !has_funds {
            warn!("nothing to withdraw");
            return Err(AdjudicatorError::NothingToWithdraw(part_idx));
        }
        Ok(txs)
    }

    pub async fn phase(&self, channel: Hash, part_idx: PartIdx) -> Result<DisputePhase, LedgerError> {
        Ok(match self.ledger.dispute(channel).await? {
            None => DisputePhase::Unregistered,
            Some(d) => phase_of(&d, part_idx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            funding_id,
            state::tests::{sign_all, two_party_setup},
            Params, State,
        },
        ledger::SimulatedLedger,
        sig::Signer,
    };

    struct Fixture {
        ledger: Arc<SimulatedLedger>,
        adj: Vec<Adjudicator>,
        params: Params,
        states: Vec<SignedState>,
    }

    /// Funded channel with versions 0..=3, each moving 10 from participant 0
    /// to participant 1.
    async fn setup(seed: u64) -> Fixture {
        let (signers, params, state) = two_party_setup(seed);
        let ledger = Arc::new(SimulatedLedger::new());
        let asset = state.outcome.assets[0];
        let alice = signers[0].address();
        ledger.mint(&asset, alice, 100.into());
        ledger
            .submit(Transaction::Deposit {
                asset,
                funding_id: funding_id(params.channel_id(), alice),
                from: alice,
                amount: 100.into(),
            })
            .await
            .unwrap();

        let mut raw: Vec<State> = vec![state];
        for _ in 0..3 {
            let mut next = raw.last().unwrap().make_next_state();
            next.outcome.transfer(0, 0, 1, 10.into()).unwrap();
            raw.push(next);
        }
        let states = raw.iter().map(|s| sign_all(&signers, &params, s)).collect();

        let adj = signers
            .into_iter()
            .map(|s| {
                let account: Arc<Signer> = Arc::new(s);
                Adjudicator::new(ledger.clone(), account, &ClientConfig::default())
            })
            .collect();
        Fixture {
            ledger,
            adj,
            params,
            states,
        }
    }

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let f = setup(1).await;
        let channel = f.params.channel_id();
        assert_eq!(
            f.adj[0].phase(channel, 0).await.unwrap(),
            DisputePhase::Unregistered
        );
        assert!(f.adj[0].register(&f.states[1]).await.unwrap().is_some());
        assert!(f.adj[0].register(&f.states[1]).await.unwrap().is_none());
        assert!(f.adj[1].register(&f.states[1]).await.unwrap().is_none());
        assert_eq!(
            f.adj[1].phase(channel, 1).await.unwrap(),
            DisputePhase::Registered
        );
    }

    #[tokio::test]
    async fn stale_registration_is_refuted() {
        let f = setup(2).await;
        let channel = f.params.channel_id();
        f.adj[0].register(&f.states[0]).await.unwrap();
        f.adj[1].register(&f.states[3]).await.unwrap();
        assert_eq!(
            f.adj[0].phase(channel, 0).await.unwrap(),
            DisputePhase::Disputed
        );

        match f.adj[0].register(&f.states[2]).await {
            Err(AdjudicatorError::Superseded { registered, ours }) => {
                assert_eq!((registered, ours), (3, 2))
            }
            other => panic!("expected Superseded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn conclude_waits_for_the_challenge_window() {
        let f = setup(3).await;
        let channel = f.params.channel_id();
        assert!(matches!(
            f.adj[0].conclude(&f.states[1]).await,
            Err(AdjudicatorError::NotRegistered)
        ));

        f.adj[0].register(&f.states[1]).await.unwrap();
        assert!(matches!(
            f.adj[0].conclude(&f.states[1]).await,
            Err(AdjudicatorError::ChallengeWindowOpen { timeout: 60 })
        ));
        assert!(matches!(
            f.adj[0].wait_for_timeout(channel, deadline(20)).await,
            Err(AdjudicatorError::Timeout)
        ));

        f.ledger.advance_time(60);
        f.adj[0].wait_for_timeout(channel, deadline(20)).await.unwrap();
        assert!(f.adj[0].conclude(&f.states[1]).await.unwrap().is_some());
        assert!(f.adj[1].conclude(&f.states[1]).await.unwrap().is_none());
        assert_eq!(
            f.adj[0].phase(channel, 0).await.unwrap(),
            DisputePhase::Concluded
        );
        assert!(matches!(
            f.adj[1].register(&f.states[2]).await,
            Err(AdjudicatorError::AlreadyConcluded(1))
        ));
    }

    #[tokio::test]
    async fn final_state_concludes_without_registration() {
        let f = setup(4).await;
        let (signers, _, _) = two_party_setup(4);
        let mut last = f.states[3].state.make_next_state();
        last.is_final = true;
        let signed = sign_all(&signers, &f.params, &last);

        assert!(f.adj[1].conclude(&signed).await.unwrap().is_some());
        assert_eq!(
            f.adj[1].phase(f.params.channel_id(), 1).await.unwrap(),
            DisputePhase::Concluded
        );
    }

    #[tokio::test]
    async fn withdraw_once_per_participant() {
        let f = setup(5).await;
        let channel = f.params.channel_id();
        let asset = f.states[0].state.outcome.assets[0];
        let receiver = Address([0x55; 20]);

        f.adj[1].register(&f.states[3]).await.unwrap();
        assert!(matches!(
            f.adj[1].withdraw(channel, 1, receiver).await,
            Err(AdjudicatorError::NotConcluded)
        ));
        f.ledger.advance_time(60);
        f.adj[1].conclude(&f.states[3]).await.unwrap();

        assert!(matches!(
            f.adj[0].withdraw(channel, 1, receiver).await,
            Err(AdjudicatorError::InvalidParticipant(1))
        ));
        assert_eq!(f.adj[1].withdraw(channel, 1, receiver).await.unwrap().len(), 1);
        assert!(f.adj[1].withdraw(channel, 1, receiver).await.unwrap().is_empty());
        assert_eq!(f.ledger.balance(&asset, receiver).await.unwrap(), 30.into());
        assert_eq!(
            f.adj[1].phase(channel, 1).await.unwrap(),
            DisputePhase::Withdrawn
        );
        assert_eq!(
            f.adj[0].phase(channel, 0).await.unwrap(),
            DisputePhase::Concluded
        );
    }

    #[tokio::test]
    async fn zero_balance_cannot_be_withdrawn() {
        let f = setup(6).await;
        let channel = f.params.channel_id();
        f.adj[0].register(&f.states[0]).await.unwrap();
        f.ledger.advance_time(60);
        f.adj[0].conclude(&f.states[0]).await.unwrap();
        assert!(matches!(
            f.adj[1].withdraw(channel, 1, Address([1; 20])).await,
            Err(AdjudicatorError::NothingToWithdraw(1))
        ));
    }
}
