//! Deposits a participant's share of a channel's initial allocation and
//! waits for the other participants to do the same.

mod depositor;

pub use depositor::{DepositReq, Depositor, NativeDepositor, TokenDepositor};

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::{funding_id, Asset, Params, PartIdx, State},
    config::ClientConfig,
    ledger::{Ledger, LedgerError},
};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum FundingError {
    #[error("no depositor registered for asset {0:?}")]
    UnknownAsset(Asset),
    #[error("invalid funding request: {0}")]
    InvalidRequest(&'static str),
    #[error("{0}")]
    Ledger(#[from] LedgerError),
    #[error("participants {missing:?} did not fund in time")]
    Timeout { missing: Vec<PartIdx> },
}

/// Funding of one participant's share of `state`.
#[derive(Debug, Clone)]
pub struct FundingReq {
    pub params: Params,
    pub state: State,
    pub part_idx: PartIdx,
}

impl FundingReq {
    fn validate(&self) -> Result<(), FundingError> {
        if self.part_idx >= self.params.num_parts() {
            return Err(FundingError::InvalidRequest("participant index out of range"));
        }
        if self.state.channel_id() != self.params.channel_id() {
            return Err(FundingError::InvalidRequest("state does not belong to params"));
        }
        if self.state.outcome.valid().is_err()
            || self.state.outcome.num_parts() != self.params.num_parts()
        {
            return Err(FundingError::InvalidRequest("malformed allocation"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AssetEntry {
    depositor: Arc<dyn Depositor>,
    account: Address,
}

#[derive(Debug)]
pub struct Funder {
    ledger: Arc<dyn Ledger>,
    assets: RwLock<HashMap<Asset, AssetEntry>>,
    // One depositing call per funding id at a time.
    deposits: Mutex<HashMap<Hash, Arc<tokio::sync::Mutex<()>>>>,
    finality_depth: u64,
    poll_interval: Duration,
}

impl Funder {
    pub fn new(ledger: Arc<dyn Ledger>, config: &ClientConfig) -> Self {
        Funder {
            ledger,
            assets: RwLock::new(HashMap::new()),
            deposits: Mutex::new(HashMap::new()),
            finality_depth: config.finality_depth,
            poll_interval: config.poll_interval,
        }
    }

    /// Deposits of `asset` are made by `depositor` and paid from `account`.
    /// Registering an asset again replaces the previous entry.
    pub fn register_asset(&self, asset: Asset, depositor: Arc<dyn Depositor>, account: Address) {
        self.assets
            .write()
            .insert(asset, AssetEntry { depositor, account });
    }

    fn entry(&self, asset: &Asset) -> Result<AssetEntry, FundingError> {
        self.assets
            .read()
            .get(asset)
            .cloned()
            .ok_or(FundingError::UnknownAsset(*asset))
    }

    /// Deposit our share for every asset and wait until the channel is fully
    /// funded.
    ///
    /// Deposits already reflected in the ledger are not repeated, so calling
    /// this again after an error tops up at most the missing amount.
    /// Concurrent calls for the same share deposit one after the other.
    #[instrument(skip_all, fields(channel = ?req.params.channel_id(), part_idx = req.part_idx))]
    pub async fn fund(&self, req: &FundingReq, deadline: Instant) -> Result<(), FundingError> {
        req.validate()?;
        let participant = req.params.participants[req.part_idx];
        let fid = funding_id(req.params.channel_id(), participant);

        let lock = self.deposits.lock().entry(fid).or_default().clone();
        let res = {
            let _guard = lock.lock().await;
            self.deposit_share(req, fid, deadline).await
        };
        {
            let mut deposits = self.deposits.lock();
            // Nobody else holds or waits for the lock.
            if Arc::strong_count(&lock) == 2 {
                deposits.remove(&fid);
            }
        }
        res?;

        self.await_funded(req, deadline).await
    }

    async fn deposit_share(
        &self,
        req: &FundingReq,
        fid: Hash,
        deadline: Instant,
    ) -> Result<(), FundingError> {
        for (idx, asset) in req.state.outcome.assets.iter().enumerate() {
            let balance = req.state.outcome.balances[req.part_idx][idx];
            if balance.is_zero() {
                continue;
            }
            let entry = self.entry(asset)?;
            let held = self.ledger.holdings(asset, fid).await?;
            if held >= balance {
                debug!(asset = idx, "deposit already present");
                continue;
            }

            let deposit = DepositReq {
                asset: *asset,
                account: entry.account,
                funding_id: fid,
                balance: balance - held,
            };
            let txs = entry.depositor.deposit(&*self.ledger, &deposit).await?;
            debug_assert_eq!(txs.len(), entry.depositor.num_tx());
            for tx in txs {
                self.ledger
                    .await_confirmation(tx, self.finality_depth, deadline)
                    .await?;
            }
            debug!(asset = idx, amount = %deposit.balance, "deposit confirmed");
        }
        Ok(())
    }

    /// Participants whose deposits do not cover their initial balance yet.
    pub async fn missing(&self, req: &FundingReq) -> Result<Vec<PartIdx>, LedgerError> {
        let channel = req.params.channel_id();
        let mut missing = vec![];
        for (part_idx, participant) in req.params.participants.iter().enumerate() {
            let fid = funding_id(channel, *participant);
            for (idx, asset) in req.state.outcome.assets.iter().enumerate() {
                let needed: U256 = req.state.outcome.balances[part_idx][idx];
                if needed.is_zero() {
                    continue;
                }
                if self.ledger.holdings(asset, fid).await? < needed {
                    missing.push(part_idx);
                    break;
                }
            }
        }
        Ok(missing)
    }

    async fn await_funded(&self, req: &FundingReq, deadline: Instant) -> Result<(), FundingError> {
        loop {
            let missing = self.missing(req).await?;
            if missing.is_empty() {
                info!("channel funded");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FundingError::Timeout { missing });
            }
            tokio::time::sleep_until(deadline.min(now + self.poll_interval)).await;
        }
    }
}
