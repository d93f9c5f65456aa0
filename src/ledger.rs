//! The on-chain side of a channel as seen by the funder and the adjudicator.
//!
//! A [Ledger] accepts transactions against the deposit holders and the
//! adjudicator contract and answers read queries about their state. It is
//! the single arbiter of last resort: whatever it reports is the truth the
//! local components re-derive their view from.

mod simulated;

pub use simulated::SimulatedLedger;

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::{Asset, PartIdx, SignedState, SignedWithdrawalAuth},
};
use async_trait::async_trait;
use core::fmt::Debug;
use thiserror::Error;
use tokio::time::Instant;

pub type TxHash = Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Allow the deposit holder of a token asset to pull `amount` from `owner`.
    Approve {
        asset: Asset,
        owner: Address,
        amount: U256,
    },
    /// Credit `amount` from `from` to the holdings of `funding_id`.
    Deposit {
        asset: Asset,
        funding_id: Hash,
        from: Address,
        amount: U256,
    },
    /// Register a fully signed state, or refute a registered one with a
    /// higher version.
    Register(SignedState),
    /// Conclude a registered channel after its challenge window elapsed.
    Conclude(Hash),
    /// Conclude with a final, fully signed state without a challenge window.
    ConcludeFinal(SignedState),
    /// Pay out one participant's share of one asset after conclusion.
    Withdraw {
        asset: Asset,
        auth: SignedWithdrawalAuth,
    },
}

impl Transaction {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Transaction::Approve { .. } => "approve",
            Transaction::Deposit { .. } => "deposit",
            Transaction::Register(_) => "register",
            Transaction::Conclude(_) => "conclude",
            Transaction::ConcludeFinal(_) => "conclude_final",
            Transaction::Withdraw { .. } => "withdraw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx: TxHash,
    /// Block the transaction was included in.
    pub block: u64,
    /// Number of blocks on top of and including `block`.
    pub confirmations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// Registered, refutations are possible until the timeout.
    Dispute,
    Concluded,
}

/// On-chain record of a registered channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainDispute {
    pub state: SignedState,
    /// Ledger time at which the challenge window ends.
    pub timeout: u64,
    pub phase: ChannelPhase,
    /// How often the first registration was superseded.
    pub refutations: u32,
    /// `withdrawn[participant][asset]`
    pub withdrawn: Vec<Vec<bool>>,
}

impl OnChainDispute {
    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub fn has_withdrawn(&self, part_idx: PartIdx, asset: usize) -> bool {
        self.withdrawn
            .get(part_idx)
            .and_then(|w| w.get(asset))
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Unreachable(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("transaction not confirmed before the deadline")]
    Timeout,
}

impl LedgerError {
    /// The same call may succeed later. Retrying is left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unreachable(_))
    }
}

#[async_trait]
pub trait Ledger: Debug + Send + Sync {
    /// Hand `tx` to the ledger. A rejected transaction is never included.
    async fn submit(&self, tx: Transaction) -> Result<TxHash, LedgerError>;

    /// Wait until `tx` has `finality_depth` confirmations.
    async fn await_confirmation(
        &self,
        tx: TxHash,
        finality_depth: u64,
        deadline: Instant,
    ) -> Result<Receipt, LedgerError>;

    /// Registration record of `channel`, if any.
    async fn dispute(&self, channel: Hash) -> Result<Option<OnChainDispute>, LedgerError>;

    /// Amount held by the deposit holder of `asset` for `funding_id`.
    async fn holdings(&self, asset: &Asset, funding_id: Hash) -> Result<U256, LedgerError>;

    /// Balance of an external account.
    async fn balance(&self, asset: &Asset, account: Address) -> Result<U256, LedgerError>;

    /// Current ledger time in seconds.
    async fn timestamp(&self) -> Result<u64, LedgerError>;
}
