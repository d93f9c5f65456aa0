use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::Asset,
    ledger::{Ledger, LedgerError, Transaction, TxHash},
};
use async_trait::async_trait;
use core::fmt::Debug;

/// A single deposit of `balance` into the holdings of `funding_id`, paid by
/// the on-chain `account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositReq {
    pub asset: Asset,
    pub account: Address,
    pub funding_id: Hash,
    pub balance: U256,
}

/// Moves funds of one asset type into its deposit holder.
///
/// Implementations carry no per-call state and can be shared between
/// channels. They do not retry, an unreachable ledger is reported as is.
#[async_trait]
pub trait Depositor: Debug + Send + Sync {
    async fn deposit(&self, ledger: &dyn Ledger, req: &DepositReq)
        -> Result<Vec<TxHash>, LedgerError>;

    /// Number of transactions one call to [Depositor::deposit] produces.
    fn num_tx(&self) -> usize;
}

/// Deposits the ledger's native currency with a single transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDepositor;

#[async_trait]
impl Depositor for NativeDepositor {
    async fn deposit(
        &self,
        ledger: &dyn Ledger,
        req: &DepositReq,
    ) -> Result<Vec<TxHash>, LedgerError> {
        let tx = ledger
            .submit(Transaction::Deposit {
                asset: req.asset,
                funding_id: req.funding_id,
                from: req.account,
                amount: req.balance,
            })
            .await?;
        Ok(vec![tx])
    }

    fn num_tx(&self) -> usize {
        1
    }
}

/// Deposits a token: approves the deposit holder first, then deposits.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenDepositor;

#[async_trait]
impl Depositor for TokenDepositor {
    async fn deposit(
        &self,
        ledger: &dyn Ledger,
        req: &DepositReq,
    ) -> Result<Vec<TxHash>, LedgerError> {
        let approve = ledger
            .submit(Transaction::Approve {
                asset: req.asset,
                owner: req.account,
                amount: req.balance,
            })
            .await?;
        let deposit = NativeDepositor.deposit(ledger, req).await?;
        Ok([vec![approve], deposit].concat())
    }

    fn num_tx(&self) -> usize {
        2
    }
}
