//! Credit ledger storage.
//!
//! The transaction log is authoritative; the per-user balance is a cached
//! projection kept in step with it inside the same atomic unit. Every backend
//! applies the arithmetic in `genforge_credits::apply`.
//!
//! Guarantees:
//! - `reserve` is a single conditional decrement; concurrent reserves for one
//!   user are linearized and can never overdraw
//! - at most one `refund` per job id, enforced by the ledger itself

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use genforge_core::{JobId, UserId};
use genforge_credits::{BalanceAudit, CreditTransaction, Credits, LedgerError};

use crate::pagination::{Page, Pagination};

pub use in_memory::InMemoryCreditLedger;
pub use postgres::PostgresCreditLedger;

#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerStoreError {
    pub fn is_insufficient_credits(&self) -> bool {
        matches!(self, LedgerStoreError::Ledger(LedgerError::InsufficientCredits { .. }))
    }
}

/// Result of a refund request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    /// A new refund transaction was appended.
    Applied(CreditTransaction),
    /// The job already had a refund; nothing changed.
    AlreadyRefunded(CreditTransaction),
}

impl RefundOutcome {
    pub fn transaction(&self) -> &CreditTransaction {
        match self {
            RefundOutcome::Applied(tx) | RefundOutcome::AlreadyRefunded(tx) => tx,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, RefundOutcome::Applied(_))
    }
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Atomically check `balance >= amount` and debit it.
    async fn reserve(
        &self,
        user_id: UserId,
        amount: Credits,
        reason: &str,
        job_id: Option<JobId>,
    ) -> Result<CreditTransaction, LedgerStoreError>;

    /// Credit `amount` back. Idempotent per `job_id` when one is given.
    async fn refund(
        &self,
        user_id: UserId,
        amount: Credits,
        reason: &str,
        job_id: Option<JobId>,
    ) -> Result<RefundOutcome, LedgerStoreError>;

    /// Signed operator adjustment (grants, purchases, corrections).
    async fn adjust(
        &self,
        user_id: UserId,
        delta: Credits,
        reason: &str,
    ) -> Result<CreditTransaction, LedgerStoreError>;

    async fn balance(&self, user_id: UserId) -> Result<Credits, LedgerStoreError>;

    /// Newest first.
    async fn transactions(
        &self,
        user_id: UserId,
        pagination: Pagination,
    ) -> Result<Page<CreditTransaction>, LedgerStoreError>;

    /// All transactions referencing `job_id`, oldest first.
    async fn transactions_for_job(
        &self,
        job_id: JobId,
    ) -> Result<Vec<CreditTransaction>, LedgerStoreError>;

    /// Replay the user's log and compare with the cached balance.
    async fn audit(&self, user_id: UserId) -> Result<BalanceAudit, LedgerStoreError>;
}
