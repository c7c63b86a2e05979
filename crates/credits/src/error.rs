use thiserror::Error;

use crate::transaction::Credits;

/// Deterministic ledger failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The balance cannot cover the requested debit.
    #[error("insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits { available: Credits, requested: Credits },

    /// Reserve/refund amounts must be strictly positive; adjustments non-zero.
    #[error("invalid amount: {0}")]
    InvalidAmount(Credits),

    /// A stored transaction log does not chain (balance_after mismatch).
    #[error("ledger chain broken at transaction {index}: expected balance {expected}, recorded {recorded}")]
    BrokenChain {
        index: usize,
        expected: Credits,
        recorded: Credits,
    },
}
