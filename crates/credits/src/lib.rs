//! Credit ledger domain (append-only transaction log + cached balance).
//!
//! Pure domain logic only: no IO, no persistence concerns. Storage backends in
//! `genforge-infra` use these types and the balance arithmetic defined here.

pub mod balance;
pub mod error;
pub mod transaction;

pub use balance::{BalanceAudit, Posting, apply, replay, verify_chain};
pub use error::LedgerError;
pub use transaction::{CreditTransaction, Credits, TransactionKind};
