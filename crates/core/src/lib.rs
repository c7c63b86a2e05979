//! `genforge-core`: identifiers and the domain error shared by every crate.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TransactionId, UserId};
