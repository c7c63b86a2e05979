//! Errors raised by pure domain code.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Caller input that can never succeed, whatever the state of the system.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Generation parameters out of range or missing.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Identifier that does not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
