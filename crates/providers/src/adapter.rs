use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use genforge_generation::{GenerationParams, MediaKind, ModelError, ProviderId};

/// Opaque handle a provider returns for a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderTaskId(String);

impl ProviderTaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ProviderTaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProviderTaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Normalized answer to one status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Waiting,
    Succeeded { asset_url: String },
    Failed { detail: String },
}

/// The provider did not accept the task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// Provider refused the request (4xx or an explicit error code).
    #[error("rejected by provider ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Provider outage or transport failure.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call timed out")]
    Timeout,

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// The adapter has no route for this media kind.
    #[error("{provider} does not support {kind}")]
    Unsupported { provider: ProviderId, kind: MediaKind },

    #[error("{provider} does not offer model {model}")]
    UnsupportedModel { provider: ProviderId, model: String },
}

impl From<ModelError> for SubmissionError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::NoRoute { provider, kind } => SubmissionError::Unsupported { provider, kind },
            ModelError::NotOffered { provider, model, .. } => {
                SubmissionError::UnsupportedModel { provider, model }
            }
        }
    }
}

/// A status check could not be completed. Always transient for the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider call timed out")]
    Timeout,

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("malformed task id: {0}")]
    InvalidTaskId(String),
}

/// Uniform contract implemented once per generation backend.
///
/// Implementations must not touch credits; `poll` is a single non-blocking
/// status check with no retries of its own.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn submit(
        &self,
        kind: MediaKind,
        params: &GenerationParams,
    ) -> Result<ProviderTaskId, SubmissionError>;

    async fn poll(&self, task_id: &ProviderTaskId) -> Result<PollOutcome, PollError>;
}
