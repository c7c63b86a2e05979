//! Turns a user request into a reserved, submitted job.
//!
//! Order of effects:
//!
//! 1. validate and price (pure, no IO)
//! 2. `reserve` on the ledger; insufficient credits stops here with no job
//! 3. insert the job row as `pending`
//! 4. `submit` to the provider under a per-call timeout
//! 5. `pending -> submitted`, or on failure `pending -> failed` plus refund
//!
//! The `pending` row exists before the provider call so that a crash between
//! reserve and submit leaves a record the poller can fail and refund.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use genforge_core::{DomainError, JobId, UserId};
use genforge_credits::{Credits, LedgerError};
use genforge_generation::{
    ErrorKind, GenerationJob, GenerationParams, JobStatus, MediaKind, PricingError, ProviderId,
    cost,
};
use genforge_providers::{ProviderRegistry, SubmissionError};

use super::refunds::settle_refund;
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::{CreditLedger, LedgerStoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub provider: ProviderId,
    pub kind: MediaKind,
    pub params: GenerationParams,
}

/// What the caller gets back immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    pub credits_reserved: Credits,
    pub credits_remaining: Credits,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    InvalidRequest(#[from] DomainError),

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error("provider {0} is not configured")]
    ProviderNotConfigured(ProviderId),

    #[error("insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits { available: Credits, requested: Credits },

    #[error("submission failed: {source}")]
    Submission {
        job_id: JobId,
        #[source]
        source: SubmissionError,
    },

    /// The row was failed by crash recovery while the provider call ran.
    #[error("job {0} was abandoned before submission completed")]
    Abandoned(JobId),

    #[error(transparent)]
    Ledger(LedgerStoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

impl From<LedgerStoreError> for SubmitError {
    fn from(e: LedgerStoreError) -> Self {
        match e {
            LedgerStoreError::Ledger(LedgerError::InsufficientCredits {
                available,
                requested,
            }) => SubmitError::InsufficientCredits {
                available,
                requested,
            },
            other => SubmitError::Ledger(other),
        }
    }
}

impl SubmitError {
    /// Failure kind reported to the caller for this error, if it maps to one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            SubmitError::InsufficientCredits { .. } => Some(ErrorKind::InsufficientCredits),
            SubmitError::Submission { .. } | SubmitError::Abandoned(_) => {
                Some(ErrorKind::SubmissionError)
            }
            _ => None,
        }
    }
}

pub struct JobSubmitter {
    ledger: Arc<dyn CreditLedger>,
    jobs: Arc<dyn JobStore>,
    providers: ProviderRegistry,
    call_timeout: Duration,
}

impl std::fmt::Debug for JobSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSubmitter")
            .field("providers", &self.providers)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl JobSubmitter {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        jobs: Arc<dyn JobStore>,
        providers: ProviderRegistry,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            jobs,
            providers,
            call_timeout,
        }
    }

    /// Returns as soon as the provider accepted the task; never waits for the
    /// result.
    #[instrument(
        skip(self, request),
        fields(user_id = %request.user_id, provider = %request.provider, kind = %request.kind),
        err
    )]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        let SubmitRequest {
            user_id,
            provider,
            kind,
            params,
        } = request;

        params.validate(kind)?;
        let price = cost(provider, kind, &params)?;
        let adapter = self
            .providers
            .get(provider)
            .ok_or(SubmitError::ProviderNotConfigured(provider))?;

        let job_id = JobId::new();
        let reservation = self
            .ledger
            .reserve(user_id, price, &format!("reserve {kind} {job_id}"), Some(job_id))
            .await?;

        let job = GenerationJob::new(job_id, user_id, provider, kind, params, price);
        if let Err(e) = self.jobs.insert(&job).await {
            // no row to recover from, so return the credits now
            if let Err(refund_err) = self
                .ledger
                .refund(user_id, price, &format!("refund {kind} {job_id} (not stored)"), Some(job_id))
                .await
            {
                error!(job_id = %job_id, error = %refund_err, "refund after failed insert did not apply");
            }
            return Err(e.into());
        }

        let submitted = match timeout(self.call_timeout, adapter.submit(kind, &job.params)).await {
            Ok(result) => result,
            Err(_) => Err(SubmissionError::Timeout),
        };

        match submitted {
            Ok(task_id) => {
                if !self.jobs.mark_submitted(job_id, task_id.as_str()).await? {
                    warn!(job_id = %job_id, task_id = %task_id, "job left pending state during submission");
                    return Err(SubmitError::Abandoned(job_id));
                }
                info!(job_id = %job_id, task_id = %task_id, credits = price, "job submitted");
                Ok(SubmitReceipt {
                    job_id,
                    status: JobStatus::Pending,
                    credits_reserved: price,
                    credits_remaining: reservation.balance_after,
                })
            }
            Err(source) => {
                warn!(job_id = %job_id, error = %source, "provider rejected submission");
                let now = Utc::now();
                if self
                    .jobs
                    .fail_unsubmitted(job_id, ErrorKind::SubmissionError, &source.to_string(), now)
                    .await?
                {
                    let mut failed = job;
                    failed.fail(ErrorKind::SubmissionError, source.to_string(), now)?;
                    // a failed settlement is retried by the poller's refund sweep
                    if let Err(e) = settle_refund(self.ledger.as_ref(), self.jobs.as_ref(), &failed).await {
                        error!(job_id = %job_id, error = %e, "refund after submission failure deferred");
                    }
                }
                Err(SubmitError::Submission { job_id, source })
            }
        }
    }
}

impl From<genforge_generation::TransitionError> for SubmitError {
    fn from(e: genforge_generation::TransitionError) -> Self {
        SubmitError::Jobs(JobStoreError::Transition(e))
    }
}
