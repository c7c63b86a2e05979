//! Caller-facing operations, transport agnostic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use genforge_core::{JobId, UserId};
use genforge_credits::{CreditTransaction, Credits};
use genforge_generation::{ErrorKind, GenerationJob, JobStatus, MediaKind, ProviderId};

use super::submitter::{JobSubmitter, SubmitError, SubmitReceipt, SubmitRequest};
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::{CreditLedger, LedgerStoreError};
use crate::pagination::{Page, Pagination};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerStoreError),
}

/// A job as its owner sees it. Non-terminal states read as `pending`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub provider: ProviderId,
    pub kind: MediaKind,
    pub status: JobStatus,
    pub credits_reserved: Credits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<GenerationJob> for JobView {
    fn from(job: GenerationJob) -> Self {
        Self {
            job_id: job.id,
            provider: job.provider,
            kind: job.kind,
            status: job.public_status(),
            credits_reserved: job.credits_reserved,
            result_url: job.result_url,
            error_kind: job.error_kind,
            error_detail: job.error_detail,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

pub type JobPage = Page<JobView>;

#[derive(Clone)]
pub struct GenerationService {
    submitter: Arc<JobSubmitter>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
}

impl std::fmt::Debug for GenerationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationService")
            .field("submitter", &self.submitter)
            .finish_non_exhaustive()
    }
}

impl GenerationService {
    pub fn new(
        submitter: Arc<JobSubmitter>,
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self {
            submitter,
            jobs,
            ledger,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        self.submitter.submit(request).await
    }

    /// Only the owner can see a job; anyone else gets `NotFound`.
    #[instrument(skip(self), fields(user_id = %user_id, job_id = %job_id), err)]
    pub async fn check(&self, user_id: UserId, job_id: JobId) -> Result<JobView, ServiceError> {
        self.jobs
            .get_for_owner(user_id, job_id)
            .await?
            .map(JobView::from)
            .ok_or(ServiceError::NotFound(job_id))
    }

    pub async fn list(&self, user_id: UserId, pagination: Pagination) -> Result<JobPage, ServiceError> {
        Ok(self
            .jobs
            .list_for_owner(user_id, pagination)
            .await?
            .map(JobView::from))
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Credits, ServiceError> {
        Ok(self.ledger.balance(user_id).await?)
    }

    pub async fn transactions(
        &self,
        user_id: UserId,
        pagination: Pagination,
    ) -> Result<Page<CreditTransaction>, ServiceError> {
        Ok(self.ledger.transactions(user_id, pagination).await?)
    }

    /// Credit grants and purchases from outside the orchestration core.
    #[instrument(skip(self, reason), fields(user_id = %user_id), err)]
    pub async fn adjust(
        &self,
        user_id: UserId,
        delta: Credits,
        reason: &str,
    ) -> Result<CreditTransaction, ServiceError> {
        Ok(self.ledger.adjust(user_id, delta, reason).await?)
    }
}
