//! Generation job storage.
//!
//! ## Design
//!
//! - A job row is inserted `pending` by the submitter and moved to `submitted`
//!   once the provider returned a task id
//! - The poller claims due jobs with a lease (`claim_due`) before polling
//!   them; every post-submission transition is conditional on the claim token
//!   and on the job still being non-terminal
//! - Transition methods return `true` only for the call that performed the
//!   transition, so a refund is issued by exactly one caller
//! - `refunded_at` records that the refund for a failed job was settled;
//!   `pending_refunds` finds failed jobs whose refund never got recorded
//!
//! ## Components
//!
//! - `JobStore`: storage abstraction
//! - `InMemoryJobStore`: tests/dev
//! - `PostgresJobStore`: durable store with `FOR UPDATE SKIP LOCKED` claims

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use genforge_core::{JobId, UserId};
use genforge_generation::{ErrorKind, GenerationJob, JobStatus, TransitionError};

use crate::pagination::{Page, Pagination};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Identifies one claim taken by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A job leased to the caller until `expires_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: GenerationJob,
    pub token: ClaimToken,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("only pending jobs can be inserted (got {0})")]
    NotPending(JobStatus),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("job storage error: {0}")]
    Storage(String),
}

/// Convert a lease length into a chrono duration, saturating on overflow.
pub(crate) fn lease_duration(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created job. Must be `pending`.
    async fn insert(&self, job: &GenerationJob) -> Result<(), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<GenerationJob>, JobStoreError>;

    /// Like `get`, but `None` unless `owner_id` owns the job.
    async fn get_for_owner(
        &self,
        owner_id: UserId,
        id: JobId,
    ) -> Result<Option<GenerationJob>, JobStoreError>;

    /// Newest first.
    async fn list_for_owner(
        &self,
        owner_id: UserId,
        pagination: Pagination,
    ) -> Result<Page<GenerationJob>, JobStoreError>;

    /// `pending -> submitted`.
    async fn mark_submitted(&self, id: JobId, task_id: &str) -> Result<bool, JobStoreError>;

    /// `pending -> failed` when the provider call did not produce a task.
    async fn fail_unsubmitted(
        &self,
        id: JobId,
        kind: ErrorKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Fail `pending` rows created before `created_before`. Returns the jobs
    /// this call failed.
    async fn fail_abandoned(
        &self,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, JobStoreError>;

    /// Claim up to `limit` `submitted`/`waiting` jobs whose lease is free or
    /// expired, least recently polled first.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, JobStoreError>;

    /// Non-terminal poll answer: count the attempt and release the claim.
    async fn record_wait(
        &self,
        id: JobId,
        token: ClaimToken,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    async fn complete(
        &self,
        id: JobId,
        token: ClaimToken,
        result_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    async fn fail(
        &self,
        id: JobId,
        token: ClaimToken,
        kind: ErrorKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Drop a claim without touching the job.
    async fn release(&self, id: JobId, token: ClaimToken) -> Result<bool, JobStoreError>;

    /// Failed jobs whose refund has not been recorded, oldest failure first.
    async fn pending_refunds(&self, limit: usize) -> Result<Vec<GenerationJob>, JobStoreError>;

    async fn mark_refunded(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError>;
}
