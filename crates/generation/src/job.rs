//! Generation job and its state machine.
//!
//! `pending -> submitted -> waiting* -> completed | failed`.
//! Terminal states accept no transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use genforge_core::{JobId, UserId};
use genforge_credits::Credits;

use crate::error_kind::ErrorKind;
use crate::kind::{MediaKind, ProviderId};
use crate::params::GenerationParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created inside the submitter; no provider task yet.
    Pending,
    /// Provider accepted the task.
    Submitted,
    /// Polled at least once without a terminal answer.
    Waiting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Status as callers see it: every non-terminal state reads as `pending`.
    pub fn public(&self) -> JobStatus {
        if self.is_terminal() { *self } else { JobStatus::Pending }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Submitted => "submitted",
            JobStatus::Waiting => "waiting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "submitted" => Some(JobStatus::Submitted),
            "waiting" => Some(JobStatus::Waiting),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job is already {0}")]
    Terminal(JobStatus),

    #[error("illegal transition from {from} to {to}")]
    Illegal { from: JobStatus, to: JobStatus },

    #[error("provider task id must not be empty")]
    MissingTaskId,

    #[error("result url must not be empty")]
    MissingResultUrl,
}

/// One user-initiated request to generate one media asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub owner_id: UserId,
    pub provider: ProviderId,
    pub provider_task_id: Option<String>,
    pub kind: MediaKind,
    pub params: GenerationParams,
    /// Fixed at creation; never recomputed.
    pub credits_reserved: Credits,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn new(
        id: JobId,
        owner_id: UserId,
        provider: ProviderId,
        kind: MediaKind,
        params: GenerationParams,
        credits_reserved: Credits,
    ) -> Self {
        Self {
            id,
            owner_id,
            provider,
            provider_task_id: None,
            kind,
            params,
            credits_reserved,
            status: JobStatus::Pending,
            result_url: None,
            error_kind: None,
            error_detail: None,
            attempts: 0,
            created_at: Utc::now(),
            last_polled_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn public_status(&self) -> JobStatus {
        self.status.public()
    }

    fn guard(&self, to: JobStatus, allowed: &[JobStatus]) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if !allowed.contains(&self.status) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    pub fn mark_submitted(&mut self, task_id: impl Into<String>) -> Result<(), TransitionError> {
        self.guard(JobStatus::Submitted, &[JobStatus::Pending])?;
        let task_id = task_id.into();
        if task_id.trim().is_empty() {
            return Err(TransitionError::MissingTaskId);
        }
        self.provider_task_id = Some(task_id);
        self.status = JobStatus::Submitted;
        Ok(())
    }

    /// A poll that did not reach a terminal answer.
    pub fn record_wait(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.guard(JobStatus::Waiting, &[JobStatus::Submitted, JobStatus::Waiting])?;
        self.status = JobStatus::Waiting;
        self.attempts += 1;
        self.last_polled_at = Some(at);
        Ok(())
    }

    pub fn complete(
        &mut self,
        result_url: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.guard(JobStatus::Completed, &[JobStatus::Submitted, JobStatus::Waiting])?;
        let url = result_url.into();
        if url.trim().is_empty() {
            return Err(TransitionError::MissingResultUrl);
        }
        self.status = JobStatus::Completed;
        self.result_url = Some(url);
        self.attempts += 1;
        self.last_polled_at = Some(at);
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn fail(
        &mut self,
        kind: ErrorKind,
        detail: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.guard(
            JobStatus::Failed,
            &[JobStatus::Pending, JobStatus::Submitted, JobStatus::Waiting],
        )?;
        self.status = JobStatus::Failed;
        self.error_kind = Some(kind);
        self.error_detail = Some(detail.into());
        self.completed_at = Some(at);
        Ok(())
    }

    /// Exactly one of result/error once terminal; neither before.
    pub fn outcome_is_consistent(&self) -> bool {
        match self.status {
            JobStatus::Completed => self.result_url.is_some() && self.error_kind.is_none(),
            JobStatus::Failed => self.result_url.is_none() && self.error_kind.is_some(),
            _ => self.result_url.is_none() && self.error_kind.is_none(),
        }
    }
}
