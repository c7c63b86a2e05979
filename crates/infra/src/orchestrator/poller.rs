//! Centralized status sweep over every non-terminal job.
//!
//! One sweep:
//!
//! 1. fail `pending` rows older than the claim lease (crashed submissions)
//! 2. settle refunds for failed jobs whose refund was never recorded
//! 3. claim due `submitted`/`waiting` jobs and poll them, at most
//!    `poll_concurrency` at a time
//!
//! A claimed job is only ever moved by the holder of its claim token, and
//! only the call whose terminal transition succeeded refunds and notifies.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use genforge_generation::{ErrorKind, GenerationJob, classify_failure};
use genforge_providers::{PollOutcome, ProviderRegistry, ProviderTaskId};

use super::refunds::settle_refund;
use crate::config::OrchestratorConfig;
use crate::jobs::{ClaimToken, ClaimedJob, JobStore, JobStoreError, lease_duration};
use crate::ledger::CreditLedger;
use crate::materializer::ResultMaterializer;
use crate::notifier::Notifier;

#[derive(Debug, Error)]
pub enum PollerError {
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting: usize,
    /// Claimed jobs this sweep could not move (claim lost or store error).
    pub skipped: usize,
    pub refunds: usize,
    pub abandoned: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed { refunded } => {
                self.failed += 1;
                if refunded {
                    self.refunds += 1;
                }
            }
            JobOutcome::Waiting => self.waiting += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed { refunded: bool },
    Waiting,
    Skipped,
}

pub struct StatusPoller {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    providers: ProviderRegistry,
    materializer: ResultMaterializer,
    notifier: Notifier,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for StatusPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPoller")
            .field("providers", &self.providers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StatusPoller {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        providers: ProviderRegistry,
        materializer: ResultMaterializer,
        notifier: Notifier,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            jobs,
            ledger,
            providers,
            materializer,
            notifier,
            config,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn run_sweep(&self) -> Result<SweepReport, PollerError> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let abandoned = self
            .jobs
            .fail_abandoned(now - lease_duration(self.config.claim_lease), now)
            .await?;
        for job in &abandoned {
            warn!(job_id = %job.id, "pending job abandoned by its submitter");
            self.notifier.job_finished(job);
        }
        report.abandoned = abandoned.len();

        for job in self.jobs.pending_refunds(self.config.poll_batch_size).await? {
            match settle_refund(self.ledger.as_ref(), self.jobs.as_ref(), &job).await {
                Ok(outcome) if outcome.was_applied() => report.refunds += 1,
                Ok(_) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "refund settlement failed"),
            }
        }

        let claimed = self
            .jobs
            .claim_due(now, self.config.claim_lease, self.config.poll_batch_size)
            .await?;
        report.claimed = claimed.len();

        let outcomes: Vec<JobOutcome> = stream::iter(claimed)
            .map(|claim| self.process(claim))
            .buffer_unordered(self.config.poll_concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        Ok(report)
    }

    async fn process(&self, claim: ClaimedJob) -> JobOutcome {
        let ClaimedJob { job, token, .. } = claim;
        match self.drive(&job, token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "job store error while polling");
                if let Err(e) = self.jobs.release(job.id, token).await {
                    warn!(job_id = %job.id, error = %e, "failed to release claim");
                }
                JobOutcome::Skipped
            }
        }
    }

    async fn drive(&self, job: &GenerationJob, token: ClaimToken) -> Result<JobOutcome, JobStoreError> {
        if job.attempts >= self.config.max_poll_attempts {
            let detail = format!("no terminal answer after {} polls", job.attempts);
            return self.finish_failed(job, token, ErrorKind::Timeout, &detail).await;
        }

        let Some(task_id) = job.provider_task_id.clone().map(ProviderTaskId::new) else {
            return self
                .finish_failed(job, token, ErrorKind::SubmissionError, "job has no provider task id")
                .await;
        };
        let Some(adapter) = self.providers.get(job.provider) else {
            warn!(job_id = %job.id, provider = %job.provider, "provider not configured; counting attempt");
            return self.wait(job, token).await;
        };

        let outcome = match timeout(self.config.provider_call_timeout, adapter.poll(&task_id)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "poll failed; will retry");
                return self.wait(job, token).await;
            }
            Err(_) => {
                warn!(job_id = %job.id, "poll timed out; will retry");
                return self.wait(job, token).await;
            }
        };

        match outcome {
            PollOutcome::Waiting => self.wait(job, token).await,
            PollOutcome::Succeeded { asset_url } => {
                match self.materializer.materialize(job, &asset_url).await {
                    Ok(url) => self.finish_completed(job, token, &url).await,
                    Err(e) => {
                        self.finish_failed(job, token, ErrorKind::MaterializationError, &e.to_string())
                            .await
                    }
                }
            }
            PollOutcome::Failed { detail } => {
                let kind = classify_failure(&detail);
                self.finish_failed(job, token, kind, &detail).await
            }
        }
    }

    async fn wait(&self, job: &GenerationJob, token: ClaimToken) -> Result<JobOutcome, JobStoreError> {
        if self.jobs.record_wait(job.id, token, Utc::now()).await? {
            debug!(job_id = %job.id, attempts = job.attempts + 1, "still waiting");
            Ok(JobOutcome::Waiting)
        } else {
            Ok(JobOutcome::Skipped)
        }
    }

    async fn finish_completed(
        &self,
        job: &GenerationJob,
        token: ClaimToken,
        url: &str,
    ) -> Result<JobOutcome, JobStoreError> {
        let now = Utc::now();
        if !self.jobs.complete(job.id, token, url, now).await? {
            warn!(job_id = %job.id, "claim lost before completion");
            return Ok(JobOutcome::Skipped);
        }
        info!(job_id = %job.id, user_id = %job.owner_id, result_url = %url, "job completed");

        let mut done = job.clone();
        done.complete(url, now)?;
        self.notifier.job_finished(&done);
        Ok(JobOutcome::Completed)
    }

    async fn finish_failed(
        &self,
        job: &GenerationJob,
        token: ClaimToken,
        kind: ErrorKind,
        detail: &str,
    ) -> Result<JobOutcome, JobStoreError> {
        let now = Utc::now();
        if !self.jobs.fail(job.id, token, kind, detail, now).await? {
            warn!(job_id = %job.id, "claim lost before failure");
            return Ok(JobOutcome::Skipped);
        }
        info!(job_id = %job.id, user_id = %job.owner_id, error_kind = %kind, detail, "job failed");

        let mut failed = job.clone();
        failed.fail(kind, detail, now)?;
        // an unsettled refund is picked up by the next sweep
        let refunded = match settle_refund(self.ledger.as_ref(), self.jobs.as_ref(), &failed).await {
            Ok(outcome) => outcome.was_applied(),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "refund deferred to next sweep");
                false
            }
        };
        self.notifier.job_finished(&failed);
        Ok(JobOutcome::Failed { refunded })
    }
}
