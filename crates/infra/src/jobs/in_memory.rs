use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use genforge_core::{JobId, UserId};
use genforge_generation::{ErrorKind, GenerationJob, JobStatus, TransitionError};

use super::{ClaimToken, ClaimedJob, JobStore, JobStoreError, lease_duration};
use crate::pagination::{Page, Pagination};

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: ClaimToken,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    job: GenerationJob,
    claim: Option<Lease>,
    refunded_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn holds(&self, token: ClaimToken) -> bool {
        self.claim.is_some_and(|l| l.token == token)
    }

    fn claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.job.status, JobStatus::Submitted | JobStatus::Waiting)
            && self.claim.is_none_or(|l| l.expires_at <= now)
    }
}

/// In-memory job store.
///
/// Intended for tests/dev. Every transition happens under one write lock, so
/// the conditional checks and the mutation are atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    entries: RwLock<HashMap<JobId, Entry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("lock poisoned".to_string())
    }

    /// Apply `f` to a claimed job, releasing the claim on success. Returns
    /// `false` when the claim is not held or the job is already terminal.
    fn with_claim(
        &self,
        id: JobId,
        token: ClaimToken,
        f: impl FnOnce(&mut GenerationJob) -> Result<(), TransitionError>,
    ) -> Result<bool, JobStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if !entry.holds(token) || entry.job.is_terminal() {
            return Ok(false);
        }
        f(&mut entry.job)?;
        entry.claim = None;
        Ok(true)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &GenerationJob) -> Result<(), JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::NotPending(job.status));
        }
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if entries.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        entries.insert(
            job.id,
            Entry {
                job: job.clone(),
                claim: None,
                refunded_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(&id).map(|e| e.job.clone()))
    }

    async fn get_for_owner(
        &self,
        owner_id: UserId,
        id: JobId,
    ) -> Result<Option<GenerationJob>, JobStoreError> {
        Ok(self.get(id).await?.filter(|j| j.owner_id == owner_id))
    }

    async fn list_for_owner(
        &self,
        owner_id: UserId,
        pagination: Pagination,
    ) -> Result<Page<GenerationJob>, JobStoreError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let mut jobs: Vec<GenerationJob> = entries
            .values()
            .filter(|e| e.job.owner_id == owner_id)
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(Page::new(
            pagination.apply(&jobs),
            jobs.len() as u64,
            pagination,
        ))
    }

    async fn mark_submitted(&self, id: JobId, task_id: &str) -> Result<bool, JobStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if entry.job.status != JobStatus::Pending {
            return Ok(false);
        }
        entry.job.mark_submitted(task_id)?;
        Ok(true)
    }

    async fn fail_unsubmitted(
        &self,
        id: JobId,
        kind: ErrorKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if entry.job.status != JobStatus::Pending {
            return Ok(false);
        }
        entry.job.fail(kind, detail, at)?;
        Ok(true)
    }

    async fn fail_abandoned(
        &self,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let mut failed = Vec::new();
        for entry in entries.values_mut() {
            if entry.job.status == JobStatus::Pending && entry.job.created_at < created_before {
                entry.job.fail(
                    ErrorKind::SubmissionError,
                    "submission did not finish",
                    at,
                )?;
                failed.push(entry.job.clone());
            }
        }
        Ok(failed)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let mut due: Vec<&mut Entry> = entries.values_mut().filter(|e| e.claimable(now)).collect();
        // never-polled first, then oldest poll, then oldest job
        due.sort_by(|a, b| {
            a.job
                .last_polled_at
                .cmp(&b.job.last_polled_at)
                .then(a.job.created_at.cmp(&b.job.created_at))
        });

        let token = ClaimToken::new();
        let expires_at = now + lease_duration(lease);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.claim = Some(Lease { token, expires_at });
                ClaimedJob {
                    job: entry.job.clone(),
                    token,
                    expires_at,
                }
            })
            .collect())
    }

    async fn record_wait(
        &self,
        id: JobId,
        token: ClaimToken,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.with_claim(id, token, |job| job.record_wait(at))
    }

    async fn complete(
        &self,
        id: JobId,
        token: ClaimToken,
        result_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.with_claim(id, token, |job| job.complete(result_url, at))
    }

    async fn fail(
        &self,
        id: JobId,
        token: ClaimToken,
        kind: ErrorKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.with_claim(id, token, |job| job.fail(kind, detail, at))
    }

    async fn release(&self, id: JobId, token: ClaimToken) -> Result<bool, JobStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if !entry.holds(token) {
            return Ok(false);
        }
        entry.claim = None;
        Ok(true)
    }

    async fn pending_refunds(&self, limit: usize) -> Result<Vec<GenerationJob>, JobStoreError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let mut jobs: Vec<GenerationJob> = entries
            .values()
            .filter(|e| e.job.status == JobStatus::Failed && e.refunded_at.is_none())
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.completed_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn mark_refunded(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        let entry = entries.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if entry.job.status != JobStatus::Failed || entry.refunded_at.is_some() {
            return Ok(false);
        }
        entry.refunded_at = Some(at);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genforge_generation::{GenerationParams, MediaKind, ProviderId};

    fn pending(owner: UserId) -> GenerationJob {
        GenerationJob::new(
            JobId::new(),
            owner,
            ProviderId::Replicate,
            MediaKind::Image,
            GenerationParams::with_prompt("a lighthouse"),
            4,
        )
    }

    async fn submitted(store: &InMemoryJobStore) -> GenerationJob {
        let job = pending(UserId::new());
        store.insert(&job).await.unwrap();
        assert!(store.mark_submitted(job.id, "task-1").await.unwrap());
        store.get(job.id).await.unwrap().unwrap()
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn pending_jobs_are_never_claimed() {
        let store = InMemoryJobStore::new();
        store.insert(&pending(UserId::new())).await.unwrap();

        let claimed = store.claim_due(Utc::now(), LEASE, 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn claimed_job_is_not_claimed_again_until_lease_expires() {
        let store = InMemoryJobStore::new();
        let job = submitted(&store).await;
        let now = Utc::now();

        let first = store.claim_due(now, LEASE, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].job.id, job.id);
        assert!(store.claim_due(now, LEASE, 10).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(61);
        let reclaimed = store.claim_due(later, LEASE, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_ne!(reclaimed[0].token, first[0].token);

        // the stale claim can no longer act
        let stale = store
            .fail(job.id, first[0].token, ErrorKind::Timeout, "late", later)
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn only_one_terminal_transition_wins() {
        let store = InMemoryJobStore::new();
        let job = submitted(&store).await;
        let claim = store.claim_due(Utc::now(), LEASE, 1).await.unwrap().remove(0);

        let failed = store
            .fail(job.id, claim.token, ErrorKind::ProviderFailure, "boom", Utc::now())
            .await
            .unwrap();
        let completed = store
            .complete(job.id, claim.token, "/media/x.png", Utc::now())
            .await
            .unwrap();

        assert!(failed);
        assert!(!completed);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.outcome_is_consistent());
    }

    #[tokio::test]
    async fn record_wait_counts_attempts_and_releases_claim() {
        let store = InMemoryJobStore::new();
        let job = submitted(&store).await;
        let now = Utc::now();

        let claim = store.claim_due(now, LEASE, 1).await.unwrap().remove(0);
        assert!(store.record_wait(job.id, claim.token, now).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.attempts, 1);
        assert_eq!(store.claim_due(now, LEASE, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refunds_are_settled_once() {
        let store = InMemoryJobStore::new();
        let job = pending(UserId::new());
        store.insert(&job).await.unwrap();
        assert!(
            store
                .fail_unsubmitted(job.id, ErrorKind::SubmissionError, "rejected", Utc::now())
                .await
                .unwrap()
        );

        assert_eq!(store.pending_refunds(10).await.unwrap().len(), 1);
        assert!(store.mark_refunded(job.id, Utc::now()).await.unwrap());
        assert!(!store.mark_refunded(job.id, Utc::now()).await.unwrap());
        assert!(store.pending_refunds(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_pending_rows_are_failed_once() {
        let store = InMemoryJobStore::new();
        let job = pending(UserId::new());
        store.insert(&job).await.unwrap();
        let cutoff = job.created_at + chrono::Duration::seconds(1);

        let failed = store.fail_abandoned(cutoff, Utc::now()).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_kind, Some(ErrorKind::SubmissionError));
        assert!(store.fail_abandoned(cutoff, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_scoping() {
        let store = InMemoryJobStore::new();
        let owner = UserId::new();
        let job = pending(owner);
        store.insert(&job).await.unwrap();
        store.insert(&pending(UserId::new())).await.unwrap();

        assert!(store.get_for_owner(owner, job.id).await.unwrap().is_some());
        assert!(store.get_for_owner(UserId::new(), job.id).await.unwrap().is_none());
        let page = store.list_for_owner(owner, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
    }
}
