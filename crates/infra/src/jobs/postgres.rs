//! Postgres-backed job store.
//!
//! Every transition is a single conditional `UPDATE`; `rows_affected() == 1`
//! tells the caller it performed the transition. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent sweeps never claim the same row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use genforge_core::{JobId, UserId};
use genforge_generation::{
    ErrorKind, GenerationJob, GenerationParams, JobStatus, MediaKind, ProviderId, TransitionError,
};

use super::{ClaimToken, ClaimedJob, JobStore, JobStoreError, lease_duration};
use crate::db;
use crate::pagination::{Page, Pagination};

const JOB_COLUMNS: &str = "id, owner_id, provider, provider_task_id, kind, params, \
     credits_reserved, status, result_url, error_kind, error_detail, attempts, \
     created_at, last_polled_at, completed_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match &err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("?"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn read_err(e: impl core::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(format!("failed to read job row: {e}"))
}

fn job_from_row(row: &PgRow) -> Result<GenerationJob, JobStoreError> {
    let provider: String = row.try_get("provider").map_err(read_err)?;
    let kind: String = row.try_get("kind").map_err(read_err)?;
    let status: String = row.try_get("status").map_err(read_err)?;
    let error_kind: Option<String> = row.try_get("error_kind").map_err(read_err)?;
    let Json(params): Json<GenerationParams> = row.try_get("params").map_err(read_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(read_err)?;

    Ok(GenerationJob {
        id: JobId::from_uuid(row.try_get("id").map_err(read_err)?),
        owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(read_err)?),
        provider: provider.parse::<ProviderId>().map_err(read_err)?,
        provider_task_id: row.try_get("provider_task_id").map_err(read_err)?,
        kind: kind.parse::<MediaKind>().map_err(read_err)?,
        params,
        credits_reserved: row.try_get("credits_reserved").map_err(read_err)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| read_err(format!("unknown status {status}")))?,
        result_url: row.try_get("result_url").map_err(read_err)?,
        error_kind: error_kind
            .map(|k| ErrorKind::parse(&k).ok_or_else(|| read_err(format!("unknown error kind {k}"))))
            .transpose()?,
        error_detail: row.try_get("error_detail").map_err(read_err)?,
        attempts: u32::try_from(attempts).map_err(read_err)?,
        created_at: row.try_get("created_at").map_err(read_err)?,
        last_polled_at: row.try_get("last_polled_at").map_err(read_err)?,
        completed_at: row.try_get("completed_at").map_err(read_err)?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, user_id = %job.owner_id), err)]
    async fn insert(&self, job: &GenerationJob) -> Result<(), JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::NotPending(job.status));
        }
        let attempts = i32::try_from(job.attempts)
            .map_err(|_| JobStoreError::Storage("attempts out of range".into()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO generation_jobs
                (id, owner_id, provider, provider_task_id, kind, params, credits_reserved,
                 status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner_id.as_uuid())
        .bind(job.provider.as_str())
        .bind(job.provider_task_id.as_deref())
        .bind(job.kind.as_str())
        .bind(Json(&job.params))
        .bind(job.credits_reserved)
        .bind(job.status.as_str())
        .bind(attempts)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if db::is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert_job", e)),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_for_owner(
        &self,
        owner_id: UserId,
        id: JobId,
    ) -> Result<Option<GenerationJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 AND owner_id = $2"
        ))
        .bind(id.as_uuid())
        .bind(owner_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job_for_owner", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(user_id = %owner_id), err)]
    async fn list_for_owner(
        &self,
        owner_id: UserId,
        pagination: Pagination,
    ) -> Result<Page<GenerationJob>, JobStoreError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM generation_jobs WHERE owner_id = $1")
                .bind(owner_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE owner_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(owner_id.as_uuid())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let items = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_submitted(&self, id: JobId, task_id: &str) -> Result<bool, JobStoreError> {
        if task_id.trim().is_empty() {
            return Err(TransitionError::MissingTaskId.into());
        }
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'submitted', provider_task_id = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(task_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_submitted", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, detail), fields(job_id = %id), err)]
    async fn fail_unsubmitted(
        &self,
        id: JobId,
        kind: ErrorKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'failed', error_kind = $2, error_detail = $3, completed_at = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(kind.as_str())
        .bind(detail)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_unsubmitted", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn fail_abandoned(
        &self,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE generation_jobs
            SET status = 'failed', error_kind = $2, error_detail = $3, completed_at = $4
            WHERE status = 'pending' AND created_at < $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(created_before)
        .bind(ErrorKind::SubmissionError.as_str())
        .bind("submission did not finish")
        .bind(at)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_abandoned", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedJob>, JobStoreError> {
        let token = ClaimToken::new();
        let expires_at = now + lease_duration(lease);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id FROM generation_jobs
                WHERE status IN ('submitted', 'waiting')
                  AND (claim_expires_at IS NULL OR claim_expires_at <= $1)
                ORDER BY last_polled_at ASC NULLS FIRST, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE generation_jobs j
            SET claim_token = $3, claim_expires_at = $4
            FROM due
            WHERE j.id = due.id
            RETURNING {}
            "#,
            prefixed_columns("j")
        ))
        .bind(now)
        .bind(limit)
        .bind(token.as_uuid())
        .bind(expires_at)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let claimed = rows
            .iter()
            .map(|row| {
                job_from_row(row).map(|job| ClaimedJob {
                    job,
                    token,
                    expires_at,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = claimed.len(), claim = %token, "jobs claimed");
        Ok(claimed)
    }

    #[instrument(skip(self, token), fields(job_id = %id), err)]
    async fn record_wait(
        &self,
        id: JobId,
        token: ClaimToken,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'waiting', attempts = attempts + 1, last_polled_at = $3,
                claim_token = NULL, claim_expires_at = NULL
            WHERE id = $1 AND claim_token = $2 AND status IN ('submitted', 'waiting')
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_wait", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token, result_url), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        token: ClaimToken,
        result_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        if result_url.trim().is_empty() {
            return Err(TransitionError::MissingResultUrl.into());
        }
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'completed', result_url = $3, attempts = attempts + 1,
                last_polled_at = $4, completed_at = $4,
                claim_token = NULL, claim_expires_at = NULL
            WHERE id = $1 AND claim_token = $2 AND status IN ('submitted', 'waiting')
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(result_url)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token, detail), fields(job_id = %id, error_kind = %kind), err)]
    async fn fail(
        &self,
        id: JobId,
        token: ClaimToken,
        kind: ErrorKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'failed', error_kind = $3, error_detail = $4, completed_at = $5,
                claim_token = NULL, claim_expires_at = NULL
            WHERE id = $1 AND claim_token = $2 AND status IN ('submitted', 'waiting')
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .bind(kind.as_str())
        .bind(detail)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: JobId, token: ClaimToken) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET claim_token = NULL, claim_expires_at = NULL
            WHERE id = $1 AND claim_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending_refunds(&self, limit: usize) -> Result<Vec<GenerationJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE status = 'failed' AND refunded_at IS NULL \
             ORDER BY completed_at ASC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_refunds", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_refunded(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET refunded_at = $2
            WHERE id = $1 AND status = 'failed' AND refunded_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_refunded", e))?;
        Ok(result.rows_affected() == 1)
    }
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_columns_are_qualified() {
        let cols = prefixed_columns("j");
        assert!(cols.starts_with("j.id, j.owner_id"));
        assert!(cols.ends_with("j.completed_at"));
        assert_eq!(cols.matches("j.").count(), JOB_COLUMNS.split(',').count());
    }
}
