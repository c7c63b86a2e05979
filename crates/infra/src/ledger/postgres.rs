//! Postgres-backed credit ledger.
//!
//! ## Atomicity
//!
//! Each operation runs in one transaction that updates `credit_accounts` and
//! inserts into `credit_transactions`. The account row lock taken by the
//! `UPDATE` linearizes all operations for a user, so `balance_after` chains
//! in `seq` order.
//!
//! `reserve` is a single conditional decrement:
//! `UPDATE .. SET balance = balance - $2 WHERE user_id = $1 AND balance >= $2`.
//! No row updated means insufficient credits.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Result |
//! |------------|----------------------|--------|
//! | Database (unique violation) on refund insert | `23505` | `RefundOutcome::AlreadyRefunded` |
//! | Database (numeric out of range) on balance update | `22003` | `LedgerError::InvalidAmount` |
//! | Any other | any | `LedgerStoreError::Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use genforge_core::{JobId, TransactionId, UserId};
use genforge_credits::{
    BalanceAudit, CreditTransaction, Credits, LedgerError, TransactionKind, apply,
};

use super::{CreditLedger, LedgerStoreError, RefundOutcome};
use crate::db;
use crate::pagination::{Page, Pagination};

const TX_COLUMNS: &str =
    "id, user_id, kind, amount, balance_after, reason, job_id, created_at";

#[derive(Debug, Clone)]
pub struct PostgresCreditLedger {
    pool: Arc<PgPool>,
}

impl PostgresCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LedgerStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerStoreError {
    match &err {
        sqlx::Error::Database(db_err) => LedgerStoreError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("?"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            LedgerStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => LedgerStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// An amount that would overflow the stored balance is the caller's error.
fn map_balance_error(operation: &str, amount: Credits, err: sqlx::Error) -> LedgerStoreError {
    if db::is_out_of_range(&err) {
        return LedgerError::InvalidAmount(amount).into();
    }
    map_sqlx_error(operation, err)
}

fn tx_from_row(row: &PgRow) -> Result<CreditTransaction, LedgerStoreError> {
    let read = |e: sqlx::Error| LedgerStoreError::Storage(format!("failed to read transaction row: {e}"));
    let kind: String = row.try_get("kind").map_err(read)?;
    let job_id: Option<Uuid> = row.try_get("job_id").map_err(read)?;
    Ok(CreditTransaction {
        id: TransactionId::from_uuid(row.try_get("id").map_err(read)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(read)?),
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| LedgerStoreError::Storage(format!("unknown transaction kind: {kind}")))?,
        amount: row.try_get("amount").map_err(read)?,
        balance_after: row.try_get("balance_after").map_err(read)?,
        reason: row.try_get("reason").map_err(read)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(read)?,
        job_id: job_id.map(JobId::from_uuid),
    })
}

async fn ensure_account(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
) -> Result<(), LedgerStoreError> {
    sqlx::query("INSERT INTO credit_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("ensure_account", e))?;
    Ok(())
}

async fn current_balance(
    executor: impl sqlx::PgExecutor<'_>,
    user_id: UserId,
) -> Result<Credits, LedgerStoreError> {
    let balance: Option<i64> =
        sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(executor)
            .await
            .map_err(|e| map_sqlx_error("current_balance", e))?;
    Ok(balance.unwrap_or(0))
}

async fn insert_transaction(
    tx: &mut Transaction<'_, Postgres>,
    entry: &CreditTransaction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO credit_transactions
            (id, user_id, kind, amount, balance_after, reason, job_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.user_id.as_uuid())
    .bind(entry.kind.as_str())
    .bind(entry.amount)
    .bind(entry.balance_after)
    .bind(&entry.reason)
    .bind(entry.job_id.map(|j| *j.as_uuid()))
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn refund_for_job(
    executor: impl sqlx::PgExecutor<'_>,
    job_id: JobId,
) -> Result<Option<CreditTransaction>, LedgerStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {TX_COLUMNS} FROM credit_transactions WHERE job_id = $1 AND kind = 'refund'"
    ))
    .bind(job_id.as_uuid())
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("refund_for_job", e))?;
    row.as_ref().map(tx_from_row).transpose()
}

#[async_trait]
impl CreditLedger for PostgresCreditLedger {
    #[instrument(skip(self, reason), fields(user_id = %user_id), err)]
    async fn reserve(
        &self,
        user_id: UserId,
        amount: Credits,
        reason: &str,
        job_id: Option<JobId>,
    ) -> Result<CreditTransaction, LedgerStoreError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        let mut tx = self.begin().await?;

        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE credit_accounts
            SET balance = balance - $2, updated_at = NOW()
            WHERE user_id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reserve", e))?;

        let Some(balance_after) = updated else {
            let available = current_balance(&mut *tx, user_id).await?;
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerError::InsufficientCredits {
                available,
                requested: amount,
            }
            .into());
        };

        let entry = CreditTransaction::reserve(user_id, amount, balance_after, reason, job_id);
        insert_transaction(&mut tx, &entry)
            .await
            .map_err(|e| map_sqlx_error("insert_reserve", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        debug!(amount, balance_after, "credits reserved");
        Ok(entry)
    }

    #[instrument(skip(self, reason), fields(user_id = %user_id), err)]
    async fn refund(
        &self,
        user_id: UserId,
        amount: Credits,
        reason: &str,
        job_id: Option<JobId>,
    ) -> Result<RefundOutcome, LedgerStoreError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        if let Some(job) = job_id {
            if let Some(existing) = refund_for_job(&*self.pool, job).await? {
                return Ok(RefundOutcome::AlreadyRefunded(existing));
            }
        }

        let mut tx = self.begin().await?;
        ensure_account(&mut tx, user_id).await?;

        let balance_after: i64 = sqlx::query_scalar(
            r#"
            UPDATE credit_accounts
            SET balance = balance + $2, updated_at = NOW()
            WHERE user_id = $1
            RETURNING balance
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_balance_error("refund", amount, e))?;

        let entry = CreditTransaction::refund(user_id, amount, balance_after, reason, job_id);
        match insert_transaction(&mut tx, &entry).await {
            Ok(()) => {}
            // a concurrent refund for the same job committed first
            Err(e) if db::is_unique_violation(&e) && job_id.is_some() => {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                let Some(job) = job_id else {
                    return Err(map_sqlx_error("insert_refund", e));
                };
                return match refund_for_job(&*self.pool, job).await? {
                    Some(existing) => Ok(RefundOutcome::AlreadyRefunded(existing)),
                    None => Err(LedgerStoreError::Storage(
                        "refund conflict but no refund found".into(),
                    )),
                };
            }
            Err(e) => return Err(map_sqlx_error("insert_refund", e)),
        }
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        debug!(amount, balance_after, "credits refunded");
        Ok(RefundOutcome::Applied(entry))
    }

    #[instrument(skip(self, reason), fields(user_id = %user_id), err)]
    async fn adjust(
        &self,
        user_id: UserId,
        delta: Credits,
        reason: &str,
    ) -> Result<CreditTransaction, LedgerStoreError> {
        if delta == 0 {
            return Err(LedgerError::InvalidAmount(delta).into());
        }
        let mut tx = self.begin().await?;
        ensure_account(&mut tx, user_id).await?;

        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE credit_accounts
            SET balance = balance + $2, updated_at = NOW()
            WHERE user_id = $1 AND balance + $2 >= 0
            RETURNING balance
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_balance_error("adjust", delta, e))?;

        let Some(balance_after) = updated else {
            let available = current_balance(&mut *tx, user_id).await?;
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            // surfaces the same error the pure arithmetic would
            return Err(apply(available, TransactionKind::Adjust, delta)
                .err()
                .unwrap_or(LedgerError::InsufficientCredits {
                    available,
                    requested: delta.saturating_neg(),
                })
                .into());
        };

        let entry = CreditTransaction::adjust(user_id, delta, balance_after, reason);
        insert_transaction(&mut tx, &entry)
            .await
            .map_err(|e| map_sqlx_error("insert_adjust", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(entry)
    }

    async fn balance(&self, user_id: UserId) -> Result<Credits, LedgerStoreError> {
        current_balance(&*self.pool, user_id).await
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn transactions(
        &self,
        user_id: UserId,
        pagination: Pagination,
    ) -> Result<Page<CreditTransaction>, LedgerStoreError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM credit_transactions WHERE user_id = $1")
                .bind(user_id.as_uuid())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_transactions", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM credit_transactions WHERE user_id = $1 \
             ORDER BY seq DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.as_uuid())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_transactions", e))?;

        let items = rows.iter().map(tx_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, total.max(0) as u64, pagination))
    }

    async fn transactions_for_job(
        &self,
        job_id: JobId,
    ) -> Result<Vec<CreditTransaction>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM credit_transactions WHERE job_id = $1 ORDER BY seq ASC"
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transactions_for_job", e))?;
        rows.iter().map(tx_from_row).collect()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn audit(&self, user_id: UserId) -> Result<BalanceAudit, LedgerStoreError> {
        // one snapshot for balance and log
        let mut tx = self.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("audit_isolation", e))?;

        let cached = current_balance(&mut *tx, user_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM credit_transactions WHERE user_id = $1 ORDER BY seq ASC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("audit", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        let log = rows.iter().map(tx_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(BalanceAudit::compute(user_id, cached, &log))
    }
}
