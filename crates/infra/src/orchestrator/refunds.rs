use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use genforge_generation::GenerationJob;

use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::{CreditLedger, LedgerStoreError, RefundOutcome};

#[derive(Debug, Error)]
pub enum RefundError {
    #[error(transparent)]
    Ledger(#[from] LedgerStoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

pub(crate) fn refund_reason(job: &GenerationJob) -> String {
    let why = job.error_kind.map(|k| k.as_str()).unwrap_or("failed");
    format!("refund {} {} ({why})", job.kind, job.id)
}

/// Return a failed job's reservation and record that it was settled.
///
/// Safe to call repeatedly: the ledger applies at most one refund per job and
/// `mark_refunded` only flips once.
#[instrument(skip(ledger, jobs, job), fields(job_id = %job.id, user_id = %job.owner_id), err)]
pub(crate) async fn settle_refund(
    ledger: &dyn CreditLedger,
    jobs: &dyn JobStore,
    job: &GenerationJob,
) -> Result<RefundOutcome, RefundError> {
    let outcome = ledger
        .refund(job.owner_id, job.credits_reserved, &refund_reason(job), Some(job.id))
        .await?;
    jobs.mark_refunded(job.id, Utc::now()).await?;
    if outcome.was_applied() {
        info!(
            amount = job.credits_reserved,
            balance_after = outcome.transaction().balance_after,
            "reservation refunded"
        );
    }
    Ok(outcome)
}
