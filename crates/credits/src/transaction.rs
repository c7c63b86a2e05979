use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use genforge_core::{JobId, TransactionId, UserId};

/// Credit amounts are whole credits; signed where direction matters.
pub type Credits = i64;

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Credits held for a submitted job (negative amount).
    Reserve,
    /// Credits returned for a job that failed (positive amount).
    Refund,
    /// Operator grant/correction (signed amount).
    Adjust,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Reserve => "reserve",
            TransactionKind::Refund => "refund",
            TransactionKind::Adjust => "adjust",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserve" => Some(TransactionKind::Reserve),
            "refund" => Some(TransactionKind::Refund),
            "adjust" => Some(TransactionKind::Adjust),
            _ => None,
        }
    }
}

impl core::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry of a user's credit log.
///
/// `amount` is signed: summing a user's amounts in order reproduces their
/// balance, and `balance_after` records the running total after this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: Credits,
    pub balance_after: Credits,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub job_id: Option<JobId>,
}

impl CreditTransaction {
    /// Reserve entry; `amount` is the positive reserved cost.
    pub fn reserve(
        user_id: UserId,
        amount: Credits,
        balance_after: Credits,
        reason: impl Into<String>,
        job_id: Option<JobId>,
    ) -> Self {
        Self::build(user_id, TransactionKind::Reserve, -amount, balance_after, reason, job_id)
    }

    /// Refund entry; `amount` is the positive refunded cost.
    pub fn refund(
        user_id: UserId,
        amount: Credits,
        balance_after: Credits,
        reason: impl Into<String>,
        job_id: Option<JobId>,
    ) -> Self {
        Self::build(user_id, TransactionKind::Refund, amount, balance_after, reason, job_id)
    }

    /// Adjustment entry; `delta` keeps its sign.
    pub fn adjust(
        user_id: UserId,
        delta: Credits,
        balance_after: Credits,
        reason: impl Into<String>,
    ) -> Self {
        Self::build(user_id, TransactionKind::Adjust, delta, balance_after, reason, None)
    }

    fn build(
        user_id: UserId,
        kind: TransactionKind,
        amount: Credits,
        balance_after: Credits,
        reason: impl Into<String>,
        job_id: Option<JobId>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            user_id,
            kind,
            amount,
            balance_after,
            reason: reason.into(),
            created_at: Utc::now(),
            job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_stored_as_a_debit() {
        let job = JobId::new();
        let tx = CreditTransaction::reserve(UserId::new(), 30, 70, "image job", Some(job));
        assert_eq!(tx.kind, TransactionKind::Reserve);
        assert_eq!(tx.amount, -30);
        assert_eq!(tx.balance_after, 70);
        assert_eq!(tx.job_id, Some(job));
    }

    #[test]
    fn refund_is_stored_as_a_credit() {
        let tx = CreditTransaction::refund(UserId::new(), 30, 100, "provider failed", None);
        assert_eq!(tx.amount, 30);
    }

    #[test]
    fn kind_round_trips_through_its_column_value() {
        for kind in [TransactionKind::Reserve, TransactionKind::Refund, TransactionKind::Adjust] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("debit"), None);
    }
}
