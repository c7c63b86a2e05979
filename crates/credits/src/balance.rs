//! Balance arithmetic and log replay.
//!
//! The transaction log is the source of truth; a stored balance is a cached
//! projection of it. `apply` is the single place where the conditional debit
//! rule lives, so every backend enforces the same arithmetic.

use serde::Serialize;

use genforge_core::UserId;

use crate::error::LedgerError;
use crate::transaction::{CreditTransaction, Credits, TransactionKind};

/// Outcome of applying one operation to a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    /// Signed amount to record on the transaction.
    pub delta: Credits,
    /// Balance after the posting.
    pub balance_after: Credits,
}

/// Apply one ledger operation to `current`.
///
/// - `Reserve` requires `amount > 0` and `current >= amount`.
/// - `Refund` requires `amount > 0`.
/// - `Adjust` takes a signed non-zero delta and may not drive the balance negative.
pub fn apply(current: Credits, kind: TransactionKind, amount: Credits) -> Result<Posting, LedgerError> {
    match kind {
        TransactionKind::Reserve => {
            if amount <= 0 {
                return Err(LedgerError::InvalidAmount(amount));
            }
            if current < amount {
                return Err(LedgerError::InsufficientCredits {
                    available: current,
                    requested: amount,
                });
            }
            Ok(Posting {
                delta: -amount,
                balance_after: current - amount,
            })
        }
        TransactionKind::Refund => {
            if amount <= 0 {
                return Err(LedgerError::InvalidAmount(amount));
            }
            let next = current
                .checked_add(amount)
                .ok_or(LedgerError::InvalidAmount(amount))?;
            Ok(Posting {
                delta: amount,
                balance_after: next,
            })
        }
        TransactionKind::Adjust => {
            if amount == 0 {
                return Err(LedgerError::InvalidAmount(amount));
            }
            let next = current
                .checked_add(amount)
                .ok_or(LedgerError::InvalidAmount(amount))?;
            if next < 0 {
                let requested = amount.checked_neg().ok_or(LedgerError::InvalidAmount(amount))?;
                return Err(LedgerError::InsufficientCredits {
                    available: current,
                    requested,
                });
            }
            Ok(Posting {
                delta: amount,
                balance_after: next,
            })
        }
    }
}

/// Sum a user's transactions in order.
pub fn replay<'a>(transactions: impl IntoIterator<Item = &'a CreditTransaction>) -> Credits {
    transactions.into_iter().map(|t| t.amount).sum()
}

/// Check that each `balance_after` equals the running sum; returns the final balance.
pub fn verify_chain(transactions: &[CreditTransaction]) -> Result<Credits, LedgerError> {
    let mut running: Credits = 0;
    for (index, tx) in transactions.iter().enumerate() {
        running += tx.amount;
        if tx.balance_after != running {
            return Err(LedgerError::BrokenChain {
                index,
                expected: running,
                recorded: tx.balance_after,
            });
        }
    }
    Ok(running)
}

/// Cached balance vs. balance replayed from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceAudit {
    pub user_id: UserId,
    pub cached: Credits,
    pub replayed: Credits,
    pub transaction_count: usize,
}

impl BalanceAudit {
    pub fn compute(user_id: UserId, cached: Credits, transactions: &[CreditTransaction]) -> Self {
        Self {
            user_id,
            cached,
            replayed: replay(transactions),
            transaction_count: transactions.len(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.cached == self.replayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reserve_decrements_when_covered() {
        let p = apply(100, TransactionKind::Reserve, 30).unwrap();
        assert_eq!(p, Posting { delta: -30, balance_after: 70 });
    }

    #[test]
    fn reserve_rejects_overdraw() {
        let err = apply(20, TransactionKind::Reserve, 30).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientCredits {
                available: 20,
                requested: 30
            }
        );
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        assert_eq!(
            apply(10, TransactionKind::Reserve, 0).unwrap_err(),
            LedgerError::InvalidAmount(0)
        );
        assert_eq!(
            apply(10, TransactionKind::Refund, -5).unwrap_err(),
            LedgerError::InvalidAmount(-5)
        );
        assert_eq!(
            apply(10, TransactionKind::Adjust, 0).unwrap_err(),
            LedgerError::InvalidAmount(0)
        );
    }

    #[test]
    fn negative_adjust_cannot_go_below_zero() {
        assert!(apply(10, TransactionKind::Adjust, -10).is_ok());
        assert!(matches!(
            apply(10, TransactionKind::Adjust, -11),
            Err(LedgerError::InsufficientCredits { .. })
        ));
    }

    #[test]
    fn overflowing_credit_is_an_invalid_amount() {
        assert_eq!(
            apply(i64::MAX, TransactionKind::Adjust, 1).unwrap_err(),
            LedgerError::InvalidAmount(1)
        );
        assert_eq!(
            apply(i64::MAX - 5, TransactionKind::Refund, 10).unwrap_err(),
            LedgerError::InvalidAmount(10)
        );
        assert_eq!(
            apply(0, TransactionKind::Adjust, i64::MIN).unwrap_err(),
            LedgerError::InvalidAmount(i64::MIN)
        );
        assert!(apply(i64::MAX - 5, TransactionKind::Adjust, 5).is_ok());
    }

    #[test]
    fn broken_chain_is_reported_with_position() {
        let user = UserId::new();
        let txs = vec![
            CreditTransaction::adjust(user, 100, 100, "grant"),
            CreditTransaction::reserve(user, 30, 60, "job", None),
        ];
        let err = verify_chain(&txs).unwrap_err();
        assert_eq!(
            err,
            LedgerError::BrokenChain {
                index: 1,
                expected: 70,
                recorded: 60
            }
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(Credits),
        Refund(Credits),
        Adjust(Credits),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..500).prop_map(Op::Reserve),
            (1i64..500).prop_map(Op::Refund),
            (-500i64..500).prop_map(Op::Adjust),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// For any sequence of operations, accepted postings form a log whose
        /// replay equals the running balance and which never goes negative.
        #[test]
        fn accepted_postings_conserve_credits(ops in prop::collection::vec(op(), 1..64)) {
            let user = UserId::new();
            let mut balance: Credits = 0;
            let mut log: Vec<CreditTransaction> = Vec::new();

            for op in ops {
                let (kind, amount) = match op {
                    Op::Reserve(a) => (TransactionKind::Reserve, a),
                    Op::Refund(a) => (TransactionKind::Refund, a),
                    Op::Adjust(a) => (TransactionKind::Adjust, a),
                };
                if let Ok(p) = apply(balance, kind, amount) {
                    balance = p.balance_after;
                    let tx = match kind {
                        TransactionKind::Reserve => CreditTransaction::reserve(user, amount, balance, "r", None),
                        TransactionKind::Refund => CreditTransaction::refund(user, amount, balance, "f", None),
                        TransactionKind::Adjust => CreditTransaction::adjust(user, p.delta, balance, "a"),
                    };
                    log.push(tx);
                }
                prop_assert!(balance >= 0);
            }

            prop_assert_eq!(replay(&log), balance);
            prop_assert_eq!(verify_chain(&log).unwrap(), balance);
            prop_assert!(BalanceAudit::compute(user, balance, &log).is_consistent());
        }
    }
}
