use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use genforge_core::{JobId, UserId};
use genforge_credits::{
    BalanceAudit, CreditTransaction, Credits, TransactionKind, apply,
};

use super::{CreditLedger, LedgerStoreError, RefundOutcome};
use crate::pagination::{Page, Pagination};

#[derive(Debug, Default)]
struct Account {
    balance: Credits,
    log: Vec<CreditTransaction>,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<UserId, Account>,
    refunds_by_job: HashMap<JobId, CreditTransaction>,
}

/// In-memory ledger.
///
/// Intended for tests/dev. One write lock covers check, debit and append, so
/// each operation is linearized across all users.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    state: RwLock<State>,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> LedgerStoreError {
        LedgerStoreError::Storage("lock poisoned".to_string())
    }

    fn post(
        state: &mut State,
        user_id: UserId,
        kind: TransactionKind,
        amount: Credits,
        reason: &str,
        job_id: Option<JobId>,
    ) -> Result<CreditTransaction, LedgerStoreError> {
        let account = state.accounts.entry(user_id).or_default();
        let posting = apply(account.balance, kind, amount)?;
        let tx = match kind {
            TransactionKind::Reserve => {
                CreditTransaction::reserve(user_id, amount, posting.balance_after, reason, job_id)
            }
            TransactionKind::Refund => {
                CreditTransaction::refund(user_id, amount, posting.balance_after, reason, job_id)
            }
            TransactionKind::Adjust => {
                CreditTransaction::adjust(user_id, posting.delta, posting.balance_after, reason)
            }
        };
        account.balance = posting.balance_after;
        account.log.push(tx.clone());
        Ok(tx)
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn reserve(
        &self,
        user_id: UserId,
        amount: Credits,
        reason: &str,
        job_id: Option<JobId>,
    ) -> Result<CreditTransaction, LedgerStoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        Self::post(&mut state, user_id, TransactionKind::Reserve, amount, reason, job_id)
    }

    async fn refund(
        &self,
        user_id: UserId,
        amount: Credits,
        reason: &str,
        job_id: Option<JobId>,
    ) -> Result<RefundOutcome, LedgerStoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        if let Some(existing) = job_id.and_then(|id| state.refunds_by_job.get(&id)) {
            return Ok(RefundOutcome::AlreadyRefunded(existing.clone()));
        }
        let tx = Self::post(&mut state, user_id, TransactionKind::Refund, amount, reason, job_id)?;
        if let Some(id) = job_id {
            state.refunds_by_job.insert(id, tx.clone());
        }
        Ok(RefundOutcome::Applied(tx))
    }

    async fn adjust(
        &self,
        user_id: UserId,
        delta: Credits,
        reason: &str,
    ) -> Result<CreditTransaction, LedgerStoreError> {
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        Self::post(&mut state, user_id, TransactionKind::Adjust, delta, reason, None)
    }

    async fn balance(&self, user_id: UserId) -> Result<Credits, LedgerStoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(state.accounts.get(&user_id).map(|a| a.balance).unwrap_or(0))
    }

    async fn transactions(
        &self,
        user_id: UserId,
        pagination: Pagination,
    ) -> Result<Page<CreditTransaction>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let newest_first: Vec<CreditTransaction> = state
            .accounts
            .get(&user_id)
            .map(|a| a.log.iter().rev().cloned().collect())
            .unwrap_or_default();
        Ok(Page::new(
            pagination.apply(&newest_first),
            newest_first.len() as u64,
            pagination,
        ))
    }

    async fn transactions_for_job(
        &self,
        job_id: JobId,
    ) -> Result<Vec<CreditTransaction>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        // a job's entries all live in its owner's log, already in order
        Ok(state
            .accounts
            .values()
            .flat_map(|a| a.log.iter())
            .filter(|t| t.job_id == Some(job_id))
            .cloned()
            .collect())
    }

    async fn audit(&self, user_id: UserId) -> Result<BalanceAudit, LedgerStoreError> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        Ok(match state.accounts.get(&user_id) {
            Some(a) => BalanceAudit::compute(user_id, a.balance, &a.log),
            None => BalanceAudit::compute(user_id, 0, &[]),
        })
    }
}
