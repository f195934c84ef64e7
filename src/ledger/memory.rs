//! In-memory ledger store.
//!
//! Same locking contract as the PostgreSQL store: credit, reorg and
//! reversal take an exclusive per-deposit lock for the whole operation,
//! and every operation's writes are applied in a single step or not at all.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::error::LedgerError;
use super::store::{
    CreditOutcome, LedgerStore, check_amount, credit_guard, reorg_guard, reversal_guard,
};
use crate::models::{
    AuditAction, AuditEntry, ChainObservation, Deposit, DepositId, DepositStatus, NewDeposit,
};

#[derive(Default)]
struct LedgerState {
    next_id: DepositId,
    deposits: BTreeMap<DepositId, Deposit>,
    accounts: HashMap<String, i64>,
    audits: Vec<AuditEntry>,
}

impl LedgerState {
    fn deposit_mut(&mut self, id: DepositId) -> Result<&mut Deposit, LedgerError> {
        self.deposits.get_mut(&id).ok_or(LedgerError::NotFound(id))
    }

    fn audit(&mut self, deposit_id: DepositId, action: AuditAction) {
        self.audits.push(AuditEntry {
            deposit_id,
            action,
            timestamp: Utc::now(),
        });
    }
}

/// Exclusive per-deposit holds, the in-memory counterpart of `FOR UPDATE`
#[derive(Default)]
struct RowLocks {
    locks: Mutex<HashMap<DepositId, Arc<AsyncMutex<()>>>>,
}

impl RowLocks {
    async fn acquire(&self, id: DepositId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<LedgerState>,
    row_locks: RowLocks,
    fail_next_commit: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a pending deposit. Idempotent on `tx_hash`.
    pub fn insert_deposit(&self, deposit: &NewDeposit) -> Result<DepositId, LedgerError> {
        check_amount(deposit.amount)?;

        let mut state = self.state();
        if let Some(existing) = state.deposits.values().find(|d| d.tx_hash == deposit.tx_hash) {
            return Ok(existing.id);
        }

        state.next_id += 1;
        let id = state.next_id;
        state.deposits.insert(
            id,
            Deposit {
                id,
                tx_hash: deposit.tx_hash.clone(),
                address: deposit.address.clone(),
                amount: deposit.amount,
                confirmations: 0,
                observation: None,
                status: DepositStatus::Pending,
                received_at: deposit.received_at,
                credited_at: None,
            },
        );
        Ok(id)
    }

    /// Set an account balance directly (test setup)
    pub fn set_balance(&self, address: &str, balance: i64) {
        self.state().accounts.insert(address.to_string(), balance);
    }

    /// Abort the next mutating transaction before any of its writes apply
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Total number of audit rows across all deposits
    pub fn audit_count(&self) -> usize {
        self.state().audits.len()
    }

    fn read_locked(&self, id: DepositId) -> Result<(DepositStatus, String, i64), LedgerError> {
        let state = self.state();
        let deposit = state.deposits.get(&id).ok_or(LedgerError::NotFound(id))?;
        Ok((deposit.status, deposit.address.clone(), deposit.amount))
    }

    /// Apply one transaction's writes atomically
    fn commit<F>(&self, writes: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut LedgerState) -> Result<(), LedgerError>,
    {
        let mut state = self.state();
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Aborted("injected commit failure".to_string()));
        }
        writes(&mut state)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn pending_deposits(&self) -> Result<Vec<Deposit>, LedgerError> {
        let mut pending: Vec<Deposit> = self
            .state()
            .deposits
            .values()
            .filter(|d| d.status == DepositStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|d| (d.received_at, d.id));
        Ok(pending)
    }

    async fn list_deposits(&self) -> Result<Vec<Deposit>, LedgerError> {
        let mut all: Vec<Deposit> = self.state().deposits.values().cloned().collect();
        all.sort_by_key(|d| std::cmp::Reverse((d.received_at, d.id)));
        Ok(all)
    }

    async fn get_deposit(&self, id: DepositId) -> Result<Option<Deposit>, LedgerError> {
        Ok(self.state().deposits.get(&id).cloned())
    }

    async fn record_observation(
        &self,
        id: DepositId,
        observation: &ChainObservation,
        confirmations: u64,
    ) -> Result<(), LedgerError> {
        self.commit(|state| {
            let deposit = state.deposit_mut(id)?;
            if deposit.status == DepositStatus::Pending {
                deposit.observation = Some(observation.clone());
                deposit.confirmations = confirmations;
            }
            Ok(())
        })
    }

    async fn credit_if_not_credited(&self, deposit: &Deposit) -> Result<CreditOutcome, LedgerError> {
        let _row = self.row_locks.acquire(deposit.id).await;

        let (status, address, amount) = self.read_locked(deposit.id)?;
        if let Some(outcome) = credit_guard(deposit.id, status)? {
            return Ok(outcome);
        }

        // Give other callers a chance to run between read and write, like a
        // database round-trip would. Only the row lock keeps them out.
        tokio::task::yield_now().await;

        self.commit(|state| {
            let id = deposit.id;
            let balance = state.accounts.get(&address).copied().unwrap_or(0);
            let balance = balance
                .checked_add(amount)
                .ok_or_else(|| LedgerError::BalanceOverflow(address.clone()))?;

            let d = state.deposit_mut(id)?;
            d.status = DepositStatus::Credited;
            d.credited_at = Some(Utc::now());
            state.accounts.insert(address, balance);
            state.audit(id, AuditAction::Credited);
            Ok(())
        })?;

        Ok(CreditOutcome::Credited)
    }

    async fn mark_deposit_reorged(&self, id: DepositId) -> Result<(), LedgerError> {
        let _row = self.row_locks.acquire(id).await;

        let (status, _, _) = self.read_locked(id)?;
        reorg_guard(id, status)?;

        self.commit(|state| {
            state.deposit_mut(id)?.status = DepositStatus::Reorged;
            state.audit(id, AuditAction::Reorged);
            Ok(())
        })
    }

    async fn reverse_credit(&self, id: DepositId) -> Result<(), LedgerError> {
        let _row = self.row_locks.acquire(id).await;

        let (status, address, amount) = self.read_locked(id)?;
        reversal_guard(id, status)?;

        tokio::task::yield_now().await;

        self.commit(|state| {
            let balance = state.accounts.get(&address).copied().unwrap_or(0);
            let balance = balance
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::BalanceOverflow(address.clone()))?;

            state.deposit_mut(id)?.status = DepositStatus::Reversed;
            state.accounts.insert(address, balance);
            state.audit(id, AuditAction::Reversed);
            Ok(())
        })
    }

    async fn audit_trail(&self, id: DepositId) -> Result<Vec<AuditEntry>, LedgerError> {
        Ok(self
            .state()
            .audits
            .iter()
            .filter(|a| a.deposit_id == id)
            .cloned()
            .collect())
    }

    async fn balance(&self, address: &str) -> Result<Option<i64>, LedgerError> {
        Ok(self.state().accounts.get(address).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded(amount: i64) -> (MemoryLedgerStore, DepositId) {
        let store = MemoryLedgerStore::new();
        let id = store.insert_deposit(&NewDeposit::new("0xabc", "0xaddr", amount)).unwrap();
        (store, id)
    }

    async fn deposit(store: &MemoryLedgerStore, id: DepositId) -> Deposit {
        store.get_deposit(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_tx_hash() {
        let (store, id) = seeded(1000);
        let again = store.insert_deposit(&NewDeposit::new("0xabc", "0xother", 5)).unwrap();
        assert_eq!(id, again);
        assert_eq!(store.list_deposits().await.unwrap().len(), 1);
        assert_eq!(deposit(&store, id).await.amount, 1000);
    }

    #[tokio::test]
    async fn test_credit_twice_increments_once() {
        let (store, id) = seeded(1000);
        let d = deposit(&store, id).await;

        assert_eq!(store.credit_if_not_credited(&d).await.unwrap(), CreditOutcome::Credited);
        assert_eq!(
            store.credit_if_not_credited(&d).await.unwrap(),
            CreditOutcome::AlreadyCredited
        );

        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(1000));
        let trail = store.audit_trail(id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::Credited);

        let credited = deposit(&store, id).await;
        assert_eq!(credited.status, DepositStatus::Credited);
        assert!(credited.credited_at.is_some());
    }

    #[tokio::test]
    async fn test_credit_uses_stored_amount_not_caller_snapshot() {
        let (store, id) = seeded(1000);
        let mut stale = deposit(&store, id).await;
        stale.amount = 1;

        store.credit_if_not_credited(&stale).await.unwrap();
        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn test_credit_adds_to_existing_balance() {
        let (store, id) = seeded(1000);
        store.set_balance("0xaddr", 50);
        store.credit_if_not_credited(&deposit(&store, id).await).await.unwrap();
        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(1050));
    }

    #[tokio::test]
    async fn test_reorged_deposit_cannot_be_credited() {
        let (store, id) = seeded(1000);
        store.mark_deposit_reorged(id).await.unwrap();

        let err = store
            .credit_if_not_credited(&deposit(&store, id).await)
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(store.balance("0xaddr").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mark_reorged_twice_records_twice() {
        let (store, id) = seeded(1000);
        store.mark_deposit_reorged(id).await.unwrap();
        store.mark_deposit_reorged(id).await.unwrap();

        let trail = store.audit_trail(id).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert!(trail.iter().all(|a| a.action == AuditAction::Reorged));
        assert_eq!(deposit(&store, id).await.status, DepositStatus::Reorged);
    }

    #[tokio::test]
    async fn test_mark_reorged_rejects_credited() {
        let (store, id) = seeded(1000);
        store.credit_if_not_credited(&deposit(&store, id).await).await.unwrap();

        assert!(store.mark_deposit_reorged(id).await.unwrap_err().is_invalid_state());
        assert_eq!(deposit(&store, id).await.status, DepositStatus::Credited);
        assert_eq!(store.audit_trail(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reverse_credit() {
        let (store, id) = seeded(1000);
        store.credit_if_not_credited(&deposit(&store, id).await).await.unwrap();
        store.reverse_credit(id).await.unwrap();

        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(0));
        assert_eq!(deposit(&store, id).await.status, DepositStatus::Reversed);
        let actions: Vec<_> = store
            .audit_trail(id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert_eq!(actions, vec![AuditAction::Credited, AuditAction::Reversed]);

        // A second reversal finds the deposit already reversed
        assert!(store.reverse_credit(id).await.unwrap_err().is_invalid_state());
        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_reverse_pending_rejected_without_side_effects() {
        let (store, id) = seeded(1000);
        let err = store.reverse_credit(id).await.unwrap_err();

        assert!(err.is_invalid_state());
        assert_eq!(store.balance("0xaddr").await.unwrap(), None);
        assert!(store.audit_trail(id).await.unwrap().is_empty());
        assert_eq!(deposit(&store, id).await.status, DepositStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_deposit() {
        let store = MemoryLedgerStore::new();
        assert!(matches!(
            store.reverse_credit(42).await,
            Err(LedgerError::NotFound(42))
        ));
        assert!(matches!(
            store.mark_deposit_reorged(42).await,
            Err(LedgerError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_state_untouched() {
        let (store, id) = seeded(1000);
        store.fail_next_commit();

        let err = store
            .credit_if_not_credited(&deposit(&store, id).await)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Aborted(_)));
        assert_eq!(store.balance("0xaddr").await.unwrap(), None);
        assert_eq!(deposit(&store, id).await.status, DepositStatus::Pending);
        assert_eq!(store.audit_count(), 0);

        // Next attempt goes through
        store.credit_if_not_credited(&deposit(&store, id).await).await.unwrap();
        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn test_credit_overflow_rolls_back() {
        let (store, id) = seeded(10);
        store.set_balance("0xaddr", i64::MAX - 5);

        let err = store
            .credit_if_not_credited(&deposit(&store, id).await)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BalanceOverflow(_)));

        let d = deposit(&store, id).await;
        assert_eq!(d.status, DepositStatus::Pending);
        assert!(d.credited_at.is_none());
        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(i64::MAX - 5));
        assert_eq!(store.audit_count(), 0);
    }

    #[tokio::test]
    async fn test_reversal_underflow_rolls_back() {
        let (store, id) = seeded(10);
        store.credit_if_not_credited(&deposit(&store, id).await).await.unwrap();
        store.set_balance("0xaddr", i64::MIN + 5);

        let err = store.reverse_credit(id).await.unwrap_err();
        assert!(matches!(err, LedgerError::BalanceOverflow(_)));
        assert_eq!(deposit(&store, id).await.status, DepositStatus::Credited);
        assert_eq!(store.balance("0xaddr").await.unwrap(), Some(i64::MIN + 5));
        assert_eq!(store.audit_count(), 1);
    }

    #[tokio::test]
    async fn test_negative_amount_rejected() {
        let store = MemoryLedgerStore::new();
        let err = store
            .insert_deposit(&NewDeposit::new("0xneg", "0xaddr", -1))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(-1)));
        assert!(store.list_deposits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_observation_only_recorded_while_pending() {
        let (store, id) = seeded(1000);
        let first = ChainObservation::new(90, "0xhash");
        store.record_observation(id, &first, 3).await.unwrap();

        let d = deposit(&store, id).await;
        assert_eq!(d.observation, Some(first.clone()));
        assert_eq!(d.confirmations, 3);

        store.mark_deposit_reorged(id).await.unwrap();
        store
            .record_observation(id, &ChainObservation::new(91, "0xother"), 9)
            .await
            .unwrap();
        assert_eq!(deposit(&store, id).await.observation, Some(first));
    }

    #[tokio::test]
    async fn test_listing_order() {
        let store = MemoryLedgerStore::new();
        let now = Utc::now();
        let mut older = NewDeposit::new("0x01", "0xaddr", 1);
        older.received_at = now - Duration::seconds(10);
        let mut newer = NewDeposit::new("0x02", "0xaddr", 2);
        newer.received_at = now;

        let newer_id = store.insert_deposit(&newer).unwrap();
        let older_id = store.insert_deposit(&older).unwrap();

        let pending: Vec<_> = store.pending_deposits().await.unwrap().iter().map(|d| d.id).collect();
        assert_eq!(pending, vec![older_id, newer_id]);

        let all: Vec<_> = store.list_deposits().await.unwrap().iter().map(|d| d.id).collect();
        assert_eq!(all, vec![newer_id, older_id]);

        store.mark_deposit_reorged(older_id).await.unwrap();
        let pending: Vec<_> = store.pending_deposits().await.unwrap().iter().map(|d| d.id).collect();
        assert_eq!(pending, vec![newer_id]);
    }
}
