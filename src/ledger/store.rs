use async_trait::async_trait;

use super::error::LedgerError;
use crate::models::{AuditEntry, ChainObservation, Deposit, DepositId, DepositStatus};

/// Result of an idempotent credit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Balance incremented, status set to credited, audit row written
    Credited,
    /// Someone got there first; nothing changed
    AlreadyCredited,
}

/// Durable record of deposits, balances and audit entries.
///
/// Every status change commits together with its audit row. The credit,
/// reorg and reversal operations hold an exclusive lock on the deposit row
/// for the whole transaction, so concurrent callers on the same deposit
/// are serialized by the store itself.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Deposits still `pending`, oldest first
    async fn pending_deposits(&self) -> Result<Vec<Deposit>, LedgerError>;

    /// All deposits, newest first
    async fn list_deposits(&self) -> Result<Vec<Deposit>, LedgerError>;

    async fn get_deposit(&self, id: DepositId) -> Result<Option<Deposit>, LedgerError>;

    /// Persist the latest chain observation of a pending deposit.
    /// Not a status change, so no audit row. No-op once the deposit left `pending`.
    async fn record_observation(
        &self,
        id: DepositId,
        observation: &ChainObservation,
        confirmations: u64,
    ) -> Result<(), LedgerError>;

    /// Credit `deposit.address` with the deposit amount unless already credited.
    ///
    /// Address and amount are re-read under the row lock; the passed
    /// deposit only identifies the row.
    async fn credit_if_not_credited(&self, deposit: &Deposit) -> Result<CreditOutcome, LedgerError>;

    /// Mark a deposit reorged. Repeating it on a reorged deposit records
    /// another audit row.
    async fn mark_deposit_reorged(&self, id: DepositId) -> Result<(), LedgerError>;

    /// Operator-only: undo a credit
    async fn reverse_credit(&self, id: DepositId) -> Result<(), LedgerError>;

    /// Audit rows of one deposit in insertion order
    async fn audit_trail(&self, id: DepositId) -> Result<Vec<AuditEntry>, LedgerError>;

    /// `None` when the account has never been credited
    async fn balance(&self, address: &str) -> Result<Option<i64>, LedgerError>;
}

/// Decide a credit attempt from the status read under the row lock.
/// `Ok(None)` means go ahead.
pub(crate) fn credit_guard(
    id: DepositId,
    status: DepositStatus,
) -> Result<Option<CreditOutcome>, LedgerError> {
    match status {
        DepositStatus::Pending => Ok(None),
        DepositStatus::Credited => Ok(Some(CreditOutcome::AlreadyCredited)),
        DepositStatus::Reorged | DepositStatus::Reversed => Err(LedgerError::InvalidState {
            id,
            status,
            operation: "credit",
        }),
    }
}

pub(crate) fn reorg_guard(id: DepositId, status: DepositStatus) -> Result<(), LedgerError> {
    match status {
        DepositStatus::Pending | DepositStatus::Reorged => Ok(()),
        DepositStatus::Credited | DepositStatus::Reversed => Err(LedgerError::InvalidState {
            id,
            status,
            operation: "mark reorged",
        }),
    }
}

pub(crate) fn reversal_guard(id: DepositId, status: DepositStatus) -> Result<(), LedgerError> {
    if status == DepositStatus::Credited {
        Ok(())
    } else {
        Err(LedgerError::InvalidState {
            id,
            status,
            operation: "reverse",
        })
    }
}

/// Same rule as the `amount >= 0` check on the deposits table
pub(crate) fn check_amount(amount: i64) -> Result<(), LedgerError> {
    if amount < 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}
