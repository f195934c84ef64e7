use thiserror::Error;

use crate::models::{DepositId, DepositStatus};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Deposit {0} not found")]
    NotFound(DepositId),

    #[error("Cannot {operation} deposit {id} in status '{status}'")]
    InvalidState {
        id: DepositId,
        status: DepositStatus,
        operation: &'static str,
    },

    /// Transaction failed and was rolled back; nothing was applied
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid deposit amount {0}: must not be negative")]
    InvalidAmount(i64),

    #[error("Balance overflow for account {0}")]
    BalanceOverflow(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl LedgerError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, LedgerError::InvalidState { .. })
    }
}
