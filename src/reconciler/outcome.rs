use tracing::{debug, info, warn};

use crate::chain::ChainQueryError;
use crate::ledger::LedgerError;
use crate::models::DepositId;

/// Why a deposit was moved to `reorged`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgReason {
    /// The chain no longer has a receipt for the transaction
    ReceiptMissing,
    /// The block we previously saw the transaction in is no longer canonical
    BlockHashChanged { stored: String, observed: String },
    /// The transaction executed but failed
    Reverted,
}

/// Result of reconciling one deposit during a tick
#[derive(Debug)]
pub enum DepositOutcome {
    Credited { confirmations: u64 },
    /// Another caller credited it first
    AlreadyCredited,
    Reorged(ReorgReason),
    /// Observed, not deep enough yet
    Confirming { confirmations: u64, required: u64 },
    /// Chain query failed; retried next tick
    Skipped(ChainQueryError),
    /// Store transaction failed and rolled back; retried next tick
    StoreFailed(LedgerError),
}

impl DepositOutcome {
    /// Still pending after this tick
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            DepositOutcome::Confirming { .. }
                | DepositOutcome::Skipped(_)
                | DepositOutcome::StoreFailed(_)
        )
    }
}

#[derive(Debug)]
pub struct DepositReport {
    pub deposit_id: DepositId,
    pub tx_hash: String,
    pub outcome: DepositOutcome,
}

/// Everything one tick did, in processing order
#[derive(Debug, Default)]
pub struct TickReport {
    pub deposits: Vec<DepositReport>,
}

impl TickReport {
    pub fn outcome(&self, deposit_id: DepositId) -> Option<&DepositOutcome> {
        self.deposits
            .iter()
            .find(|r| r.deposit_id == deposit_id)
            .map(|r| &r.outcome)
    }

    fn count(&self, pred: impl Fn(&DepositOutcome) -> bool) -> usize {
        self.deposits.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn credited(&self) -> usize {
        self.count(|o| matches!(o, DepositOutcome::Credited { .. }))
    }

    pub fn reorged(&self) -> usize {
        self.count(|o| matches!(o, DepositOutcome::Reorged(_)))
    }

    pub fn confirming(&self) -> usize {
        self.count(|o| matches!(o, DepositOutcome::Confirming { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DepositOutcome::Skipped(_) | DepositOutcome::StoreFailed(_)))
    }

    pub(crate) fn log(&self) {
        for report in &self.deposits {
            let id = report.deposit_id;
            let tx_hash = report.tx_hash.as_str();
            match &report.outcome {
                DepositOutcome::Credited { confirmations } => {
                    info!(deposit_id = id, tx_hash, confirmations, "Deposit credited")
                }
                DepositOutcome::AlreadyCredited => {
                    debug!(deposit_id = id, tx_hash, "Deposit already credited")
                }
                DepositOutcome::Reorged(reason) => {
                    warn!(deposit_id = id, tx_hash, ?reason, "Deposit marked reorged")
                }
                DepositOutcome::Confirming {
                    confirmations,
                    required,
                } => debug!(deposit_id = id, tx_hash, confirmations, required, "Deposit confirming"),
                DepositOutcome::Skipped(e) => {
                    warn!(deposit_id = id, tx_hash, error = %e, "Chain query failed, skipping")
                }
                DepositOutcome::StoreFailed(e) => {
                    warn!(deposit_id = id, tx_hash, error = %e, "Store update failed, will retry")
                }
            }
        }

        if !self.deposits.is_empty() {
            info!(
                total = self.deposits.len(),
                credited = self.credited(),
                reorged = self.reorged(),
                confirming = self.confirming(),
                failed = self.failed(),
                "Reconciliation tick finished"
            );
        }
    }
}
