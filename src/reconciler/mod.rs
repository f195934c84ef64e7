//! Reconciliation Loop
//!
//! On every tick, walks the pending deposits one at a time, asks the chain
//! where each transaction is, and moves the deposit forward:
//!
//! ```text
//!            ┌──────────────┐  receipt gone / block hash changed / reverted
//!            │   PENDING    │──────────────────────────────────────────────▶ REORGED
//!            └──────┬───────┘
//!                   │ confirmations >= required
//!                   ▼
//!               CREDITED
//! ```
//!
//! A tick never retries internally. A deposit that could not be decided
//! (chain error, store error, not deep enough) is simply looked at again on
//! the next tick.

pub mod outcome;

pub use outcome::{DepositOutcome, DepositReport, ReorgReason, TickReport};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{error, info};

use crate::chain::{ChainObserver, ChainQueryError, Finality};
use crate::config::AppConfig;
use crate::ledger::{CreditOutcome, LedgerError, LedgerStore};
use crate::models::Deposit;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Finality threshold
    pub required_confirmations: u64,
    pub poll_interval: Duration,
    /// Deadline for one deposit's chain lookup
    pub query_timeout: Duration,
}

impl ReconcilerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            required_confirmations: config.chain.required_confirmations,
            poll_interval: config.reconciler.poll_interval(),
            query_timeout: Duration::from_millis(config.chain.query_timeout_ms),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    observer: Arc<dyn ChainObserver>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        observer: Arc<dyn ChainObserver>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            observer,
            settings,
        }
    }

    /// Tick until a shutdown signal arrives (or its sender is dropped).
    ///
    /// Shutdown is only observed between ticks; a tick in progress runs to
    /// completion.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            chain = self.observer.chain_id(),
            required_confirmations = self.settings.required_confirmations,
            "Reconciler starting, poll interval: {:?}",
            self.settings.poll_interval
        );

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.process_once().await {
                error!("Reconciliation tick failed: {}", e);
            }
        }
    }

    /// Run one tick over all pending deposits.
    ///
    /// Fails only if the pending list cannot be read; per-deposit failures
    /// are reported in the [`TickReport`].
    pub async fn process_once(&self) -> Result<TickReport, LedgerError> {
        let pending = self.store.pending_deposits().await?;

        let mut report = TickReport::default();
        for deposit in pending {
            let outcome = self.reconcile_deposit(&deposit).await;
            report.deposits.push(DepositReport {
                deposit_id: deposit.id,
                tx_hash: deposit.tx_hash,
                outcome,
            });
        }

        report.log();
        Ok(report)
    }

    async fn reconcile_deposit(&self, deposit: &Deposit) -> DepositOutcome {
        let finality = match self.query_finality(&deposit.tx_hash).await {
            Ok(finality) => finality,
            Err(e) => return DepositOutcome::Skipped(e),
        };

        let (observation, confirmations, reverted) = match finality {
            Finality::NotFound => {
                return self.mark_reorged(deposit, ReorgReason::ReceiptMissing).await;
            }
            Finality::Included {
                observation,
                confirmations,
                reverted,
            } => (observation, confirmations, reverted),
        };

        // Checked before anything is persisted, so the stored hash is still
        // the one from the earlier observation.
        if let Some(stored) = &deposit.observation
            && !stored.same_block_hash(&observation.block_hash)
        {
            let reason = ReorgReason::BlockHashChanged {
                stored: stored.block_hash.clone(),
                observed: observation.block_hash,
            };
            return self.mark_reorged(deposit, reason).await;
        }

        if let Err(e) = self
            .store
            .record_observation(deposit.id, &observation, confirmations)
            .await
        {
            return DepositOutcome::StoreFailed(e);
        }

        if reverted {
            return self.mark_reorged(deposit, ReorgReason::Reverted).await;
        }

        let required = self.settings.required_confirmations;
        if confirmations < required {
            return DepositOutcome::Confirming {
                confirmations,
                required,
            };
        }

        match self.store.credit_if_not_credited(deposit).await {
            Ok(CreditOutcome::Credited) => DepositOutcome::Credited { confirmations },
            Ok(CreditOutcome::AlreadyCredited) => DepositOutcome::AlreadyCredited,
            Err(e) => DepositOutcome::StoreFailed(e),
        }
    }

    async fn query_finality(&self, tx_hash: &str) -> Result<Finality, ChainQueryError> {
        let deadline = self.settings.query_timeout;
        timeout(deadline, self.observer.finality_info(tx_hash))
            .await
            .map_err(|_| deadline_exceeded(deadline))?
    }

    async fn mark_reorged(&self, deposit: &Deposit, reason: ReorgReason) -> DepositOutcome {
        match self.store.mark_deposit_reorged(deposit.id).await {
            Ok(()) => DepositOutcome::Reorged(reason),
            Err(e) => DepositOutcome::StoreFailed(e),
        }
    }
}

fn deadline_exceeded(deadline: Duration) -> ChainQueryError {
    ChainQueryError::Timeout(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX))
}
