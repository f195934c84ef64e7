//! Credit Engine - reorg-tolerant deposit reconciliation
//!
//! Tracks on-chain deposits against the canonical chain head and credits
//! the internal ledger exactly once per finalized deposit.
//!
//! ```text
//! ┌────────────┐  pending   ┌────────────┐  finality  ┌────────────┐
//! │   Ledger   │───────────▶│ Reconciler │───────────▶│   Chain    │
//! │   Store    │◀───────────│   (tick)   │◀───────────│  Observer  │
//! └────────────┘  tx write  └────────────┘            └────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Deposit, account and audit records
//! - [`chain`] - Chain Observer trait, live ETH RPC and in-memory mock
//! - [`ledger`] - Ledger Store trait, PostgreSQL and in-memory stores
//! - [`reconciler`] - Timer-driven per-deposit state machine
//! - [`status`] - Read-only status page
//! - [`config`], [`logging`], [`db`] - Process wiring

pub mod chain;
pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod reconciler;
pub mod status;

pub use chain::{ChainObserver, ChainQueryError, EthObserver, Finality, MockChain};
pub use config::AppConfig;
pub use ledger::{CreditOutcome, LedgerError, LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use models::{
    Account, AuditAction, AuditEntry, ChainObservation, Deposit, DepositId, DepositStatus,
    NewDeposit,
};
pub use reconciler::{DepositOutcome, ReconcilerSettings, Reconciler, ReorgReason, TickReport};
