//! Ledger Store
//!
//! The only mutation path for money movement. A credit increments the
//! account balance, flips the deposit to `credited` and appends the audit
//! row in one transaction, under an exclusive hold on the deposit row.
//!
//! - [`PgLedgerStore`] - PostgreSQL (`SELECT ... FOR UPDATE`)
//! - [`MemoryLedgerStore`] - in-process, per-row async locks

pub mod error;
pub mod memory;
pub mod pg;
pub mod store;

pub use error::LedgerError;
pub use memory::MemoryLedgerStore;
pub use pg::PgLedgerStore;
pub use store::{CreditOutcome, LedgerStore};
