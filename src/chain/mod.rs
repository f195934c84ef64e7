//! Chain Observer
//!
//! Answers two questions about the chain: how high is the head, and where
//! (if anywhere) is a given transaction's receipt. The reconciliation loop
//! only sees the [`ChainObserver`] trait:
//! - [`EthObserver`] talks to a live JSON-RPC endpoint
//! - [`MockChain`] is a scriptable in-memory chain

pub mod error;
pub mod eth;
pub mod mock;
pub mod observer;

pub use error::ChainQueryError;
pub use eth::EthObserver;
pub use mock::MockChain;
pub use observer::{ChainObserver, Finality, confirmations_at};
