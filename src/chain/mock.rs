//! Deterministic in-memory chain for tests and local demos.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::error::ChainQueryError;
use super::observer::{ChainObserver, Finality, confirmations_at};
use crate::models::ChainObservation;

#[derive(Debug, Clone)]
struct MockTx {
    block: u64,
    block_hash: String,
    reverted: bool,
}

#[derive(Default)]
struct MockState {
    head: u64,
    txs: HashMap<String, MockTx>,
    failing: HashSet<String>,
    head_failing: bool,
}

/// Scriptable chain: the test sets the head and the receipts, then the
/// observer answers exactly what was scripted.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
    finality_queries: AtomicUsize,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    /// Include `tx_hash` in `block`. Re-including under a different hash
    /// simulates the transaction landing in a replacement block after a reorg.
    pub fn include_tx(&self, tx_hash: &str, block: u64, block_hash: &str) {
        self.state().txs.insert(
            tx_hash.to_string(),
            MockTx {
                block,
                block_hash: block_hash.to_string(),
                reverted: false,
            },
        );
    }

    /// Include `tx_hash` with a failed execution status
    pub fn include_reverted_tx(&self, tx_hash: &str, block: u64, block_hash: &str) {
        self.state().txs.insert(
            tx_hash.to_string(),
            MockTx {
                block,
                block_hash: block_hash.to_string(),
                reverted: true,
            },
        );
    }

    /// Drop the receipt, as if the containing block was reorganized out
    pub fn drop_tx(&self, tx_hash: &str) {
        self.state().txs.remove(tx_hash);
    }

    /// Make every query for `tx_hash` fail with a transport error
    pub fn fail_tx(&self, tx_hash: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(tx_hash.to_string());
        } else {
            state.failing.remove(tx_hash);
        }
    }

    /// Make head queries (and hence every finality lookup) fail
    pub fn fail_head(&self, failing: bool) {
        self.state().head_failing = failing;
    }

    /// Number of `finality_info` calls answered so far
    pub fn finality_queries(&self) -> usize {
        self.finality_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainObserver for MockChain {
    fn chain_id(&self) -> &str {
        "MOCK"
    }

    async fn head_height(&self) -> Result<u64, ChainQueryError> {
        let state = self.state();
        if state.head_failing {
            return Err(ChainQueryError::Transport("mock head unavailable".to_string()));
        }
        Ok(state.head)
    }

    async fn finality_info(&self, tx_hash: &str) -> Result<Finality, ChainQueryError> {
        self.finality_queries.fetch_add(1, Ordering::SeqCst);

        let state = self.state();
        if state.failing.contains(tx_hash) {
            return Err(ChainQueryError::Transport(format!("mock failure for {}", tx_hash)));
        }

        let Some(tx) = state.txs.get(tx_hash) else {
            return Ok(Finality::NotFound);
        };
        if state.head_failing {
            return Err(ChainQueryError::Transport("mock head unavailable".to_string()));
        }

        Ok(Finality::Included {
            observation: ChainObservation::new(tx.block, tx.block_hash.clone()),
            confirmations: confirmations_at(state.head, tx.block),
            reverted: tx.reverted,
        })
    }
}
