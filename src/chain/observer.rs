use async_trait::async_trait;

use super::error::ChainQueryError;
use crate::models::ChainObservation;

/// Read-only view of a chain's head and transaction finality
#[async_trait]
pub trait ChainObserver: Send + Sync {
    /// Chain identifier for logging (e.g. "ETH")
    fn chain_id(&self) -> &str;

    /// Current head height of the canonical chain
    async fn head_height(&self) -> Result<u64, ChainQueryError>;

    /// Look up the receipt for `tx_hash` and derive its confirmation depth.
    ///
    /// A missing receipt is `Ok(Finality::NotFound)`, not an error.
    async fn finality_info(&self, tx_hash: &str) -> Result<Finality, ChainQueryError>;
}

/// What the chain currently says about a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finality {
    /// No receipt: dropped, reorganized out, or never mined
    NotFound,
    Included {
        observation: ChainObservation,
        confirmations: u64,
        /// Executed but failed on chain
        reverted: bool,
    },
}

impl Finality {
    pub fn is_found(&self) -> bool {
        matches!(self, Finality::Included { .. })
    }
}

/// Blocks including and after `block`, relative to `head`.
///
/// A head that is momentarily behind the receipt's block (stale node) yields 0.
pub fn confirmations_at(head: u64, block: u64) -> u64 {
    if head >= block { head - block + 1 } else { 0 }
}
