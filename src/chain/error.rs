use thiserror::Error;

/// Failure to query the chain. Never persisted: the deposit is skipped for
/// the current tick and evaluated again on the next one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainQueryError {
    #[error("RPC transport failed: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Malformed(String),

    #[error("Chain query timed out after {0} ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),
}
