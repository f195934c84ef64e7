//! Live chain observer backed by an Ethereum JSON-RPC endpoint.
//!
//! Uses `eth_getTransactionReceipt` for inclusion/outcome and
//! `eth_blockNumber` for the head. Works against Geth, Anvil or any
//! provider speaking the standard API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::ChainQueryError;
use super::observer::{ChainObserver, Finality, confirmations_at};
use crate::config::ChainConfig;
use crate::models::ChainObservation;

/// Chain observer that talks to an Ethereum node over HTTP JSON-RPC
pub struct EthObserver {
    rpc_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Subset of the receipt object we rely on
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthReceipt {
    block_number: Option<String>,
    block_hash: Option<String>,
    /// "0x1" success, "0x0" failure. Absent on pre-Byzantium receipts.
    status: Option<String>,
}

impl EthObserver {
    pub fn new(config: &ChainConfig) -> Result<Self, ChainQueryError> {
        info!("Initializing ETH observer at {}", config.rpc_url);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ChainQueryError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            rpc_url: config.rpc_url.clone(),
            client,
        })
    }

    /// Make a JSON-RPC call. A `null` result is returned as `None`.
    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<Option<R>, ChainQueryError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainQueryError::Transport(format!("{} request failed: {}", method, e)))?;

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| ChainQueryError::Malformed(format!("{}: {}", method, e)))?;

        if let Some(error) = rpc_response.error {
            return Err(ChainQueryError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(rpc_response.result)
    }
}

#[async_trait]
impl ChainObserver for EthObserver {
    fn chain_id(&self) -> &str {
        "ETH"
    }

    async fn head_height(&self) -> Result<u64, ChainQueryError> {
        let result: String = self
            .rpc_call("eth_blockNumber", Vec::<()>::new())
            .await?
            .ok_or_else(|| ChainQueryError::Malformed("eth_blockNumber returned null".to_string()))?;
        parse_quantity(&result)
    }

    async fn finality_info(&self, tx_hash: &str) -> Result<Finality, ChainQueryError> {
        let receipt: Option<EthReceipt> = self
            .rpc_call("eth_getTransactionReceipt", [tx_hash])
            .await?;

        let Some(receipt) = receipt else {
            debug!(tx_hash, "No receipt on chain");
            return Ok(Finality::NotFound);
        };

        // Head is read after the receipt so it is normally at or above the
        // receipt's block.
        let head = self.head_height().await?;
        finality_from_receipt(&receipt, head)
    }
}

fn finality_from_receipt(receipt: &EthReceipt, head: u64) -> Result<Finality, ChainQueryError> {
    // Some nodes return a receipt skeleton for transactions still in the mempool.
    let (Some(number), Some(hash)) = (&receipt.block_number, &receipt.block_hash) else {
        return Ok(Finality::NotFound);
    };

    let block = parse_quantity(number)?;
    let reverted = match receipt.status.as_deref() {
        Some(status) => parse_quantity(status)? == 0,
        None => false,
    };

    Ok(Finality::Included {
        observation: ChainObservation::new(block, hash.to_lowercase()),
        confirmations: confirmations_at(head, block),
        reverted,
    })
}

/// Parse a JSON-RPC hex quantity ("0x1a")
pub fn parse_quantity(value: &str) -> Result<u64, ChainQueryError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ChainQueryError::Malformed(format!("Quantity without 0x prefix: {}", value)))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainQueryError::Malformed(format!("Invalid quantity '{}': {}", value, e)))
}
