//! Read-only status page
//!
//! Lists deposits newest first. Never mutates the ledger.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::StatusConfig;
use crate::ledger::LedgerStore;
use crate::models::{Account, Deposit, DepositId, DepositStatus};

pub type StatusState = Arc<dyn LedgerStore>;

/// Unified API response wrapper: `code` 0 = success
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// One row of the deposit listing
#[derive(Debug, Serialize)]
pub struct DepositView {
    pub id: DepositId,
    pub tx_hash: String,
    pub address: String,
    pub amount: i64,
    pub confirmations: u64,
    pub tx_block: Option<u64>,
    pub block_hash: Option<String>,
    pub status: DepositStatus,
    pub received_at: DateTime<Utc>,
    pub credited_at: Option<DateTime<Utc>>,
}

impl From<Deposit> for DepositView {
    fn from(d: Deposit) -> Self {
        let (tx_block, block_hash) = match d.observation {
            Some(o) => (Some(o.block), Some(o.block_hash)),
            None => (None, None),
        };
        Self {
            id: d.id,
            tx_hash: d.tx_hash,
            address: d.address,
            amount: d.amount,
            confirmations: d.confirmations,
            tx_block,
            block_hash,
            status: d.status,
            received_at: d.received_at,
            credited_at: d.credited_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub timestamp_ms: i64,
}

pub fn router(store: StatusState) -> Router {
    Router::new()
        .route("/api/v1/deposits", get(list_deposits))
        .route("/api/v1/accounts/{address}", get(get_account))
        .route("/api/v1/health", get(health_check))
        .with_state(store)
}

/// Serve the status page until `shutdown` fires
pub async fn serve(
    config: &StatusConfig,
    store: StatusState,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("Status page listening on {}", listener.local_addr()?);

    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}

/// Run [`serve`] in the background. A failure such as a port conflict is
/// logged as soon as it happens and also returned through the handle.
pub fn spawn(
    config: StatusConfig,
    store: StatusState,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        let result = serve(&config, store, shutdown).await;
        if let Err(e) = &result {
            error!(
                "Status page on {}:{} failed: {}",
                config.host, config.port, e
            );
        }
        result
    })
}

pub async fn list_deposits(
    State(store): State<StatusState>,
) -> (StatusCode, Json<ApiResponse<Vec<DepositView>>>) {
    match store.list_deposits().await {
        Ok(deposits) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                deposits.into_iter().map(DepositView::from).collect(),
            )),
        ),
        Err(e) => {
            error!("Failed to list deposits: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(500, "failed to list deposits")),
            )
        }
    }
}

pub async fn get_account(
    State(store): State<StatusState>,
    Path(address): Path<String>,
) -> (StatusCode, Json<ApiResponse<Account>>) {
    match store.balance(&address).await {
        Ok(Some(balance)) => (
            StatusCode::OK,
            Json(ApiResponse::success(Account { address, balance })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(404, "account not found")),
        ),
        Err(e) => {
            error!("Failed to read account {}: {}", address, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(500, "failed to read account")),
            )
        }
    }
}

pub async fn health_check() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        timestamp_ms: Utc::now().timestamp_millis(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;
    use crate::models::{ChainObservation, NewDeposit};

    #[tokio::test]
    async fn test_list_deposits_view() {
        let store = Arc::new(MemoryLedgerStore::new());
        let observed = store.insert_deposit(&NewDeposit::new("0x01", "0xaddr", 10)).unwrap();
        store.insert_deposit(&NewDeposit::new("0x02", "0xaddr", 20)).unwrap();
        store
            .record_observation(observed, &ChainObservation::new(90, "0xhash"), 3)
            .await
            .unwrap();

        let (status, Json(body)) = list_deposits(State(store as StatusState)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.code, 0);

        let rows = body.data.unwrap();
        assert_eq!(rows.len(), 2);
        let row = rows.iter().find(|r| r.id == observed).unwrap();
        assert_eq!(row.tx_block, Some(90));
        assert_eq!(row.block_hash.as_deref(), Some("0xhash"));

        let json = serde_json::to_value(&rows).unwrap();
        let unobserved = json
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["tx_hash"] == "0x02")
            .unwrap();
        assert!(unobserved["tx_block"].is_null());
        assert_eq!(unobserved["status"], "pending");
    }

    #[tokio::test]
    async fn test_get_account() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.set_balance("0xaddr", 42);
        let state = store as StatusState;

        let (status, Json(body)) =
            get_account(State(state.clone()), Path("0xaddr".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body.data,
            Some(Account {
                address: "0xaddr".to_string(),
                balance: 42
            })
        );

        let (status, Json(body)) = get_account(State(state), Path("0xnone".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, 404);
    }

    #[tokio::test]
    async fn test_health_check() {
        let Json(body) = health_check().await;
        assert_eq!(body.code, 0);
        assert!(body.data.unwrap().timestamp_ms > 0);
    }

    #[tokio::test]
    async fn test_spawn_reports_port_conflict() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = StatusConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
        };
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = spawn(config, Arc::new(MemoryLedgerStore::new()), shutdown_rx);
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_error_response_omits_data() {
        let body: ApiResponse<Vec<DepositView>> = ApiResponse::error(500, "boom");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], 500);
        assert!(json.get("data").is_none());
    }
}
