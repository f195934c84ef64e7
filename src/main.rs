//! Credit Engine
//!
//! ```text
//! credit_engine [--env <name>] [--once] [--reverse <deposit_id>]
//! ```
//!
//! - default: reconcile on a timer and serve the status page until Ctrl-C
//! - `--once`: run a single reconciliation tick and exit
//! - `--reverse <id>`: operator reversal of a credited deposit

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::broadcast;
use tracing::{error, info};

use credit_engine::chain::{ChainObserver, EthObserver};
use credit_engine::config::AppConfig;
use credit_engine::db::Database;
use credit_engine::ledger::{LedgerStore, PgLedgerStore};
use credit_engine::models::DepositId;
use credit_engine::reconciler::{Reconciler, ReconcilerSettings};
use credit_engine::{logging, status};

fn arg_value(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn use_once_mode() -> bool {
    std::env::args().any(|a| a == "--once")
}

fn get_reverse_id() -> anyhow::Result<Option<DepositId>> {
    match arg_value(&["--reverse"]) {
        Some(raw) => match raw.parse() {
            Ok(id) => Ok(Some(id)),
            Err(_) => bail!("--reverse expects a deposit id, got '{}'", raw),
        },
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).context("loading configuration")?;
    let _log_guard = logging::init_logging(&config);

    info!(
        "Starting credit engine (build {}) in {} mode",
        env!("GIT_HASH"),
        env
    );

    let db = Database::connect(&config.postgres_url)
        .await
        .context("connecting to PostgreSQL")?;
    db.health_check().await.context("PostgreSQL health check")?;
    let store = Arc::new(PgLedgerStore::new(db.pool().clone()));
    store.ensure_schema().await?;

    if let Some(id) = get_reverse_id()? {
        return reverse(store.as_ref(), id).await;
    }

    let observer: Arc<dyn ChainObserver> = Arc::new(EthObserver::new(&config.chain)?);
    let reconciler = Reconciler::new(
        store.clone(),
        observer,
        ReconcilerSettings::from_config(&config),
    );

    if use_once_mode() {
        let report = reconciler.process_once().await?;
        println!(
            "processed {} pending deposits: {} credited, {} reorged, {} confirming, {} failed",
            report.deposits.len(),
            report.credited(),
            report.reorged(),
            report.confirming(),
            report.failed()
        );
        return Ok(());
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    let status_task = if config.status.enabled {
        let status_store: Arc<dyn LedgerStore> = store.clone();
        Some(status::spawn(
            config.status.clone(),
            status_store,
            shutdown_tx.subscribe(),
        ))
    } else {
        None
    };

    let shutdown_rx = shutdown_tx.subscribe();
    let reconciler_task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(());

    reconciler_task.await?;
    if let Some(task) = status_task {
        task.await?.context("status page")?;
    }

    info!("Credit engine stopped");
    Ok(())
}

async fn reverse(store: &dyn LedgerStore, id: DepositId) -> anyhow::Result<()> {
    match store.reverse_credit(id).await {
        Ok(()) => {
            info!(deposit_id = id, "Deposit credit reversed");
            println!("deposit {} reversed", id);
            Ok(())
        }
        Err(e) => {
            error!(deposit_id = id, "Reversal rejected: {}", e);
            Err(e.into())
        }
    }
}
