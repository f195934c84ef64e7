//! PostgreSQL ledger store.
//!
//! Row locks are `SELECT ... FOR UPDATE` inside the operation's transaction;
//! a transaction dropped without commit rolls back.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use super::error::LedgerError;
use super::store::{
    CreditOutcome, LedgerStore, check_amount, credit_guard, reorg_guard, reversal_guard,
};
use crate::models::{
    AuditAction, AuditEntry, ChainObservation, Deposit, DepositId, DepositStatus, NewDeposit,
};

const CREATE_DEPOSITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS deposits (
    id            BIGSERIAL PRIMARY KEY,
    tx_hash       TEXT        NOT NULL UNIQUE,
    address       TEXT        NOT NULL,
    amount        BIGINT      NOT NULL CHECK (amount >= 0),
    confirmations BIGINT      NOT NULL DEFAULT 0,
    tx_block      BIGINT,
    block_hash    TEXT,
    status        TEXT        NOT NULL DEFAULT 'pending',
    received_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    credited_at   TIMESTAMPTZ
)"#;

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    address TEXT   PRIMARY KEY,
    balance BIGINT NOT NULL DEFAULT 0
)"#;

const CREATE_AUDITS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audits (
    id         BIGSERIAL   PRIMARY KEY,
    deposit_id BIGINT      NOT NULL REFERENCES deposits(id),
    action     TEXT        NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

const CREATE_DEPOSITS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS deposits_status_received_idx ON deposits (status, received_at)";

const DEPOSIT_COLUMNS: &str = "id, tx_hash, address, amount, confirmations, tx_block, block_hash, status, received_at, credited_at";

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        for statement in [
            CREATE_DEPOSITS_TABLE,
            CREATE_ACCOUNTS_TABLE,
            CREATE_AUDITS_TABLE,
            CREATE_DEPOSITS_STATUS_INDEX,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Ledger schema ready");
        Ok(())
    }

    /// Insert a pending deposit. Idempotent on `tx_hash`: returns the
    /// existing id when the transaction is already known.
    pub async fn insert_deposit(&self, deposit: &NewDeposit) -> Result<DepositId, LedgerError> {
        check_amount(deposit.amount)?;

        let inserted: Option<DepositId> = sqlx::query_scalar(
            r#"INSERT INTO deposits (tx_hash, address, amount, confirmations, status, received_at)
               VALUES ($1, $2, $3, 0, 'pending', $4)
               ON CONFLICT (tx_hash) DO NOTHING
               RETURNING id"#,
        )
        .bind(&deposit.tx_hash)
        .bind(&deposit.address)
        .bind(deposit.amount)
        .bind(deposit.received_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(id);
        }

        let existing = sqlx::query_scalar("SELECT id FROM deposits WHERE tx_hash = $1")
            .bind(&deposit.tx_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(existing)
    }

    async fn fetch_deposits(&self, sql: &str) -> Result<Vec<Deposit>, LedgerError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(deposit_from_row).collect()
    }

    /// Lock the deposit row for the rest of `tx` and return its status
    async fn lock_status(
        tx: &mut Transaction<'static, Postgres>,
        id: DepositId,
    ) -> Result<(DepositStatus, String, i64), LedgerError> {
        let row = sqlx::query("SELECT status, address, amount FROM deposits WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(LedgerError::NotFound(id))?;

        let status = parse_status(row.try_get("status")?)?;
        Ok((status, row.try_get("address")?, row.try_get("amount")?))
    }

    async fn append_audit(
        tx: &mut Transaction<'static, Postgres>,
        id: DepositId,
        action: AuditAction,
    ) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO audits (deposit_id, action, created_at) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(action.as_str())
            .bind(Utc::now())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn pending_deposits(&self) -> Result<Vec<Deposit>, LedgerError> {
        self.fetch_deposits(&format!(
            "SELECT {} FROM deposits WHERE status = 'pending' ORDER BY received_at ASC, id ASC",
            DEPOSIT_COLUMNS
        ))
        .await
    }

    async fn list_deposits(&self) -> Result<Vec<Deposit>, LedgerError> {
        self.fetch_deposits(&format!(
            "SELECT {} FROM deposits ORDER BY received_at DESC, id DESC",
            DEPOSIT_COLUMNS
        ))
        .await
    }

    async fn get_deposit(&self, id: DepositId) -> Result<Option<Deposit>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {} FROM deposits WHERE id = $1", DEPOSIT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deposit_from_row).transpose()
    }

    async fn record_observation(
        &self,
        id: DepositId,
        observation: &ChainObservation,
        confirmations: u64,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"UPDATE deposits
               SET tx_block = $1, block_hash = $2, confirmations = $3
               WHERE id = $4 AND status = 'pending'"#,
        )
        .bind(to_db_int(observation.block)?)
        .bind(&observation.block_hash)
        .bind(to_db_int(confirmations)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(deposit_id = id, "Observation not recorded: deposit no longer pending");
        }
        Ok(())
    }

    async fn credit_if_not_credited(&self, deposit: &Deposit) -> Result<CreditOutcome, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let (status, address, amount) = Self::lock_status(&mut tx, deposit.id).await?;
        if let Some(outcome) = credit_guard(deposit.id, status)? {
            tx.rollback().await?;
            return Ok(outcome);
        }

        sqlx::query(
            r#"INSERT INTO accounts (address, balance) VALUES ($1, $2)
               ON CONFLICT (address)
               DO UPDATE SET balance = accounts.balance + EXCLUDED.balance"#,
        )
        .bind(&address)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE deposits SET status = 'credited', credited_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(deposit.id)
            .execute(&mut *tx)
            .await?;

        Self::append_audit(&mut tx, deposit.id, AuditAction::Credited).await?;
        tx.commit().await?;

        Ok(CreditOutcome::Credited)
    }

    async fn mark_deposit_reorged(&self, id: DepositId) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let (status, _, _) = Self::lock_status(&mut tx, id).await?;
        reorg_guard(id, status)?;

        sqlx::query("UPDATE deposits SET status = 'reorged' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        Self::append_audit(&mut tx, id, AuditAction::Reorged).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reverse_credit(&self, id: DepositId) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let (status, address, amount) = Self::lock_status(&mut tx, id).await?;
        reversal_guard(id, status)?;

        sqlx::query("UPDATE accounts SET balance = balance - $1 WHERE address = $2")
            .bind(amount)
            .bind(&address)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE deposits SET status = 'reversed' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        Self::append_audit(&mut tx, id, AuditAction::Reversed).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn audit_trail(&self, id: DepositId) -> Result<Vec<AuditEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT deposit_id, action, created_at FROM audits WHERE deposit_id = $1 ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<AuditEntry, LedgerError> {
                let action: String = r.try_get("action")?;
                Ok(AuditEntry {
                    deposit_id: r.try_get("deposit_id")?,
                    action: action.parse().map_err(|e| LedgerError::Corrupt(format!("{}", e)))?,
                    timestamp: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn balance(&self, address: &str) -> Result<Option<i64>, LedgerError> {
        let balance = sqlx::query_scalar("SELECT balance FROM accounts WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }
}

fn parse_status(raw: String) -> Result<DepositStatus, LedgerError> {
    raw.parse().map_err(|e| LedgerError::Corrupt(format!("{}", e)))
}

fn to_db_int(value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| LedgerError::Corrupt(format!("{} exceeds BIGINT", value)))
}

fn from_db_int(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupt(format!("negative {}: {}", column, value)))
}

fn deposit_from_row(row: &PgRow) -> Result<Deposit, LedgerError> {
    let tx_block: Option<i64> = row.try_get("tx_block")?;
    let block_hash: Option<String> = row.try_get("block_hash")?;
    let observation = match (tx_block, block_hash) {
        (Some(block), Some(hash)) => Some(ChainObservation::new(from_db_int(block, "tx_block")?, hash)),
        _ => None,
    };

    Ok(Deposit {
        id: row.try_get("id")?,
        tx_hash: row.try_get("tx_hash")?,
        address: row.try_get("address")?,
        amount: row.try_get("amount")?,
        confirmations: from_db_int(row.try_get("confirmations")?, "confirmations")?,
        observation,
        status: parse_status(row.try_get("status")?)?,
        received_at: row.try_get("received_at")?,
        credited_at: row.try_get("credited_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Run with: DATABASE_URL=postgres://... cargo test -- --ignored
    async fn test_store() -> PgLedgerStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let db = crate::db::Database::connect(&url).await.unwrap();
        let store = PgLedgerStore::new(db.pool().clone());
        store.ensure_schema().await.unwrap();
        store
    }

    fn unique(prefix: &str) -> String {
        format!("{}-{}", prefix, Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    #[test]
    fn test_db_int_conversions() {
        assert_eq!(to_db_int(42).unwrap(), 42);
        assert!(to_db_int(u64::MAX).is_err());
        assert_eq!(from_db_int(7, "tx_block").unwrap(), 7);
        assert!(from_db_int(-1, "tx_block").is_err());
        assert!(parse_status("bogus".to_string()).is_err());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_credit_is_idempotent() {
        let store = test_store().await;
        let address = unique("0xaddr");
        let id = store
            .insert_deposit(&NewDeposit::new(unique("0xtx"), &address, 1000))
            .await
            .unwrap();
        let deposit = store.get_deposit(id).await.unwrap().unwrap();
        assert!(deposit.observation.is_none());

        assert_eq!(
            store.credit_if_not_credited(&deposit).await.unwrap(),
            CreditOutcome::Credited
        );
        assert_eq!(
            store.credit_if_not_credited(&deposit).await.unwrap(),
            CreditOutcome::AlreadyCredited
        );
        assert_eq!(store.balance(&address).await.unwrap(), Some(1000));
        assert_eq!(store.audit_trail(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_concurrent_credit_single_increment() {
        let store = Arc::new(test_store().await);
        let address = unique("0xaddr");
        let id = store
            .insert_deposit(&NewDeposit::new(unique("0xtx"), &address, 250))
            .await
            .unwrap();
        let deposit = store.get_deposit(id).await.unwrap().unwrap();

        let attempts = (0..8).map(|_| {
            let store = store.clone();
            let deposit = deposit.clone();
            tokio::spawn(async move { store.credit_if_not_credited(&deposit).await })
        });
        let results = futures::future::join_all(attempts).await;
        let credited = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(CreditOutcome::Credited))))
            .count();

        assert_eq!(credited, 1);
        assert_eq!(store.balance(&address).await.unwrap(), Some(250));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_pg_reverse_pending_is_rejected() {
        let store = test_store().await;
        let address = unique("0xaddr");
        let id = store
            .insert_deposit(&NewDeposit::new(unique("0xtx"), &address, 500))
            .await
            .unwrap();

        let err = store.reverse_credit(id).await.unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(store.balance(&address).await.unwrap(), None);
        assert!(store.audit_trail(id).await.unwrap().is_empty());
    }
}
