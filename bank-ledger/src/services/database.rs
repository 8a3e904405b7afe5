//! PostgreSQL ledger store.

use crate::error::LedgerError;
use crate::models::{
    Account, CreateAccount, CreateEntry, CreateTransfer, Entry, Pagination, Transfer,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{LedgerQueries, LedgerStore, UnitOfWork};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{error, info, instrument};

/// SQLSTATE for `numeric_value_out_of_range` (bigint overflow on `balance + delta`).
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
/// SQLSTATE for `not_null_violation`.
const NOT_NULL_VIOLATION: &str = "23502";

/// Classify a failed write: backend rejections become `ConstraintViolation`,
/// transport failures become `ConnectionLost`.
fn map_write_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(ref db_err)
            if db_err.is_foreign_key_violation()
                || db_err.is_check_violation()
                || db_err.is_unique_violation()
                || matches!(
                    db_err.code().as_deref(),
                    Some(NUMERIC_VALUE_OUT_OF_RANGE) | Some(NOT_NULL_VIOLATION)
                ) =>
        {
            match db_err.constraint() {
                Some(constraint) => LedgerError::ConstraintViolation(format!(
                    "{} rejected by {}: {}",
                    operation,
                    constraint,
                    db_err.message()
                )),
                None => LedgerError::ConstraintViolation(format!(
                    "{} rejected: {}",
                    operation,
                    db_err.message()
                )),
            }
        }
        _ => map_read_error(operation, err),
    }
}

fn map_read_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            LedgerError::ConnectionLost(anyhow::anyhow!("Failed to {}: {}", operation, err))
        }
        _ => LedgerError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", operation, err)),
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "bank-ledger"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| {
                LedgerError::ConnectionFailure(anyhow::anyhow!("Failed to connect: {}", e))
            })?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_read_error("run health check", e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Database {
    type UnitOfWork = PgUnitOfWork;

    #[instrument(skip(self))]
    async fn begin(&self) -> Result<PgUnitOfWork, LedgerError> {
        let tx = self.pool.begin().await.map_err(|e| {
            LedgerError::ConnectionFailure(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;
        Ok(PgUnitOfWork { tx })
    }
}

/// A PostgreSQL transaction. Dropping it unfinished rolls it back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    #[instrument(
        skip(self, input),
        fields(
            from_account_id = input.from_account_id,
            to_account_id = input.to_account_id
        )
    )]
    async fn create_transfer(&mut self, input: &CreateTransfer) -> Result<Transfer, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_transfer"])
            .start_timer();

        let transfer = sqlx::query_as::<_, Transfer>(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(input.from_account_id)
        .bind(input.to_account_id)
        .bind(input.amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_write_error("create transfer", e))?;

        timer.observe_duration();

        Ok(transfer)
    }

    #[instrument(skip(self, input), fields(account_id = input.account_id))]
    async fn create_entry(&mut self, input: &CreateEntry) -> Result<Entry, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_entry"])
            .start_timer();

        let entry = sqlx::query_as::<_, Entry>(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(input.account_id)
        .bind(input.amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_write_error("create entry", e))?;

        timer.observe_duration();

        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn add_account_balance(
        &mut self,
        account_id: i64,
        delta: i64,
    ) -> Result<Account, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_account_balance"])
            .start_timer();

        // Server-side increment: takes the row lock and reads the latest committed balance.
        let account = sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts
            SET balance = balance + $1
            WHERE id = $2
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(delta)
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_write_error("add account balance", e))?;

        timer.observe_duration();

        account.ok_or(LedgerError::AccountNotFound(account_id))
    }

    async fn commit(self) -> Result<(), LedgerError> {
        self.tx.commit().await.map_err(|e| {
            LedgerError::CommitFailure(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.tx.rollback().await.map_err(|e| {
            error!(error = %e, "Failed to roll back transaction");
            LedgerError::RollbackFailure(anyhow::anyhow!("Failed to roll back transaction: {}", e))
        })
    }
}

#[async_trait]
impl LedgerQueries for Database {
    #[instrument(skip(self, input), fields(owner = %input.owner, currency = %input.currency))]
    async fn create_account(&self, input: &CreateAccount) -> Result<Account, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, $2, $3)
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(&input.owner)
        .bind(input.balance)
        .bind(input.currency.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error("create account", e))?;

        timer.observe_duration();

        info!(account_id = account.id, "Account created");

        Ok(account)
    }

    #[instrument(skip(self))]
    async fn get_account(&self, account_id: i64) -> Result<Option<Account>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_read_error("get account", e))?;

        timer.observe_duration();

        Ok(account)
    }

    #[instrument(skip(self))]
    async fn list_accounts(&self, page: Pagination) -> Result<Vec<Account>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_accounts"])
            .start_timer();

        let accounts = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            ORDER BY id
            LIMIT $1
            OFFSET $2
            "#,
        )
        .bind(page.clamped_limit())
        .bind(page.clamped_offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_read_error("list accounts", e))?;

        timer.observe_duration();

        Ok(accounts)
    }

    #[instrument(skip(self))]
    async fn update_account(
        &self,
        account_id: i64,
        balance: i64,
    ) -> Result<Option<Account>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts
            SET balance = $2
            WHERE id = $1
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(account_id)
        .bind(balance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_write_error("update account", e))?;

        timer.observe_duration();

        Ok(account)
    }

    #[instrument(skip(self))]
    async fn delete_account(&self, account_id: i64) -> Result<bool, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_account"])
            .start_timer();

        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error("delete account", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_entry(&self, entry_id: i64) -> Result<Option<Entry>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_entry"])
            .start_timer();

        let entry = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_read_error("get entry", e))?;

        timer.observe_duration();

        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn list_entries(
        &self,
        account_id: i64,
        page: Pagination,
    ) -> Result<Vec<Entry>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE account_id = $1
            ORDER BY id
            LIMIT $2
            OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(page.clamped_limit())
        .bind(page.clamped_offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_read_error("list entries", e))?;

        timer.observe_duration();

        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn get_transfer(&self, transfer_id: i64) -> Result<Option<Transfer>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transfer"])
            .start_timer();

        let transfer = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE id = $1
            "#,
        )
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_read_error("get transfer", e))?;

        timer.observe_duration();

        Ok(transfer)
    }

    #[instrument(skip(self))]
    async fn list_transfers(
        &self,
        from_account_id: i64,
        to_account_id: i64,
        page: Pagination,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transfers"])
            .start_timer();

        let transfers = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE from_account_id = $1 OR to_account_id = $2
            ORDER BY id
            LIMIT $3
            OFFSET $4
            "#,
        )
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(page.clamped_limit())
        .bind(page.clamped_offset())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_read_error("list transfers", e))?;

        timer.observe_duration();

        Ok(transfers)
    }
}
