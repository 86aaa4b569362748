//! Postgres transaction source backed by a `sqlx` connection pool.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use super::TransactionSource;
use crate::error::{Error, Result};

/// A live Postgres transaction.
pub type PgTx = Transaction<'static, Postgres>;

/// Pool settings for [`PgDatabase::connect`].
#[derive(Debug, Clone, Copy)]
pub struct PgPoolSettings {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Minimum idle connections kept open.
    pub min_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PgPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Postgres database shared by every store of a service.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a new pool to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the pool cannot be established.
    pub async fn connect(url: &str, settings: PgPoolSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| Error::database_with_source("failed to connect to database", e))?;
        Ok(Self { pool })
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies a multi-statement schema script.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if any statement fails.
    pub async fn apply_schema(&self, script: &str) -> Result<()> {
        sqlx::raw_sql(script)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::database_with_source("failed to apply schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl TransactionSource for PgDatabase {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::transaction_with_source("failed to begin database transaction", e))
    }

    async fn commit(&self, tx: PgTx) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| Error::transaction_with_source("failed to commit database transaction", e))
    }

    async fn rollback(&self, tx: PgTx) -> Result<()> {
        tx.rollback().await.map_err(|e| {
            Error::transaction_with_source("failed to roll back database transaction", e)
        })
    }
}

/// Maps a `sqlx` error, turning unique violations into [`Error::Conflict`].
#[must_use]
pub fn map_sqlx_error(message: &str, err: sqlx::Error) -> Error {
    let unique = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if unique {
        Error::conflict(format!("{message}: {err}"))
    } else {
        Error::database_with_source(message, err)
    }
}
