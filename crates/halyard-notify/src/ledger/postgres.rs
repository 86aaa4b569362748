//! Postgres ledger store.
//!
//! Lookups lock the row with `FOR UPDATE`. Concurrent first inserts for one
//! event collide on the primary key; the loser's unique violation surfaces
//! as [`halyard_core::Error::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use halyard_core::Result;
use halyard_core::tx::postgres::{PgDatabase, PgTx, map_sqlx_error};

use super::{LedgerEntry, LedgerStore};

/// Schema for the ledger table.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS events (
    event_id     TEXT PRIMARY KEY,
    event_type   TEXT NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ
);
";

#[derive(Debug, FromRow)]
struct EventRow {
    event_id: String,
    event_type: String,
    processed_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<EventRow> for LedgerEntry {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            event_type: row.event_type,
            processed_at: row.processed_at,
            completed_at: row.completed_at,
        }
    }
}

#[async_trait]
impl LedgerStore for PgDatabase {
    async fn find_for_update(&self, tx: &mut PgTx, event_id: &str) -> Result<Option<LedgerEntry>> {
        let row: Option<EventRow> = sqlx::query_as(
            "SELECT event_id, event_type, processed_at, completed_at \
             FROM events WHERE event_id = $1 FOR UPDATE",
        )
        .bind(event_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to fetch event", e))?;
        Ok(row.map(LedgerEntry::from))
    }

    async fn insert_entry(
        &self,
        tx: &mut PgTx,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO events (event_id, event_type, processed_at) VALUES ($1, $2, $3)")
            .bind(event_id)
            .bind(event_type)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("failed to create event", e))?;
        Ok(())
    }

    async fn set_completed(&self, tx: &mut PgTx, event_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE events SET completed_at = COALESCE(completed_at, $2) WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to set event completed", e))?;
        Ok(result.rows_affected() > 0)
    }
}
