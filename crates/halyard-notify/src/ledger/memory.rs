//! In-memory ledger store for testing.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use halyard_core::tx::memory::{MemoryDatabase, MemoryTx};
use halyard_core::{Error, Result};

use super::{LedgerEntry, LedgerStore};

/// Rows backing the in-memory ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerTable {
    entries: BTreeMap<String, LedgerEntry>,
}

impl LedgerTable {
    /// Returns every row, ordered by event id.
    #[must_use]
    pub fn entries(&self) -> Vec<&LedgerEntry> {
        self.entries.values().collect()
    }

    /// Returns the row for `event_id`.
    #[must_use]
    pub fn get(&self, event_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(event_id)
    }
}

/// In-memory ledger store.
pub type MemoryLedgerStore = MemoryDatabase<LedgerTable>;

type Tx = MemoryTx<LedgerTable>;

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_for_update(&self, tx: &mut Tx, event_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(tx.state().entries.get(event_id).cloned())
    }

    async fn insert_entry(
        &self,
        tx: &mut Tx,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entries = &mut tx.state_mut().entries;
        if entries.contains_key(event_id) {
            return Err(Error::conflict(format!("event {event_id} already recorded")));
        }
        entries.insert(
            event_id.to_string(),
            LedgerEntry {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                processed_at: now,
                completed_at: None,
            },
        );
        Ok(())
    }

    async fn set_completed(&self, tx: &mut Tx, event_id: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(match tx.state_mut().entries.get_mut(event_id) {
            Some(entry) => {
                entry.completed_at.get_or_insert(now);
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::{EventLedger, LedgerDecision};
    use std::sync::Arc;
    use std::time::Duration;

    fn ledger() -> (Arc<MemoryLedgerStore>, EventLedger<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::default());
        let ledger = EventLedger::new(Arc::clone(&store), Duration::from_secs(60));
        (store, ledger)
    }

    #[tokio::test]
    async fn replay_windows() {
        let (_, ledger) = ledger();
        let t0 = Utc::now();

        assert_eq!(
            ledger.begin_or_join_at("E1", "account.created", t0).await.unwrap(),
            LedgerDecision::FirstAttempt
        );
        assert_eq!(
            ledger
                .begin_or_join_at("E1", "account.created", t0 + chrono::Duration::seconds(5))
                .await
                .unwrap(),
            LedgerDecision::OwnedByOther
        );
        assert_eq!(
            ledger
                .begin_or_join_at("E1", "account.created", t0 + chrono::Duration::seconds(61))
                .await
                .unwrap(),
            LedgerDecision::RetryEligible
        );

        ledger.mark_completed("E1").await.unwrap();
        assert_eq!(
            ledger
                .begin_or_join_at("E1", "account.created", t0 + chrono::Duration::seconds(62))
                .await
                .unwrap(),
            LedgerDecision::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn retry_does_not_refresh_first_seen() {
        let (store, ledger) = ledger();
        let t0 = Utc::now();
        ledger.begin_or_join_at("E2", "t", t0).await.unwrap();
        ledger
            .begin_or_join_at("E2", "t", t0 + chrono::Duration::seconds(90))
            .await
            .unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.get("E2").unwrap().processed_at, t0);
    }

    #[tokio::test]
    async fn every_consumer_finding_a_stale_entry_may_retry_it() {
        let (_, ledger) = ledger();
        let t0 = Utc::now();
        ledger.begin_or_join_at("E3", "t", t0).await.unwrap();

        let stale = t0 + chrono::Duration::seconds(61);
        let (a, b) = tokio::join!(
            ledger.begin_or_join_at("E3", "t", stale),
            ledger.begin_or_join_at("E3", "t", stale),
        );

        assert_eq!(a.unwrap(), LedgerDecision::RetryEligible);
        assert_eq!(b.unwrap(), LedgerDecision::RetryEligible);
    }

    #[tokio::test]
    async fn mark_completed_is_idempotent_and_keeps_first_time() {
        let (store, ledger) = ledger();
        let t0 = Utc::now();
        ledger.begin_or_join_at("E3", "t", t0).await.unwrap();

        ledger.mark_completed_at("E3", t0 + chrono::Duration::seconds(1)).await.unwrap();
        ledger.mark_completed_at("E3", t0 + chrono::Duration::seconds(9)).await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(
            snapshot.get("E3").unwrap().completed_at,
            Some(t0 + chrono::Duration::seconds(1))
        );
    }

    #[tokio::test]
    async fn completing_an_unseen_event_is_not_found() {
        let (_, ledger) = ledger();
        let err = ledger.mark_completed("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn store_failure_is_not_a_decision() {
        let (store, ledger) = ledger();
        store.fail_next_begin();
        let err = ledger.begin_or_join("E4", "t").await.unwrap_err();
        assert!(matches!(err, Error::Transaction { .. }));
        assert!(store.snapshot().await.entries().is_empty());
    }
}
