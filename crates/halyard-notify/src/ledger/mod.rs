//! Idempotent event ledger.
//!
//! One row per producer-assigned event identifier records when the event was
//! first seen and when its side effect completed. The ledger turns
//! at-least-once, possibly concurrent delivery into effectively-once
//! processing:
//!
//! | Row state | Decision |
//! |-----------|----------|
//! | absent | [`LedgerDecision::FirstAttempt`] (row inserted) |
//! | completed | [`LedgerDecision::AlreadyCompleted`] |
//! | unfinished, younger than the window | [`LedgerDecision::OwnedByOther`] |
//! | unfinished, at least as old as the window | [`LedgerDecision::RetryEligible`] |
//!
//! Concurrent first attempts for one identifier are resolved by the store's
//! uniqueness constraint; the loser observes `OwnedByOther`.
//!
//! The window is measured with the local wall clock against the stored
//! first-seen time. A retry does not refresh first-seen, so every consumer
//! that finds a stale entry may retry it.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use halyard_core::{Error, Result, TransactionSource, Transactor, UnitOfWork};

use crate::metrics::record_ledger_decision;

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Producer-assigned event identifier.
    pub event_id: String,
    /// Event type tag.
    pub event_type: String,
    /// When the event was first seen.
    pub processed_at: DateTime<Utc>,
    /// When the side effect completed; never cleared once set.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of [`EventLedger::begin_or_join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerDecision {
    /// The event had not been seen; this caller owns it.
    FirstAttempt,
    /// A previous attempt stalled past the ownership window.
    RetryEligible,
    /// The side effect already happened.
    AlreadyCompleted,
    /// Another attempt is in flight.
    OwnedByOther,
}

impl LedgerDecision {
    /// Derives the decision for an existing row (or none) at `now`.
    #[must_use]
    pub fn for_entry(
        entry: Option<&LedgerEntry>,
        now: DateTime<Utc>,
        processing_timeout: chrono::Duration,
    ) -> Self {
        match entry {
            None => Self::FirstAttempt,
            Some(entry) if entry.completed_at.is_some() => Self::AlreadyCompleted,
            Some(entry) if now - entry.processed_at >= processing_timeout => Self::RetryEligible,
            Some(_) => Self::OwnedByOther,
        }
    }

    /// Returns whether the caller should run the side effect.
    #[must_use]
    pub const fn should_process(self) -> bool {
        matches!(self, Self::FirstAttempt | Self::RetryEligible)
    }

    /// Returns the decision as a stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FirstAttempt => "first_attempt",
            Self::RetryEligible => "retry_eligible",
            Self::AlreadyCompleted => "already_completed",
            Self::OwnedByOther => "owned_by_other",
        }
    }
}

impl fmt::Display for LedgerDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger persistence.
#[async_trait]
pub trait LedgerStore: TransactionSource {
    /// Loads the row for `event_id`, locking it for the rest of the transaction.
    async fn find_for_update(&self, tx: &mut Self::Tx, event_id: &str)
    -> Result<Option<LedgerEntry>>;

    /// Inserts a new row.
    ///
    /// Returns [`Error::Conflict`] if a row for `event_id` already exists.
    async fn insert_entry(
        &self,
        tx: &mut Self::Tx,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Sets the completion time unless already set.
    ///
    /// Returns `false` when no row exists.
    async fn set_completed(
        &self,
        tx: &mut Self::Tx,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Reads or claims a ledger row inside one transaction.
pub struct BeginOrJoin<'a, L> {
    /// Ledger store.
    pub store: &'a L,
    /// Event identifier.
    pub event_id: &'a str,
    /// Event type tag recorded on first sight.
    pub event_type: &'a str,
    /// Decision time.
    pub now: DateTime<Utc>,
    /// Ownership window.
    pub processing_timeout: chrono::Duration,
}

#[async_trait]
impl<L: LedgerStore> UnitOfWork<L::Tx> for BeginOrJoin<'_, L> {
    type Output = LedgerDecision;

    async fn run(self, tx: &mut L::Tx) -> Result<LedgerDecision> {
        let entry = self.store.find_for_update(tx, self.event_id).await?;
        let decision = LedgerDecision::for_entry(entry.as_ref(), self.now, self.processing_timeout);
        if decision == LedgerDecision::FirstAttempt {
            self.store
                .insert_entry(tx, self.event_id, self.event_type, self.now)
                .await?;
        }
        Ok(decision)
    }
}

struct MarkCompleted<'a, L> {
    store: &'a L,
    event_id: &'a str,
    now: DateTime<Utc>,
}

#[async_trait]
impl<L: LedgerStore> UnitOfWork<L::Tx> for MarkCompleted<'_, L> {
    type Output = bool;

    async fn run(self, tx: &mut L::Tx) -> Result<bool> {
        self.store.set_completed(tx, self.event_id, self.now).await
    }
}

struct Lookup<'a, L> {
    store: &'a L,
    event_id: &'a str,
}

#[async_trait]
impl<L: LedgerStore> UnitOfWork<L::Tx> for Lookup<'_, L> {
    type Output = Option<LedgerEntry>;

    async fn run(self, tx: &mut L::Tx) -> Result<Option<LedgerEntry>> {
        self.store.find_for_update(tx, self.event_id).await
    }
}

/// Durable idempotency ledger keyed by event identifier.
pub struct EventLedger<L> {
    store: Arc<L>,
    transactor: Transactor<L>,
    processing_timeout: chrono::Duration,
}

impl<L> fmt::Debug for EventLedger<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLedger")
            .field("processing_timeout", &self.processing_timeout)
            .finish_non_exhaustive()
    }
}

impl<L: LedgerStore> EventLedger<L> {
    /// Creates a ledger with the given ownership window.
    #[must_use]
    pub fn new(store: Arc<L>, processing_timeout: std::time::Duration) -> Self {
        Self {
            transactor: Transactor::new(Arc::clone(&store)),
            store,
            processing_timeout: chrono::Duration::from_std(processing_timeout)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Returns the ownership window.
    #[must_use]
    pub const fn processing_timeout(&self) -> chrono::Duration {
        self.processing_timeout
    }

    /// Decides how the caller should treat `event_id`, claiming it if unseen.
    ///
    /// # Errors
    ///
    /// Returns the store's error; a uniqueness conflict is reported as
    /// [`LedgerDecision::OwnedByOther`], not as an error.
    pub async fn begin_or_join(&self, event_id: &str, event_type: &str) -> Result<LedgerDecision> {
        self.begin_or_join_at(event_id, event_type, Utc::now()).await
    }

    /// [`EventLedger::begin_or_join`] with an explicit decision time.
    ///
    /// # Errors
    ///
    /// See [`EventLedger::begin_or_join`].
    #[tracing::instrument(skip(self, event_type, now), fields(decision = tracing::field::Empty))]
    pub async fn begin_or_join_at(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerDecision> {
        let outcome = self
            .transactor
            .run(
                None,
                BeginOrJoin {
                    store: &*self.store,
                    event_id,
                    event_type,
                    now,
                    processing_timeout: self.processing_timeout,
                },
            )
            .await;

        let decision = match outcome {
            Ok(decision) => decision,
            Err(Error::Conflict { .. }) => {
                tracing::debug!("lost first-attempt race");
                LedgerDecision::OwnedByOther
            }
            Err(err) => return Err(err),
        };

        tracing::Span::current().record("decision", decision.as_str());
        record_ledger_decision(decision.as_str());
        Ok(decision)
    }

    /// Records that the side effect of `event_id` completed.
    ///
    /// Calling it again keeps the first completion time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the event was never seen, or the
    /// store's error.
    pub async fn mark_completed(&self, event_id: &str) -> Result<()> {
        self.mark_completed_at(event_id, Utc::now()).await
    }

    /// [`EventLedger::mark_completed`] with an explicit completion time.
    ///
    /// # Errors
    ///
    /// See [`EventLedger::mark_completed`].
    #[tracing::instrument(skip(self, now))]
    pub async fn mark_completed_at(&self, event_id: &str, now: DateTime<Utc>) -> Result<()> {
        let found = self
            .transactor
            .run(
                None,
                MarkCompleted {
                    store: &*self.store,
                    event_id,
                    now,
                },
            )
            .await?;
        if found {
            Ok(())
        } else {
            Err(Error::not_found("ledger entry", event_id))
        }
    }

    /// Loads the row for `event_id`.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn entry(&self, event_id: &str) -> Result<Option<LedgerEntry>> {
        self.transactor
            .run(
                None,
                Lookup {
                    store: &*self.store,
                    event_id,
                },
            )
            .await
    }
}

/// Converts a decision into whether to process, reporting contention as an error.
///
/// # Errors
///
/// Returns [`Error::OwnershipContention`] for [`LedgerDecision::OwnedByOther`].
pub fn require_ownership(decision: LedgerDecision, event_id: &str) -> Result<bool> {
    match decision {
        LedgerDecision::FirstAttempt | LedgerDecision::RetryEligible => Ok(true),
        LedgerDecision::AlreadyCompleted => Ok(false),
        LedgerDecision::OwnedByOther => Err(Error::OwnershipContention {
            event_id: event_id.to_string(),
        }),
    }
}
