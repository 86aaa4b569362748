//! Event consumption loop.
//!
//! One loop per subscribed topic fetches and handles one message at a time,
//! so side effects within a partition happen in order.
//!
//! ```text
//! fetching ──▶ processing ──▶ committing ──▶ fetching
//!     │             │
//!     │             └─ failed or contended: not committed, redelivered later
//!     └─ cancelled: stopped
//! ```
//!
//! Processing consults the [`EventLedger`] first. A completed event is
//! committed without running the handler; an event owned by another
//! in-flight attempt is skipped without committing. Otherwise the handler
//! runs under the retry policy and the event is marked completed before the
//! offset is committed.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use halyard_core::observability::consumer_span;
use halyard_core::{Error, Result, RetryPolicy};

use crate::broker::{Message, MessageSource};
use crate::ledger::{EventLedger, LedgerStore, require_ownership};
use crate::metrics::record_consumer_outcome;

/// Performs the side effect for one kind of event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event type tag recorded in the ledger.
    fn event_type(&self) -> &str;

    /// Extracts the producer-assigned event identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the payload cannot be decoded.
    fn event_key(&self, message: &Message) -> Result<String>;

    /// Performs the side effect.
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Counters accumulated by a loop since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    /// Messages fetched.
    pub fetched: u64,
    /// Messages whose side effect ran and completed.
    pub processed: u64,
    /// Messages skipped because the event had already completed.
    pub duplicates: u64,
    /// Messages skipped because another attempt owned the event.
    pub contended: u64,
    /// Messages whose processing failed.
    pub failed: u64,
    /// Messages handled but not committed.
    pub commit_failures: u64,
    /// Failed fetches that were retried.
    pub fetch_failures: u64,
}

#[derive(Default)]
struct Counters {
    fetched: AtomicU64,
    processed: AtomicU64,
    duplicates: AtomicU64,
    contended: AtomicU64,
    failed: AtomicU64,
    commit_failures: AtomicU64,
    fetch_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            fetched: self.fetched.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

enum Outcome {
    Processed,
    AlreadyCompleted,
    Contended,
}

/// Consumes one topic through an idempotency ledger.
pub struct ConsumerLoop<M: ?Sized, L, H: ?Sized> {
    name: String,
    source: Arc<M>,
    ledger: Arc<EventLedger<L>>,
    handler: Arc<H>,
    policy: RetryPolicy,
    counters: Counters,
}

impl<M: ?Sized, L, H: ?Sized> std::fmt::Debug for ConsumerLoop<M, L, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLoop")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<M, L, H> ConsumerLoop<M, L, H>
where
    M: MessageSource + ?Sized,
    L: LedgerStore,
    H: EventHandler + ?Sized,
{
    /// Creates a loop named `name` (used in logs).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: Arc<M>,
        ledger: Arc<EventLedger<L>>,
        handler: Arc<H>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            ledger,
            handler,
            policy,
            counters: Counters::default(),
        }
    }

    /// Counters accumulated across every run of this loop.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Runs until `cancel` fires or the source fails for good.
    ///
    /// The loop only ever stops with an error. Counters stay readable
    /// through [`ConsumerLoop::stats`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] once `cancel` fires, or a fetch error the
    /// retry policy does not consider retryable. Handler and commit failures
    /// are logged and never stop the loop.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Infallible> {
        let span = consumer_span(self.source.topic(), &self.name);
        let reason = self.run_inner(cancel).instrument(span.clone()).await;
        let stats = self.stats();
        span.in_scope(|| {
            tracing::info!(
                fetched = stats.fetched,
                processed = stats.processed,
                failed = stats.failed,
                reason = %reason,
                "consumer stopped"
            );
        });
        Err(reason)
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Error {
        let counters = &self.counters;
        let mut fetch_failures_in_row = 0_u32;
        tracing::info!("consumer started");

        loop {
            let message = match self.source.fetch(cancel).await {
                Ok(message) => {
                    fetch_failures_in_row = 0;
                    message
                }
                Err(Error::Cancelled) => return Error::Cancelled,
                Err(err) if self.policy.is_retryable(&err) => {
                    Counters::bump(&counters.fetch_failures);
                    tracing::warn!(error = %err, "failed to fetch message");
                    if let Err(err) = self.policy.wait(fetch_failures_in_row, cancel).await {
                        return err;
                    }
                    fetch_failures_in_row = fetch_failures_in_row.saturating_add(1);
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to fetch message; stopping");
                    return err;
                }
            };
            Counters::bump(&counters.fetched);

            let span = tracing::info_span!(
                "message",
                partition = message.partition,
                offset = message.offset,
                key = %message.key,
                event_id = tracing::field::Empty,
            );
            let outcome = self.process(&message, cancel).instrument(span.clone()).await;

            let commit = match outcome {
                Ok(Outcome::Processed) => {
                    Counters::bump(&counters.processed);
                    true
                }
                Ok(Outcome::AlreadyCompleted) => {
                    Counters::bump(&counters.duplicates);
                    true
                }
                Ok(Outcome::Contended) => {
                    Counters::bump(&counters.contended);
                    false
                }
                Err(Error::Cancelled) => return Error::Cancelled,
                Err(err) => {
                    Counters::bump(&counters.failed);
                    record_consumer_outcome(&message.topic, "failed");
                    span.in_scope(|| {
                        tracing::error!(
                            topic = %message.topic,
                            error = %err,
                            error_kind = %err.kind(),
                            "PROCESS_FAILED"
                        );
                    });
                    false
                }
            };
            if !commit {
                continue;
            }

            match self.commit(&message, cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Error::Cancelled,
                Err(err) => {
                    Counters::bump(&counters.commit_failures);
                    span.in_scope(|| {
                        tracing::error!(
                            topic = %message.topic,
                            error = %err,
                            "COMMIT_FAILED"
                        );
                    });
                }
            }
        }
    }

    async fn process(&self, message: &Message, cancel: &CancellationToken) -> Result<Outcome> {
        let event_id = self.handler.event_key(message)?;
        tracing::Span::current().record("event_id", event_id.as_str());

        let decision = self
            .ledger
            .begin_or_join(&event_id, self.handler.event_type())
            .await?;
        match require_ownership(decision, &event_id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("event already completed");
                record_consumer_outcome(&message.topic, "duplicate");
                return Ok(Outcome::AlreadyCompleted);
            }
            Err(err) => {
                tracing::info!(reason = %err, "skipping event owned by another attempt");
                record_consumer_outcome(&message.topic, "contended");
                return Ok(Outcome::Contended);
            }
        }

        let handler = &*self.handler;
        self.policy
            .run("handle_event", cancel, move |_| handler.handle(message))
            .await?;
        self.ledger.mark_completed(&event_id).await?;
        record_consumer_outcome(&message.topic, "processed");
        tracing::info!(%decision, "event processed");
        Ok(Outcome::Processed)
    }

    async fn commit(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        let source = &*self.source;
        self.policy
            .run("commit_offset", cancel, move |_| source.commit(message))
            .await
    }
}

impl<M, L, H> ConsumerLoop<M, L, H>
where
    M: MessageSource + ?Sized + 'static,
    L: LedgerStore + 'static,
    H: EventHandler + ?Sized + 'static,
{
    /// Runs the loop as a background task until `cancel` fires.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<Result<Infallible>> {
        tokio::spawn(async move { self.run(&cancel).await })
    }
}
