//! In-memory broker for tests and local runs.
//!
//! Topics are split into a fixed number of partitions; a message's partition
//! is derived from its key. Each consumer group tracks which offsets it has
//! committed and which are leased to a consumer. A leased message that is
//! not committed within `redeliver_after` becomes fetchable again, which
//! reproduces the broker's at-least-once redelivery.
//!
//! ## Limitations
//!
//! - **Single process**: nothing is persisted
//! - **No retention**: committed messages stay in memory

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use halyard_core::{Error, EventPublisher, Result};

use super::{Message, MessageSource};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 3;

#[derive(Debug, Clone)]
struct Record {
    key: String,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct GroupCursor {
    committed: BTreeSet<(u32, i64)>,
    leases: HashMap<(u32, i64), Instant>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Record>>>,
    groups: HashMap<(String, String), GroupCursor>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::broker("broker state lock poisoned")
}

fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let bucket = hasher.finish() % u64::from(partitions.max(1));
    u32::try_from(bucket).unwrap_or(0)
}

/// Process-local broker.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<State>,
    published: Notify,
    partitions: u32,
    redeliver_after: Duration,
    fail_fetches: AtomicU32,
    fail_commits: AtomicU32,
}

impl MemoryBroker {
    /// Creates a broker whose unacknowledged messages are redelivered after `redeliver_after`.
    #[must_use]
    pub fn new(redeliver_after: Duration) -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS, redeliver_after)
    }

    /// Creates a broker with `partitions` partitions per topic.
    #[must_use]
    pub fn with_partitions(partitions: u32, redeliver_after: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            published: Notify::new(),
            partitions: partitions.max(1),
            redeliver_after,
            fail_fetches: AtomicU32::new(0),
            fail_commits: AtomicU32::new(0),
        }
    }

    /// Subscribes a consumer of `group` to `topic`.
    ///
    /// Subscriptions of one group share committed offsets and leases.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, group: &str, topic: &str) -> Subscription {
        Subscription {
            broker: Arc::clone(self),
            group: group.to_string(),
            topic: topic.to_string(),
        }
    }

    /// Makes the next `count` fetches fail with a broker error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.fail_fetches.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` commits fail with a broker error.
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Returns how many messages of `topic` are not yet committed by `group`.
    #[must_use]
    pub fn pending(&self, group: &str, topic: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let total: usize = state
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum());
        let committed = state
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map_or(0, |cursor| cursor.committed.len());
        total.saturating_sub(committed)
    }

    fn append(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(u32, i64)> {
        let partition = partition_for(key, self.partitions);
        let mut state = self.state.lock().map_err(poison_err)?;
        let partitions = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        let log = &mut partitions[partition as usize];
        let offset = i64::try_from(log.len())
            .map_err(|_| Error::broker("partition offset overflow"))?;
        log.push(Record {
            key: key.to_string(),
            payload,
        });
        drop(state);
        self.published.notify_waiters();
        Ok((partition, offset))
    }

    /// Leases the next deliverable message, or returns when the earliest lease expires.
    fn try_lease(&self, group: &str, topic: &str) -> Result<Lease> {
        let now = Instant::now();
        let mut state = self.state.lock().map_err(poison_err)?;
        let State { topics, groups } = &mut *state;
        let Some(partitions) = topics.get(topic) else {
            return Ok(Lease::Idle(None));
        };
        let cursor = groups
            .entry((group.to_string(), topic.to_string()))
            .or_default();

        let mut next_expiry: Option<Instant> = None;
        for (partition, log) in (0_u32..).zip(partitions.iter()) {
            for (offset, record) in (0_i64..).zip(log.iter()) {
                let position = (partition, offset);
                if cursor.committed.contains(&position) {
                    continue;
                }
                if let Some(expires) = cursor.leases.get(&position) {
                    if *expires > now {
                        next_expiry = Some(next_expiry.map_or(*expires, |e| e.min(*expires)));
                        continue;
                    }
                }
                cursor.leases.insert(position, now + self.redeliver_after);
                return Ok(Lease::Message(Message {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                }));
            }
        }
        Ok(Lease::Idle(next_expiry))
    }

    async fn fetch(&self, group: &str, topic: &str, cancel: &CancellationToken) -> Result<Message> {
        if take_one(&self.fail_fetches) {
            return Err(Error::broker("injected fetch failure"));
        }
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let published = self.published.notified();
            let wake_at = match self.try_lease(group, topic)? {
                Lease::Message(message) => return Ok(message),
                Lease::Idle(wake_at) => wake_at,
            };
            let lease_expiry = async {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = published => {}
                () = lease_expiry => {}
            }
        }
    }

    fn commit(&self, group: &str, message: &Message) -> Result<()> {
        if take_one(&self.fail_commits) {
            return Err(Error::broker("injected commit failure"));
        }
        let mut state = self.state.lock().map_err(poison_err)?;
        let cursor = state
            .groups
            .entry((group.to_string(), message.topic.clone()))
            .or_default();
        let position = (message.partition, message.offset);
        cursor.leases.remove(&position);
        cursor.committed.insert(position);
        Ok(())
    }
}

enum Lease {
    Message(Message),
    Idle(Option<Instant>),
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl EventPublisher for MemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let (partition, offset) = self.append(topic, key, payload)?;
        tracing::debug!(topic, partition, offset, key, "message published");
        Ok(())
    }
}

/// One consumer's view of a topic.
#[derive(Debug, Clone)]
pub struct Subscription {
    broker: Arc<MemoryBroker>,
    group: String,
    topic: String,
}

#[async_trait]
impl MessageSource for Subscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Message> {
        self.broker.fetch(&self.group, &self.topic, cancel).await
    }

    async fn commit(&self, message: &Message) -> Result<()> {
        self.broker.commit(&self.group, message)
    }
}
