//! Event publisher that records what it is given.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use halyard_core::{Error, EventPublisher, Result};

/// One recorded publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Destination topic.
    pub topic: String,
    /// Message key.
    pub key: String,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

/// [`EventPublisher`] that records publishes, or refuses them on demand.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    /// Creates a publisher that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent publishes fail with a broker error.
    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns everything published so far.
    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().expect("lock").clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::broker("publisher unavailable"));
        }
        self.published.lock().expect("lock").push(Published {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        });
        Ok(())
    }
}
