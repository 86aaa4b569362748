//! Message broker boundary.
//!
//! The broker delivers each message at least once. A consumer fetches one
//! message at a time and commits it only after handling it; an uncommitted
//! message is delivered again later, possibly to another consumer.

pub mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use halyard_core::Result;

/// A fetched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Broker-assigned offset within the partition.
    pub offset: i64,
    /// Producer-supplied key.
    pub key: String,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

/// A subscription that yields messages for one consumer.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Topic this source reads.
    fn topic(&self) -> &str;

    /// Waits for the next message.
    ///
    /// Returns [`halyard_core::Error::Cancelled`] once `cancel` fires.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Message>;

    /// Acknowledges `message` so it is not delivered again.
    async fn commit(&self, message: &Message) -> Result<()>;
}
