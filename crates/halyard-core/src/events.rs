//! Event contracts shared by producers and consumers.
//!
//! The account service publishes these events; the notification service
//! consumes them. Payloads are JSON. Each event carries a producer-generated
//! `event_id` that consumers use as their idempotency key; it is distinct
//! from any offset the broker assigns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Topic carrying [`AccountCreated`] events.
pub const ACCOUNT_CREATED_TOPIC: &str = "auth.created";

/// Published once an account has been created and its verification token issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreated {
    /// Producer-generated unique event identifier.
    pub event_id: String,
    /// Normalized account email.
    pub email: String,
    /// One-time verification token.
    pub token: String,
    /// When the event was produced.
    pub created_at: DateTime<Utc>,
}

impl AccountCreated {
    /// Encodes the event payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::internal(format!("failed to encode account event: {e}")))
    }

    /// Decodes an event payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the payload is not a valid event.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(payload)
            .map_err(|e| Error::malformed(format!("invalid account event: {e}")))?;
        if event.event_id.trim().is_empty() {
            return Err(Error::malformed("account event has an empty event id"));
        }
        Ok(event)
    }
}

/// Publishes encoded events to a topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `payload` under `key` to `topic`.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;
}
