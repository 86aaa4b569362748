//! Error types and result aliases for Halyard.
//!
//! Every failure carries a stable [`ErrorKind`] so that callers outside the
//! core (transport adapters, the CLI, metrics) can classify it without
//! matching on messages. Store-level errors keep their underlying cause as
//! a boxed source.

use std::fmt;

/// The result type used throughout Halyard.
pub type Result<T> = std::result::Result<T, Error>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in Halyard operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening, committing or rolling back a database transaction failed.
    #[error("transaction error: {message}")]
    Transaction {
        /// Description of the transaction failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A relational query or statement failed.
    #[error("database error: {message}")]
    Database {
        /// Description of the database failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A key-value store operation failed.
    #[error("cache error: {message}")]
    Cache {
        /// Description of the cache failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxedSource>,
    },

    /// Signing an access credential failed.
    #[error("credential error: {message}")]
    Credential {
        /// Description of the signing failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxedSource>,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A uniqueness constraint was violated.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// Another consumer currently owns the processing of an event.
    #[error("event {event_id} is being processed by another consumer")]
    OwnershipContention {
        /// The contended event identifier.
        event_id: String,
    },

    /// A payload could not be decoded or is structurally invalid.
    #[error("malformed input: {message}")]
    MalformedInput {
        /// Description of what was malformed.
        message: String,
    },

    /// Invalid input was provided (configuration or arguments).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A message broker operation failed.
    #[error("broker error: {message}")]
    Broker {
        /// Description of the broker failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A downstream side-effect channel (e.g. outbound mail) failed.
    #[error("delivery error: {message}")]
    Delivery {
        /// Description of the delivery failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<BoxedSource>,
    },

    /// The operation was cancelled or its deadline expired.
    #[error("operation cancelled")]
    Cancelled,

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

/// Stable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Transaction`].
    Transaction,
    /// See [`Error::Database`].
    Database,
    /// See [`Error::Cache`].
    Cache,
    /// See [`Error::Credential`].
    Credential,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::Conflict`].
    Conflict,
    /// See [`Error::OwnershipContention`].
    OwnershipContention,
    /// See [`Error::MalformedInput`].
    MalformedInput,
    /// See [`Error::InvalidInput`].
    InvalidInput,
    /// See [`Error::Broker`].
    Broker,
    /// See [`Error::Delivery`].
    Delivery,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::Internal`].
    Internal,
}

impl ErrorKind {
    /// Returns the kind as a stable snake-case code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Credential => "credential",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::OwnershipContention => "ownership_contention",
            Self::MalformedInput => "malformed_input",
            Self::InvalidInput => "invalid_input",
            Self::Broker => "broker",
            Self::Delivery => "delivery",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Creates a transaction error.
    #[must_use]
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transaction error with a source cause.
    #[must_use]
    pub fn transaction_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a database error.
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a database error with a source cause.
    #[must_use]
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a cache error.
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a cache error with a source cause.
    #[must_use]
    pub fn cache_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a credential error with a source cause.
    #[must_use]
    pub fn credential_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Credential {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a malformed input error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

    /// Creates a broker error.
    #[must_use]
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a broker error with a source cause.
    #[must_use]
    pub fn broker_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Broker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a delivery error.
    #[must_use]
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a delivery error with a source cause.
    #[must_use]
    pub fn delivery_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Delivery {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the stable kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transaction { .. } => ErrorKind::Transaction,
            Self::Database { .. } => ErrorKind::Database,
            Self::Cache { .. } => ErrorKind::Cache,
            Self::Credential { .. } => ErrorKind::Credential,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::OwnershipContention { .. } => ErrorKind::OwnershipContention,
            Self::MalformedInput { .. } => ErrorKind::MalformedInput,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Broker { .. } => ErrorKind::Broker,
            Self::Delivery { .. } => ErrorKind::Delivery,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true when retrying the failed operation may succeed.
    ///
    /// Transient store, broker and delivery failures are retryable.
    /// Cancellation and anything caused by the input itself are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transaction
                | ErrorKind::Database
                | ErrorKind::Cache
                | ErrorKind::Broker
                | ErrorKind::Delivery
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_retryable() {
        assert!(Error::database("boom").is_retryable());
        assert!(Error::cache("boom").is_retryable());
        assert!(Error::transaction("boom").is_retryable());
        assert!(Error::broker("boom").is_retryable());
        assert!(Error::delivery("boom").is_retryable());
    }

    #[test]
    fn input_and_cancellation_are_not_retryable() {
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::malformed("bad payload").is_retryable());
        assert!(!Error::not_found("session", "abc").is_retryable());
        assert!(!Error::conflict("dup").is_retryable());
        assert!(
            !Error::OwnershipContention {
                event_id: "e1".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn source_is_preserved() {
        let io = std::io::Error::other("socket closed");
        let err = Error::cache_with_source("EVALSHA failed", io);
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("socket closed"));
        assert_eq!(err.kind(), ErrorKind::Cache);
        assert_eq!(err.to_string(), "cache error: EVALSHA failed");
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::OwnershipContention.as_str(), "ownership_contention");
        assert_eq!(Error::not_found("session", "t").kind().to_string(), "not_found");
    }
}
