//! # halyard-core
//!
//! Shared primitives for the Halyard services.
//!
//! - **Transaction Coordinator**: explicit unit-of-work transactions that
//!   collapse nested calls into the outermost transaction
//! - **Retry Policy**: exponential backoff with a pluggable retryability predicate
//! - **Error Types**: one error taxonomy with stable kinds
//! - **Lazy Connections**: outbound handles opened once on first use
//! - **Event Contracts**: payloads exchanged between services
//!
//! ## Crate Boundary
//!
//! `halyard-core` holds everything more than one service needs. Service
//! crates define their own stores on top of [`tx::TransactionSource`].
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use halyard_core::prelude::*;
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod events;
pub mod lazy;
pub mod metrics;
pub mod observability;
pub mod retry;
pub mod tx;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::retry::RetryPolicy;
    pub use crate::tx::memory::{MemoryDatabase, MemoryTx};
    pub use crate::tx::{TransactionSource, Transactor, UnitOfWork};
}

pub use config::{EnvReader, RetryConfig, Secret};
pub use error::{Error, ErrorKind, Result};
pub use events::{ACCOUNT_CREATED_TOPIC, AccountCreated, EventPublisher};
pub use lazy::{Connector, LazyConnection};
pub use observability::{LogFormat, init_logging};
pub use retry::RetryPolicy;
pub use tx::{TransactionSource, Transactor, UnitOfWork};
