//! # halyard-notify
//!
//! Notification side of the Halyard services: turns the broker's
//! at-least-once feed of account events into effectively-once welcome mail.
//!
//! - **Event Ledger**: durable first-seen/completed record per event id
//! - **Broker**: message source boundary and an in-memory broker
//! - **Consumer Loop**: fetch, check ledger, handle with retries, commit
//! - **Welcome**: the account-created handler and its mailer
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use halyard_core::RetryPolicy;
//! use halyard_notify::broker::memory::MemoryBroker;
//! use halyard_notify::consumer::ConsumerLoop;
//! use halyard_notify::ledger::EventLedger;
//! use halyard_notify::ledger::memory::MemoryLedgerStore;
//! use halyard_notify::welcome::{MemoryMailer, WelcomeHandler};
//!
//! let broker = Arc::new(MemoryBroker::new(Duration::from_secs(30)));
//! let ledger = Arc::new(EventLedger::new(
//!     Arc::new(MemoryLedgerStore::default()),
//!     Duration::from_secs(60),
//! ));
//! let consumer = ConsumerLoop::new(
//!     "welcome",
//!     Arc::new(broker.subscribe("notify", "auth.created")),
//!     ledger,
//!     Arc::new(WelcomeHandler::new(Arc::new(MemoryMailer::new()))),
//!     RetryPolicy::default(),
//! );
//! # drop(consumer);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod config;
pub mod consumer;
pub mod ledger;
pub mod metrics;
pub mod welcome;

pub use broker::{Message, MessageSource};
pub use config::NotifyConfig;
pub use consumer::{ConsumerLoop, ConsumerStats, EventHandler};
pub use ledger::{EventLedger, LedgerDecision, LedgerEntry, LedgerStore};
pub use welcome::{Mailer, MemoryMailer, WelcomeHandler};
