//! Lazily established, shared connection handles.
//!
//! Outbound connections (mail relay, cache) are opened on first use rather
//! than at startup. A [`LazyConnection`] guards the handle with an async
//! mutex so that concurrent first-use calls connect exactly once, and lets
//! callers drop a broken handle so the next use reconnects.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

/// Opens new connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The connection handle.
    type Connection: Send + Sync;

    /// Opens a connection.
    async fn connect(&self) -> Result<Self::Connection>;
}

/// A connection opened on first use and shared afterwards.
pub struct LazyConnection<C: Connector> {
    connector: C,
    slot: Mutex<Option<Arc<C::Connection>>>,
    connects: AtomicU64,
}

impl<C: Connector> fmt::Debug for LazyConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyConnection")
            .field("connects", &self.connects.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<C: Connector> LazyConnection<C> {
    /// Creates an unconnected handle.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            slot: Mutex::new(None),
            connects: AtomicU64::new(0),
        }
    }

    /// Returns the shared connection, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns the connector's error; the slot stays empty so the next call retries.
    pub async fn get(&self) -> Result<Arc<C::Connection>> {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }
        let conn = Arc::new(self.connector.connect().await?);
        self.connects.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("established outbound connection");
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Drops the current connection so the next [`LazyConnection::get`] reconnects.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// Returns how many connections have been opened.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct SlowConnector {
        attempts: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        type Connection = u32;

        async fn connect(&self) -> Result<u32> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail_first && n == 0 {
                return Err(Error::delivery("relay refused connection"));
            }
            Ok(n)
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let lazy = Arc::new(LazyConnection::new(SlowConnector {
            attempts: AtomicU32::new(0),
            fail_first: false,
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lazy = Arc::clone(&lazy);
            handles.push(tokio::spawn(async move { *lazy.get().await.unwrap() }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0);
        }
        assert_eq!(lazy.connect_count(), 1);
    }

    #[tokio::test]
    async fn failed_connect_is_retried_on_next_use() {
        let lazy = LazyConnection::new(SlowConnector {
            attempts: AtomicU32::new(0),
            fail_first: true,
        });

        assert!(lazy.get().await.is_err());
        assert_eq!(*lazy.get().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reconnect() {
        let lazy = LazyConnection::new(SlowConnector {
            attempts: AtomicU32::new(0),
            fail_first: false,
        });

        assert_eq!(*lazy.get().await.unwrap(), 0);
        lazy.invalidate().await;
        assert_eq!(*lazy.get().await.unwrap(), 1);
        assert_eq!(lazy.connect_count(), 2);
    }
}
