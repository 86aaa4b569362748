//! In-memory transaction source for testing.
//!
//! [`MemoryDatabase`] holds a single state value behind an async mutex. A
//! transaction takes the mutex for its whole lifetime and works on a staged
//! copy, so concurrent transactions are fully serialized. Commit publishes
//! the staged copy; rollback (or dropping the handle) discards it.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Serializable only**: Transactions never interleave, so lock contention
//!   behaviour of a real database is not reproduced

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::TransactionSource;
use crate::error::{Error, Result};

/// Counters describing how transactions finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    /// Transactions opened.
    pub begins: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back.
    pub rollbacks: u64,
}

/// In-memory database holding one state value.
#[derive(Debug, Default)]
pub struct MemoryDatabase<S> {
    state: Arc<Mutex<S>>,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
}

/// A live in-memory transaction.
#[derive(Debug)]
pub struct MemoryTx<S> {
    guard: OwnedMutexGuard<S>,
    staged: S,
}

impl<S> MemoryTx<S> {
    /// Returns the staged state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.staged
    }

    /// Returns the staged state for mutation.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.staged
    }
}

impl<S: Clone> MemoryDatabase<S> {
    /// Creates a database seeded with `state`.
    #[must_use]
    pub fn new(state: S) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            begins: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            fail_begin: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
        }
    }

    /// Returns a copy of the committed state.
    ///
    /// Waits for any open transaction to finish.
    pub async fn snapshot(&self) -> S {
        self.state.lock().await.clone()
    }

    /// Returns transaction counters.
    #[must_use]
    pub fn stats(&self) -> TxStats {
        TxStats {
            begins: self.begins.load(Ordering::SeqCst),
            commits: self.commits.load(Ordering::SeqCst),
            rollbacks: self.rollbacks.load(Ordering::SeqCst),
        }
    }

    /// Makes the next `begin` fail.
    pub fn fail_next_begin(&self) {
        self.fail_begin.store(true, Ordering::SeqCst);
    }

    /// Makes the next `commit` fail; the staged state is discarded.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S> TransactionSource for MemoryDatabase<S>
where
    S: Clone + Send + Sync + 'static,
{
    type Tx = MemoryTx<S>;

    async fn begin(&self) -> Result<MemoryTx<S>> {
        if self.fail_begin.swap(false, Ordering::SeqCst) {
            return Err(Error::transaction("injected begin failure"));
        }
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTx { guard, staged })
    }

    async fn commit(&self, tx: MemoryTx<S>) -> Result<()> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::transaction("injected commit failure"));
        }
        let MemoryTx { mut guard, staged } = tx;
        *guard = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx<S>) -> Result<()> {
        drop(tx);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dropped_transaction_discards_staged_state() {
        let db = MemoryDatabase::new(0_u32);
        {
            let mut tx = db.begin().await.unwrap();
            *tx.state_mut() = 42;
        }
        assert_eq!(db.snapshot().await, 0);
    }

    #[tokio::test]
    async fn transactions_are_serialized() {
        let db = Arc::new(MemoryDatabase::new(0_u32));
        let mut first = db.begin().await.unwrap();

        let waiter = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                let tx = db.begin().await.unwrap();
                let seen = *tx.state();
                db.commit(tx).await.unwrap();
                seen
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        *first.state_mut() = 7;
        db.commit(first).await.unwrap();

        assert_eq!(waiter.await.unwrap(), 7);
    }
}
