//! Transaction coordination.
//!
//! A [`Transactor`] wraps a [`UnitOfWork`] in a database transaction. The
//! active transaction is passed explicitly: callers that already hold one
//! pass `Some(tx)` and the work runs against it unchanged, while callers
//! without one pass `None` and the transactor opens, commits or rolls back
//! a fresh transaction around the work.
//!
//! # Guarantees
//!
//! - Exactly one commit or rollback per outermost call, at any nesting depth
//! - Nested calls never commit or roll back the transaction they were given
//! - Failure to begin or commit is reported as [`Error::Transaction`]
//! - Failures returned by the work are passed through unchanged after rollback
//!
//! # Example
//!
//! ```rust,ignore
//! struct Rename<'a> { id: i64, name: &'a str }
//!
//! #[async_trait]
//! impl UnitOfWork<PgTx> for Rename<'_> {
//!     type Output = ();
//!     async fn run(self, tx: &mut PgTx) -> Result<()> { /* statements */ Ok(()) }
//! }
//!
//! transactor.run(None, Rename { id: 7, name: "x" }).await?;
//! ```

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics::record_tx_outcome;

/// A store that can open and finish transactions.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// The live transaction handle.
    type Tx: Send;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Commits `tx`.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    /// Rolls back `tx`.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;
}

/// One logical operation that must commit or roll back as a whole.
#[async_trait]
pub trait UnitOfWork<Tx: Send>: Send {
    /// Value produced on success.
    type Output: Send;

    /// Runs the work against the active transaction.
    async fn run(self, tx: &mut Tx) -> Result<Self::Output>;
}

/// Runs units of work inside transactions opened from a [`TransactionSource`].
pub struct Transactor<S: ?Sized> {
    source: Arc<S>,
}

impl<S: ?Sized> Clone for Transactor<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<S: TransactionSource + ?Sized> Transactor<S> {
    /// Creates a transactor over `source`.
    #[must_use]
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }

    /// Runs `work` in the active transaction, or in a new one when `active` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if a new transaction cannot be opened
    /// or committed, and the work's own error otherwise.
    pub async fn run<W>(&self, active: Option<&mut S::Tx>, work: W) -> Result<W::Output>
    where
        W: UnitOfWork<S::Tx>,
    {
        if let Some(tx) = active {
            return work.run(tx).await;
        }

        let mut tx = self.begin().await?;
        let outcome = work.run(&mut tx).await;
        self.finish(tx, outcome).await
    }

    /// Like [`Transactor::run`], but stops the work when `cancel` fires.
    ///
    /// A cancelled outermost call rolls its transaction back before
    /// returning [`Error::Cancelled`].
    ///
    /// # Errors
    ///
    /// Same as [`Transactor::run`], plus [`Error::Cancelled`].
    pub async fn run_cancellable<W>(
        &self,
        active: Option<&mut S::Tx>,
        work: W,
        cancel: &CancellationToken,
    ) -> Result<W::Output>
    where
        W: UnitOfWork<S::Tx>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(tx) = active {
            return tokio::select! {
                biased;
                () = cancel.cancelled() => Err(Error::Cancelled),
                outcome = work.run(tx) => outcome,
            };
        }

        let mut tx = self.begin().await?;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            outcome = work.run(&mut tx) => outcome,
        };
        self.finish(tx, outcome).await
    }

    async fn begin(&self) -> Result<S::Tx> {
        self.source.begin().await.map_err(|err| {
            record_tx_outcome("begin_failed");
            wrap_tx_error("failed to begin database transaction", err)
        })
    }

    async fn finish<T>(&self, tx: S::Tx, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.source.commit(tx).await.map_err(|err| {
                    record_tx_outcome("commit_failed");
                    wrap_tx_error("failed to commit database transaction", err)
                })?;
                record_tx_outcome("committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.source.rollback(tx).await {
                    tracing::warn!(
                        error = %rollback_err,
                        cause = %err,
                        "failed to roll back database transaction"
                    );
                }
                record_tx_outcome("rolled_back");
                Err(err)
            }
        }
    }
}

fn wrap_tx_error(message: &str, err: Error) -> Error {
    match err {
        Error::Transaction { .. } => err,
        other => Error::transaction_with_source(message, other),
    }
}
