//! Backoff and retry policy.
//!
//! A [`RetryPolicy`] decides whether a failure is worth another attempt and
//! how long to wait before making it. Waits grow exponentially with the
//! attempt number (`base_delay * 2^attempt`) up to `max_delay`, and every
//! wait races a [`CancellationToken`] so that shutdown or an expired
//! deadline aborts immediately instead of sleeping out the full delay.
//!
//! # Example
//!
//! ```rust,ignore
//! let policy = RetryPolicy::new(3, Duration::from_millis(100));
//! let value = policy
//!     .run("load_profile", &cancel, |_attempt| async { fetch().await })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::metrics::{record_retry, record_retry_exhausted};

/// Default number of attempts (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for the first backoff wait.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default upper bound on a single backoff wait.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

type Predicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry policy parameterized by attempts, base delay and a retryability predicate.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    predicate: Predicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    /// Creates a policy using [`Error::is_retryable`] as its predicate.
    ///
    /// `max_attempts` is clamped to at least one.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: DEFAULT_MAX_DELAY.max(base_delay),
            predicate: Arc::new(Error::is_retryable),
        }
    }

    /// Creates a policy from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay()).with_max_delay(config.max_delay())
    }

    /// Caps every backoff wait at `max_delay`.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Replaces the retryability predicate.
    ///
    /// Cancellation is never retried regardless of the predicate.
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Returns the maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns whether `err` should be retried under this policy.
    #[must_use]
    pub fn is_retryable(&self, err: &Error) -> bool {
        !matches!(err, Error::Cancelled) && (self.predicate)(err)
    }

    /// Returns the wait before the attempt following `attempt`.
    ///
    /// Non-decreasing in `attempt`; saturates instead of overflowing.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Sleeps for the backoff delay of `attempt` unless `cancel` fires first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] as soon as the token is cancelled.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        let delay = self.delay_for_attempt(attempt);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// exhausts the configured attempts.
    ///
    /// `op` receives the zero-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, the last error once attempts
    /// are exhausted, or [`Error::Cancelled`] if `cancel` fires during an
    /// attempt or a backoff wait.
    pub async fn run<F, Fut, T>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                return Err(err);
            }
            if attempt + 1 >= self.max_attempts {
                tracing::warn!(
                    operation,
                    attempts = self.max_attempts,
                    error = %err,
                    "retry attempts exhausted"
                );
                record_retry_exhausted(operation);
                return Err(err);
            }

            tracing::debug!(
                operation,
                attempt,
                backoff_ms = u64::try_from(self.delay_for_attempt(attempt).as_millis())
                    .unwrap_or(u64::MAX),
                error = %err,
                "retrying after backoff"
            );
            record_retry(operation);
            self.wait(attempt, cancel).await?;
            attempt += 1;
        }
    }
}
