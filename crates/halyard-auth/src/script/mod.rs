//! Atomic script execution against the key-value store.
//!
//! Multi-key operations that must be atomic run as server-side scripts. A
//! [`ScriptExecutor`] resolves the store's handle for a named script,
//! registering the script on first use and caching the handle in the store
//! itself (key `hs:<name>`, no expiry) so the mapping survives process
//! restarts. If the store has evicted its script cache and no longer
//! recognises the handle, the script is re-registered and invoked again.
//! Other transient failures are retried with exponential backoff.
//!
//! ## Handle lifecycle
//!
//! ```text
//! evaluate ──▶ GET hs:<name> ──miss──▶ LOAD ──▶ SET hs:<name>
//!                  │ hit                              │
//!                  ▼                                  ▼
//!              EVAL handle ◀──────────────────────────┘
//!                  │ unknown handle
//!                  ▼
//!              LOAD ──▶ SET hs:<name> ──▶ EVAL handle
//! ```

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use halyard_core::{Error, Result, RetryPolicy};

use crate::metrics::record_script_load;

/// Prefix of the keys caching script handles.
pub const HANDLE_KEY_PREFIX: &str = "hs";

/// A named server-side script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    /// Human-readable name; keys the handle cache.
    pub name: &'static str,
    /// Script source.
    pub body: &'static str,
}

impl Script {
    /// Returns the key under which this script's handle is cached.
    #[must_use]
    pub fn handle_key(&self) -> String {
        format!("{HANDLE_KEY_PREFIX}:{}", self.name)
    }
}

/// A value returned by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    /// No value.
    Nil,
    /// Integer reply.
    Int(i64),
    /// String reply.
    Text(String),
    /// Multi-value reply.
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    /// Returns the integer value, if this is an integer reply.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }
}

/// Failure of a single script invocation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The store does not recognise the handle (its script cache was flushed).
    #[error("script handle not recognised by the store")]
    UnknownHandle,
    /// Any other failure.
    #[error(transparent)]
    Store(#[from] Error),
}

/// A key-value store that can run registered scripts.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a string value with no expiry.
    async fn set_persistent(&self, key: &str, value: &str) -> Result<()>;

    /// Registers `body` and returns the store's handle for it.
    async fn load_script(&self, body: &str) -> Result<String>;

    /// Invokes a registered script atomically.
    async fn eval_handle(
        &self,
        handle: &str,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<ScriptValue, EvalError>;
}

/// Executes named scripts with handle caching, reload on eviction, and retries.
pub struct ScriptExecutor<S: ?Sized> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: ?Sized> Clone for ScriptExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
        }
    }
}

impl<S: ScriptStore + ?Sized> ScriptExecutor<S> {
    /// Creates an executor over `store`.
    #[must_use]
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Runs `script` atomically against `keys` and `args`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires, the first
    /// non-retryable error unchanged, or [`Error::Cache`] once all attempts
    /// have failed.
    #[tracing::instrument(skip(self, keys, args, cancel), fields(script = script.name))]
    pub async fn evaluate(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScriptValue> {
        let mut handle: Option<String> = None;
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(Error::Cancelled),
                outcome = self.attempt(script, &mut handle, keys, args) => outcome,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                return Err(err);
            }
            if attempt + 1 >= self.policy.max_attempts() {
                tracing::warn!(attempts = attempt + 1, error = %err, "script execution failed");
                halyard_core::metrics::record_retry_exhausted("script_evaluate");
                return Err(Error::cache_with_source(
                    format!("script {} failed after {} attempts", script.name, attempt + 1),
                    err,
                ));
            }

            tracing::debug!(attempt, error = %err, "retrying script execution");
            halyard_core::metrics::record_retry("script_evaluate");
            self.policy.wait(attempt, cancel).await?;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        script: &Script,
        handle: &mut Option<String>,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue> {
        let current = match handle.as_ref() {
            Some(h) => h.clone(),
            None => {
                let resolved = self.resolve_handle(script).await?;
                *handle = Some(resolved.clone());
                resolved
            }
        };

        match self.store.eval_handle(&current, keys, args).await {
            Ok(value) => Ok(value),
            Err(EvalError::Store(err)) => Err(err),
            Err(EvalError::UnknownHandle) => {
                tracing::info!("script handle evicted; registering again");
                let reloaded = self.register(script, "evicted").await?;
                *handle = Some(reloaded.clone());
                match self.store.eval_handle(&reloaded, keys, args).await {
                    Ok(value) => Ok(value),
                    Err(EvalError::Store(err)) => Err(err),
                    Err(EvalError::UnknownHandle) => {
                        *handle = None;
                        Err(Error::cache(format!(
                            "script {} handle rejected right after registration",
                            script.name
                        )))
                    }
                }
            }
        }
    }

    async fn resolve_handle(&self, script: &Script) -> Result<String> {
        if let Some(handle) = self.store.get(&script.handle_key()).await? {
            return Ok(handle);
        }
        self.register(script, "cold").await
    }

    async fn register(&self, script: &Script, cause: &'static str) -> Result<String> {
        let handle = self.store.load_script(script.body).await?;
        self.store
            .set_persistent(&script.handle_key(), &handle)
            .await?;
        record_script_load(script.name, cause);
        Ok(handle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::memory::{KeyValues, MemoryScriptStore};
    use super::*;
    use std::time::Duration;

    const INCR: Script = Script {
        name: "incr",
        body: "return redis.call('INCR', KEYS[1])",
    };

    fn incr(kv: &mut KeyValues<'_>, keys: &[String], _args: &[String]) -> Result<ScriptValue> {
        let key = keys
            .first()
            .ok_or_else(|| Error::cache("missing key"))?;
        let next = kv
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        kv.set(key, &next.to_string(), None);
        Ok(ScriptValue::Int(next))
    }

    fn executor(store: &Arc<MemoryScriptStore>, attempts: u32) -> ScriptExecutor<MemoryScriptStore> {
        ScriptExecutor::new(
            Arc::clone(store),
            RetryPolicy::new(attempts, Duration::from_millis(10)),
        )
    }

    fn keys() -> Vec<String> {
        vec!["counter".to_string()]
    }

    #[tokio::test]
    async fn first_use_registers_and_caches_handle() {
        let store = Arc::new(MemoryScriptStore::new());
        store.register_native(INCR.body, incr);
        let executor = executor(&store, 3);
        let cancel = CancellationToken::new();

        let first = executor.evaluate(&INCR, &keys(), &[], &cancel).await.unwrap();
        let second = executor.evaluate(&INCR, &keys(), &[], &cancel).await.unwrap();

        assert_eq!(first, ScriptValue::Int(1));
        assert_eq!(second, ScriptValue::Int(2));
        assert_eq!(store.load_count(), 1);
        assert!(store.get("hs:incr").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cached_handle_survives_a_new_executor() {
        let store = Arc::new(MemoryScriptStore::new());
        store.register_native(INCR.body, incr);
        let cancel = CancellationToken::new();

        executor(&store, 3).evaluate(&INCR, &keys(), &[], &cancel).await.unwrap();
        executor(&store, 3).evaluate(&INCR, &keys(), &[], &cancel).await.unwrap();

        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn evicted_script_is_registered_again() {
        let store = Arc::new(MemoryScriptStore::new());
        store.register_native(INCR.body, incr);
        let executor = executor(&store, 1);
        let cancel = CancellationToken::new();

        executor.evaluate(&INCR, &keys(), &[], &cancel).await.unwrap();
        store.flush_scripts();
        let value = executor.evaluate(&INCR, &keys(), &[], &cancel).await.unwrap();

        assert_eq!(value, ScriptValue::Int(2));
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = Arc::new(MemoryScriptStore::new());
        store.register_native(INCR.body, incr);
        store.fail_next_evals(2);
        let executor = executor(&store, 3);

        let value = executor
            .evaluate(&INCR, &keys(), &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(value, ScriptValue::Int(1));
        assert_eq!(store.eval_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_a_cache_error() {
        let store = Arc::new(MemoryScriptStore::new());
        store.register_native(INCR.body, incr);
        store.fail_next_evals(10);
        let executor = executor(&store, 3);

        let err = executor
            .evaluate(&INCR, &keys(), &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cache { .. }));
        assert_eq!(store.eval_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying_immediately() {
        let store = Arc::new(MemoryScriptStore::new());
        store.register_native(INCR.body, incr);
        store.fail_next_evals(10);
        let executor = ScriptExecutor::new(
            Arc::clone(&store),
            RetryPolicy::new(10, Duration::from_secs(3600)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = executor
            .evaluate(&INCR, &keys(), &[], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(store.eval_count(), 1);
    }
}
