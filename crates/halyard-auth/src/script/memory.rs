//! In-memory script store for tests and single-process deployments.
//!
//! Scripts cannot be interpreted here; each script body is paired with a
//! native function that performs the same key operations. Handles are the
//! SHA-256 hex digest of the body.
//!
//! ## Limitations
//!
//! - Only bodies registered with [`MemoryScriptStore::register_native`] load
//! - Expiry follows `tokio::time`, so paused-clock tests can advance it

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use halyard_core::{Error, Result};

use super::{EvalError, ScriptStore, ScriptValue};

/// Native stand-in for a script body.
pub type NativeScript = fn(&mut KeyValues<'_>, &[String], &[String]) -> Result<ScriptValue>;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    natives: HashMap<String, NativeScript>,
    loaded: HashSet<String>,
}

/// Key-value view handed to native scripts while the store is locked.
pub struct KeyValues<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: Instant,
}

impl KeyValues<'_> {
    /// Reads a live value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at.is_none_or(|at| at > self.now))
            .map(|entry| entry.value.clone())
    }

    /// Writes a value, optionally expiring after `ttl`.
    pub fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| self.now + ttl),
            },
        );
    }

    /// Deletes a value, returning whether a live one existed.
    pub fn del(&mut self, key: &str) -> bool {
        let live = self.get(key).is_some();
        self.entries.remove(key);
        live
    }
}

/// Returns the handle the in-memory store assigns to `body`.
#[must_use]
pub fn script_handle(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::cache("script store lock poisoned")
}

/// Process-local [`ScriptStore`].
#[derive(Debug, Default)]
pub struct MemoryScriptStore {
    state: Mutex<State>,
    fail_evals: AtomicU32,
    loads: AtomicU64,
    evals: AtomicU64,
}

impl MemoryScriptStore {
    /// Creates an empty store with no native scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs a script body with its native implementation.
    pub fn register_native(&self, body: &str, native: NativeScript) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.natives.insert(script_handle(body), native);
    }

    /// Forgets every loaded script, as a server-side cache flush would.
    ///
    /// Cached handle keys are left in place.
    pub fn flush_scripts(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.loaded.clear();
    }

    /// Makes the next `count` invocations fail with a cache error.
    pub fn fail_next_evals(&self, count: u32) {
        self.fail_evals.store(count, Ordering::SeqCst);
    }

    /// Returns how many scripts have been loaded.
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Returns how many invocations have been attempted.
    #[must_use]
    pub fn eval_count(&self) -> u64 {
        self.evals.load(Ordering::SeqCst)
    }

    /// Returns the remaining time-to-live of `key`, if it is live and expiring.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        state
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_evals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let view = KeyValues {
            entries: &mut state.entries,
            now: Instant::now(),
        };
        Ok(view.get(key))
    }

    async fn set_persistent(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut view = KeyValues {
            entries: &mut state.entries,
            now: Instant::now(),
        };
        view.set(key, value, None);
        Ok(())
    }

    async fn load_script(&self, body: &str) -> Result<String> {
        let handle = script_handle(body);
        let mut state = self.state.lock().map_err(poison_err)?;
        if !state.natives.contains_key(&handle) {
            return Err(Error::cache(
                "script has no native implementation in the in-memory store",
            ));
        }
        state.loaded.insert(handle.clone());
        drop(state);
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn eval_handle(
        &self,
        handle: &str,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<ScriptValue, EvalError> {
        self.evals.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure() {
            return Err(Error::cache("injected script failure").into());
        }

        let mut state = self.state.lock().map_err(poison_err)?;
        if !state.loaded.contains(handle) {
            return Err(EvalError::UnknownHandle);
        }
        let native = *state
            .natives
            .get(handle)
            .ok_or(EvalError::UnknownHandle)?;
        let mut view = KeyValues {
            entries: &mut state.entries,
            now: Instant::now(),
        };
        Ok(native(&mut view, keys, args)?)
    }
}
