//! One-time verification tokens.
//!
//! A token is stored under two keys sharing one expiry: identity → token and
//! token → identity. Issuing a new token runs a single script that deletes
//! the identity's previous pair before writing the new one, so at most one
//! token per identity is ever live, even under concurrent issuance.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use halyard_core::{Error, Result};

use crate::identity::AccountId;
use crate::metrics::record_verification_token;
use crate::script::memory::{KeyValues, MemoryScriptStore};
use crate::script::{Script, ScriptExecutor, ScriptStore, ScriptValue};

/// Key prefix shared by both directions of the mapping.
pub const VERIFICATION_PREFIX: &str = "verification";

/// Replaces an identity's verification token.
///
/// `KEYS`: identity key, token key, prefix. `ARGV`: token, identity, TTL seconds.
pub const ROTATE_VERIFICATION: Script = Script {
    name: "verification",
    body: r#"
local previous = redis.call("GET", KEYS[1])
if previous then
  redis.call("DEL", KEYS[1])
  redis.call("DEL", KEYS[3] .. ":" .. previous)
end
redis.call("SET", KEYS[1], ARGV[1], "EX", ARGV[3])
redis.call("SET", KEYS[2], ARGV[2], "EX", ARGV[3])
return 1
"#,
};

/// Returns the key mapping `identity` to its token.
#[must_use]
pub fn identity_key(identity: AccountId) -> String {
    format!("{VERIFICATION_PREFIX}:{identity}")
}

/// Returns the key mapping `token` to its identity.
#[must_use]
pub fn token_key(token: &str) -> String {
    format!("{VERIFICATION_PREFIX}:{token}")
}

fn rotate_verification(
    kv: &mut KeyValues<'_>,
    keys: &[String],
    args: &[String],
) -> Result<ScriptValue> {
    let [identity_key, token_key, prefix] = keys else {
        return Err(Error::internal("verification script expects three keys"));
    };
    let [token, identity, ttl] = args else {
        return Err(Error::internal("verification script expects three arguments"));
    };
    let ttl = ttl
        .parse::<u64>()
        .map_err(|_| Error::internal("verification script TTL must be an integer"))?;

    if let Some(previous) = kv.get(identity_key) {
        kv.del(identity_key);
        kv.del(&format!("{prefix}:{previous}"));
    }
    let ttl = Some(Duration::from_secs(ttl));
    kv.set(identity_key, token, ttl);
    kv.set(token_key, identity, ttl);
    Ok(ScriptValue::Int(1))
}

/// Makes the in-memory store able to run the verification scripts.
pub fn register_memory_scripts(store: &MemoryScriptStore) {
    store.register_native(ROTATE_VERIFICATION.body, rotate_verification);
}

/// Issues and resolves verification tokens.
pub struct VerificationTokens<S: ?Sized> {
    executor: ScriptExecutor<S>,
    ttl: Duration,
}

impl<S: ?Sized> std::fmt::Debug for VerificationTokens<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationTokens")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<S: ScriptStore + ?Sized> VerificationTokens<S> {
    /// Creates a token service whose tokens live for `ttl`.
    #[must_use]
    pub fn new(executor: ScriptExecutor<S>, ttl: Duration) -> Self {
        Self { executor, ttl }
    }

    /// Makes `token` the only live verification token of `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] once the store has failed every attempt and
    /// [`Error::Cancelled`] if `cancel` fires first.
    #[tracing::instrument(skip(self, token, cancel))]
    pub async fn issue(
        &self,
        identity: AccountId,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let keys = [
            identity_key(identity),
            token_key(token),
            VERIFICATION_PREFIX.to_string(),
        ];
        let args = [
            token.to_string(),
            identity.to_string(),
            self.ttl.as_secs().max(1).to_string(),
        ];

        match self
            .executor
            .evaluate(&ROTATE_VERIFICATION, &keys, &args, cancel)
            .await
        {
            Ok(_) => {
                record_verification_token("issued");
                Ok(())
            }
            Err(err) => {
                record_verification_token("failed");
                Err(err)
            }
        }
    }

    /// Returns the identity a live `token` belongs to.
    ///
    /// Values that are not well-formed tokens resolve to nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the store cannot be read.
    pub async fn identity_for_token(&self, token: &str) -> Result<Option<AccountId>> {
        if Uuid::parse_str(token).is_err() {
            return Ok(None);
        }
        let value = self.store().get(&token_key(token)).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Returns the live token of `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the store cannot be read.
    pub async fn token_for_identity(&self, identity: AccountId) -> Result<Option<String>> {
        self.store().get(&identity_key(identity)).await
    }

    fn store(&self) -> &Arc<S> {
        self.executor.store()
    }
}
