//! # halyard-auth
//!
//! Identity-side workflows of the Halyard services.
//!
//! - **Session Lifecycle**: per-device session rotation with a parent chain
//! - **Atomic Scripts**: cached server-side scripts with reload on eviction
//! - **Verification Tokens**: one live token per identity, enforced by the cache
//! - **Sign-up**: account creation followed by best-effort token issuance and
//!   event publication, plus an email availability check
//! - **Sign-in**: password check against the stored account, yielding the
//!   identity a session is issued for
//!
//! ## Stores
//!
//! Session and account persistence is defined by [`store::SessionStore`] and
//! [`store::AccountStore`], implemented for Postgres (feature `postgres`) and
//! in memory. Scripts run against [`script::ScriptStore`], implemented for
//! Redis (feature `redis`) and in memory.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use halyard_auth::config::CredentialConfig;
//! use halyard_auth::credential::CredentialIssuer;
//! use halyard_auth::identity::{DeviceFingerprint, Identity, Role};
//! use halyard_auth::session::SessionManager;
//! use halyard_auth::store::memory::MemoryAuthStore;
//! use halyard_core::Secret;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> halyard_core::Result<()> {
//! let credentials = CredentialIssuer::new(CredentialConfig {
//!     secret: Secret::new("dev-secret"),
//!     ..CredentialConfig::default()
//! })?;
//! let sessions = SessionManager::new(
//!     Arc::new(MemoryAuthStore::default()),
//!     credentials,
//!     chrono::Duration::days(7),
//! );
//! let identity = Identity { account_id: 1, role: Role::Customer, is_verified: false };
//! let device = DeviceFingerprint::new("curl/8", "127.0.0.1");
//!
//! let first = sessions.create_session(&identity, &device).await?;
//! let second = sessions.create_session(&identity, &device).await?;
//! assert_eq!(second.parent_id, Some(first.session_id));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod credential;
pub mod identity;
pub mod metrics;
pub mod script;
pub mod session;
pub mod signin;
pub mod signup;
pub mod store;
pub mod verification;

pub use config::{AuthConfig, CredentialConfig};
pub use credential::{AccessClaims, AccessCredential, CredentialIssuer};
pub use identity::{AccountId, DeviceFingerprint, Identity, Role, SessionId};
pub use script::{Script, ScriptExecutor, ScriptStore, ScriptValue};
pub use session::{SessionGrant, SessionManager};
pub use signin::{PasswordVerifier, SignInWorkflow};
pub use signup::{SignUpOutcome, SignUpWorkflow};
pub use store::{Account, AccountStore, Session, SessionStore};
pub use verification::VerificationTokens;
