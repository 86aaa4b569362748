//! Persistence for accounts and sessions.
//!
//! Stores are [`TransactionSource`]s: every repository operation takes the
//! live transaction explicitly, so the caller decides how statements are
//! grouped. Both the in-memory and the Postgres implementations satisfy
//! the same contract:
//!
//! - At most one active session per (account, device fingerprint)
//! - A revoked session's `revoked_at` is never cleared
//! - Sessions are never deleted
//! - Account emails are unique

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use halyard_core::{Result, TransactionSource};

use crate::identity::{AccountId, DeviceFingerprint, Identity, Role, SessionId};

/// A persisted session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning account.
    pub account_id: AccountId,
    /// The session this one replaced, if any.
    pub parent_id: Option<SessionId>,
    /// Opaque client-visible token.
    pub token: String,
    /// Device the session was issued to.
    pub device: DeviceFingerprint,
    /// When the session stops being valid.
    pub expires_at: DateTime<Utc>,
    /// When the session was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Returns true when the session is neither revoked nor expired at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Values for a new session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Owning account.
    pub account_id: AccountId,
    /// The revoked predecessor, if any.
    pub parent_id: Option<SessionId>,
    /// Opaque client-visible token.
    pub token: String,
    /// Device the session is issued to.
    pub device: DeviceFingerprint,
    /// When the session stops being valid.
    pub expires_at: DateTime<Utc>,
}

/// A persisted account row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account identifier.
    pub account_id: AccountId,
    /// Normalized email.
    pub email: String,
    /// Password hash; `None` for accounts created through federation.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    /// Authorization role.
    pub role: Role,
    /// Whether the email is verified.
    pub is_verified: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// The principal a session for this account is issued to.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            account_id: self.account_id,
            role: self.role,
            is_verified: self.is_verified,
        }
    }
}

/// Values for a new account row.
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Normalized email.
    pub email: String,
    /// Password hash.
    pub password_hash: Option<String>,
    /// Authorization role.
    pub role: Role,
}

/// Session persistence.
#[async_trait]
pub trait SessionStore: TransactionSource {
    /// Revokes the active session for (`account_id`, `device`) and returns its id.
    ///
    /// Returns `None` when no active session exists.
    async fn revoke_active_session(
        &self,
        tx: &mut Self::Tx,
        account_id: AccountId,
        device: &DeviceFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>>;

    /// Inserts a session and returns its id.
    async fn insert_session(&self, tx: &mut Self::Tx, session: &NewSession) -> Result<SessionId>;

    /// Revokes the unrevoked session holding `token`.
    ///
    /// Returns `None` when no such session exists.
    async fn revoke_session_by_token(
        &self,
        tx: &mut Self::Tx,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>>;

    /// Lists active sessions for (`account_id`, `device`).
    async fn active_sessions(
        &self,
        tx: &mut Self::Tx,
        account_id: AccountId,
        device: &DeviceFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Loads a session by id.
    async fn session_by_id(
        &self,
        tx: &mut Self::Tx,
        session_id: SessionId,
    ) -> Result<Option<Session>>;
}

/// Account persistence.
#[async_trait]
pub trait AccountStore: TransactionSource {
    /// Returns true when `email` belongs to an existing account.
    async fn email_registered(&self, tx: &mut Self::Tx, email: &str) -> Result<bool>;

    /// Loads the account registered under `email`.
    async fn account_by_email(&self, tx: &mut Self::Tx, email: &str) -> Result<Option<Account>>;

    /// Inserts an account.
    ///
    /// Returns [`halyard_core::Error::Conflict`] if the email is taken.
    async fn insert_account(
        &self,
        tx: &mut Self::Tx,
        account: &NewAccount,
        now: DateTime<Utc>,
    ) -> Result<Account>;
}
