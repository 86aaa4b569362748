//! Session lifecycle.
//!
//! Signing in from a device rotates that device's session: inside one
//! transaction the current active session for (account, device) is revoked
//! and a new one is inserted with the revoked session recorded as its
//! parent. Because revoke happens before insert in the same transaction, a
//! crash between the two steps cannot leave two active sessions for one
//! device. Sessions form a linear chain through `parent_id`.
//!
//! The access credential returned alongside the session token is minted
//! outside the transaction and is only handed out once the session row has
//! been committed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use halyard_core::{Error, Result, Transactor, UnitOfWork};

use crate::credential::CredentialIssuer;
use crate::identity::{AccountId, DeviceFingerprint, Identity, SessionId};
use crate::metrics::record_session_rotation;
use crate::store::{NewSession, Session, SessionStore};

/// Result of a successful sign-in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    /// The new session's identifier.
    pub session_id: SessionId,
    /// The session this one replaced, if any.
    pub parent_id: Option<SessionId>,
    /// Opaque session token (set as an HTTP-only cookie by the gateway).
    pub session_token: String,
    /// Short-lived signed access credential.
    pub access_token: String,
    /// When the session expires.
    pub session_expires_at: DateTime<Utc>,
    /// When the access credential expires.
    pub access_expires_at: DateTime<Utc>,
}

/// Revokes the active session of a device and inserts its replacement.
///
/// Returns `(new_session_id, revoked_parent_id)`. Can be nested inside a
/// larger unit of work.
pub struct RotateSession<'a, D> {
    /// Store holding the sessions.
    pub store: &'a D,
    /// The replacement session; `parent_id` is filled in by the rotation.
    pub session: NewSession,
    /// Revocation timestamp.
    pub now: DateTime<Utc>,
}

#[async_trait]
impl<D: SessionStore> UnitOfWork<D::Tx> for RotateSession<'_, D> {
    type Output = (SessionId, Option<SessionId>);

    async fn run(mut self, tx: &mut D::Tx) -> Result<Self::Output> {
        let parent_id = self
            .store
            .revoke_active_session(tx, self.session.account_id, &self.session.device, self.now)
            .await?;
        self.session.parent_id = parent_id;
        let session_id = self.store.insert_session(tx, &self.session).await?;
        Ok((session_id, parent_id))
    }
}

struct RevokeByToken<'a, D> {
    store: &'a D,
    token: &'a str,
    now: DateTime<Utc>,
}

#[async_trait]
impl<D: SessionStore> UnitOfWork<D::Tx> for RevokeByToken<'_, D> {
    type Output = Option<SessionId>;

    async fn run(self, tx: &mut D::Tx) -> Result<Option<SessionId>> {
        self.store
            .revoke_session_by_token(tx, self.token, self.now)
            .await
    }
}

struct ListActive<'a, D> {
    store: &'a D,
    account_id: AccountId,
    device: &'a DeviceFingerprint,
    now: DateTime<Utc>,
}

#[async_trait]
impl<D: SessionStore> UnitOfWork<D::Tx> for ListActive<'_, D> {
    type Output = Vec<Session>;

    async fn run(self, tx: &mut D::Tx) -> Result<Vec<Session>> {
        self.store
            .active_sessions(tx, self.account_id, self.device, self.now)
            .await
    }
}

/// Creates and revokes sessions.
pub struct SessionManager<D> {
    store: Arc<D>,
    transactor: Transactor<D>,
    credentials: CredentialIssuer,
    session_ttl: chrono::Duration,
}

impl<D> std::fmt::Debug for SessionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

impl<D: SessionStore> SessionManager<D> {
    /// Creates a session manager.
    #[must_use]
    pub fn new(store: Arc<D>, credentials: CredentialIssuer, session_ttl: chrono::Duration) -> Self {
        Self {
            transactor: Transactor::new(Arc::clone(&store)),
            store,
            credentials,
            session_ttl,
        }
    }

    /// Rotates the session of `device` for `identity` and mints an access credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credential`] if signing fails, [`Error::Transaction`]
    /// if the transaction cannot be opened or committed, and the store's
    /// error if revoking or inserting fails. Nothing is persisted on error.
    #[tracing::instrument(
        skip(self, identity, device),
        fields(
            account_id = identity.account_id,
            session_id = tracing::field::Empty,
            parent_id = tracing::field::Empty
        )
    )]
    pub async fn create_session(
        &self,
        identity: &Identity,
        device: &DeviceFingerprint,
    ) -> Result<SessionGrant> {
        let now = Utc::now();
        let access = self.credentials.mint(identity, now)?;

        let session = NewSession {
            account_id: identity.account_id,
            parent_id: None,
            token: Uuid::new_v4().to_string(),
            device: device.clone(),
            expires_at: now + self.session_ttl,
        };
        let session_token = session.token.clone();
        let session_expires_at = session.expires_at;

        let (session_id, parent_id) = self
            .transactor
            .run(
                None,
                RotateSession {
                    store: &*self.store,
                    session,
                    now,
                },
            )
            .await?;

        let span = tracing::Span::current();
        span.record("session_id", session_id);
        if let Some(parent) = parent_id {
            span.record("parent_id", parent);
        }
        record_session_rotation(parent_id.is_some());
        tracing::info!("session created");

        Ok(SessionGrant {
            session_id,
            parent_id,
            session_token,
            access_token: access.token,
            session_expires_at,
            access_expires_at: access.expires_at,
        })
    }

    /// Revokes the session holding `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if `token` is not a well-formed
    /// session token and [`Error::NotFound`] if no unrevoked session holds it.
    #[tracing::instrument(skip(self, token))]
    pub async fn revoke_session(&self, token: &str) -> Result<SessionId> {
        let token = token.trim();
        validate_session_token(token)?;

        let revoked = self
            .transactor
            .run(
                None,
                RevokeByToken {
                    store: &*self.store,
                    token,
                    now: Utc::now(),
                },
            )
            .await?;

        match revoked {
            Some(session_id) => {
                tracing::info!(session_id, "session revoked");
                Ok(session_id)
            }
            None => Err(Error::not_found("session", redact_token(token))),
        }
    }

    /// Lists the active sessions of `device` for `account_id`.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the query fails.
    pub async fn active_sessions(
        &self,
        account_id: AccountId,
        device: &DeviceFingerprint,
    ) -> Result<Vec<Session>> {
        self.transactor
            .run(
                None,
                ListActive {
                    store: &*self.store,
                    account_id,
                    device,
                    now: Utc::now(),
                },
            )
            .await
    }
}

fn validate_session_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::malformed("session token is required"));
    }
    Uuid::parse_str(token)
        .map(|_| ())
        .map_err(|_| Error::malformed("session token is not well-formed"))
}

fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::CredentialConfig;
    use crate::identity::Role;
    use crate::store::memory::MemoryAuthStore;
    use halyard_core::Secret;

    fn manager(store: &Arc<MemoryAuthStore>) -> SessionManager<MemoryAuthStore> {
        let credentials = CredentialIssuer::new(CredentialConfig {
            secret: Secret::new("test-secret"),
            ..CredentialConfig::default()
        })
        .unwrap();
        SessionManager::new(Arc::clone(store), credentials, chrono::Duration::days(7))
    }

    fn identity() -> Identity {
        Identity {
            account_id: 7,
            role: Role::Customer,
            is_verified: true,
        }
    }

    #[tokio::test]
    async fn first_session_has_no_parent() {
        let store = Arc::new(MemoryAuthStore::default());
        let grant = manager(&store)
            .create_session(&identity(), &DeviceFingerprint::new("ua", "1.1.1.1"))
            .await
            .unwrap();

        assert_eq!(grant.parent_id, None);
        assert!(Uuid::parse_str(&grant.session_token).is_ok());
        assert!(!grant.access_token.is_empty());
    }

    #[tokio::test]
    async fn other_devices_are_untouched() {
        let store = Arc::new(MemoryAuthStore::default());
        let manager = manager(&store);
        let laptop = DeviceFingerprint::new("laptop", "1.1.1.1");
        let phone = DeviceFingerprint::new("phone", "1.1.1.1");

        manager.create_session(&identity(), &laptop).await.unwrap();
        let phone_grant = manager.create_session(&identity(), &phone).await.unwrap();

        assert_eq!(phone_grant.parent_id, None);
        assert_eq!(manager.active_sessions(7, &laptop).await.unwrap().len(), 1);
        assert_eq!(manager.active_sessions(7, &phone).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_token_is_rejected_before_touching_the_store() {
        let store = Arc::new(MemoryAuthStore::default());
        let manager = manager(&store);

        let blank = manager.revoke_session("   ").await.unwrap_err();
        let garbage = manager.revoke_session("not-a-token").await.unwrap_err();

        assert!(matches!(blank, Error::MalformedInput { .. }));
        assert!(matches!(garbage, Error::MalformedInput { .. }));
        assert_eq!(store.stats().begins, 0);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let store = Arc::new(MemoryAuthStore::default());
        let err = manager(&store)
            .revoke_session(&Uuid::new_v4().to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotFound { resource_type: "session", .. }));
    }

    #[tokio::test]
    async fn revoked_session_cannot_be_revoked_twice() {
        let store = Arc::new(MemoryAuthStore::default());
        let manager = manager(&store);
        let grant = manager
            .create_session(&identity(), &DeviceFingerprint::new("ua", "1.1.1.1"))
            .await
            .unwrap();

        assert_eq!(
            manager.revoke_session(&grant.session_token).await.unwrap(),
            grant.session_id
        );
        assert!(matches!(
            manager.revoke_session(&grant.session_token).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn redacted_token_keeps_only_a_prefix() {
        assert_eq!(
            redact_token("0f8fad5b-d9cb-469f-a165-70867728950e"),
            "0f8fad5b..."
        );
    }
}
