//! In-memory account and session store for testing.
//!
//! [`MemoryAuthStore`] is a [`MemoryDatabase`] over [`AuthTables`];
//! transactions are serialized, so concurrent session rotations never
//! interleave.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use halyard_core::tx::memory::{MemoryDatabase, MemoryTx};
use halyard_core::{Error, Result};

use super::{Account, AccountStore, NewAccount, NewSession, Session, SessionStore};
use crate::identity::{AccountId, DeviceFingerprint, SessionId};

/// Tables backing the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct AuthTables {
    accounts: BTreeMap<AccountId, Account>,
    sessions: BTreeMap<SessionId, Session>,
    next_account_id: AccountId,
    next_session_id: SessionId,
}

impl AuthTables {
    /// Returns every session row, oldest first.
    #[must_use]
    pub fn sessions(&self) -> Vec<&Session> {
        self.sessions.values().collect()
    }

    /// Returns every account row, oldest first.
    #[must_use]
    pub fn accounts(&self) -> Vec<&Account> {
        self.accounts.values().collect()
    }
}

/// In-memory account and session store.
pub type MemoryAuthStore = MemoryDatabase<AuthTables>;

type Tx = MemoryTx<AuthTables>;

#[async_trait]
impl SessionStore for MemoryAuthStore {
    async fn revoke_active_session(
        &self,
        tx: &mut Tx,
        account_id: AccountId,
        device: &DeviceFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>> {
        let mut revoked = None;
        for session in tx.state_mut().sessions.values_mut() {
            if session.account_id == account_id
                && &session.device == device
                && session.is_active(now)
            {
                session.revoked_at = Some(now);
                revoked = Some(session.session_id);
            }
        }
        Ok(revoked)
    }

    async fn insert_session(&self, tx: &mut Tx, session: &NewSession) -> Result<SessionId> {
        let tables = tx.state_mut();
        if tables.sessions.values().any(|s| s.token == session.token) {
            return Err(Error::conflict("session token already exists"));
        }
        tables.next_session_id += 1;
        let session_id = tables.next_session_id;
        tables.sessions.insert(
            session_id,
            Session {
                session_id,
                account_id: session.account_id,
                parent_id: session.parent_id,
                token: session.token.clone(),
                device: session.device.clone(),
                expires_at: session.expires_at,
                revoked_at: None,
            },
        );
        Ok(session_id)
    }

    async fn revoke_session_by_token(
        &self,
        tx: &mut Tx,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>> {
        let session = tx
            .state_mut()
            .sessions
            .values_mut()
            .find(|s| s.token == token && s.revoked_at.is_none());
        Ok(session.map(|s| {
            s.revoked_at = Some(now);
            s.session_id
        }))
    }

    async fn active_sessions(
        &self,
        tx: &mut Tx,
        account_id: AccountId,
        device: &DeviceFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        Ok(tx
            .state()
            .sessions
            .values()
            .filter(|s| s.account_id == account_id && &s.device == device && s.is_active(now))
            .cloned()
            .collect())
    }

    async fn session_by_id(&self, tx: &mut Tx, session_id: SessionId) -> Result<Option<Session>> {
        Ok(tx.state().sessions.get(&session_id).cloned())
    }
}

#[async_trait]
impl AccountStore for MemoryAuthStore {
    async fn email_registered(&self, tx: &mut Tx, email: &str) -> Result<bool> {
        Ok(tx.state().accounts.values().any(|a| a.email == email))
    }

    async fn account_by_email(&self, tx: &mut Tx, email: &str) -> Result<Option<Account>> {
        Ok(tx.state().accounts.values().find(|a| a.email == email).cloned())
    }

    async fn insert_account(
        &self,
        tx: &mut Tx,
        account: &NewAccount,
        now: DateTime<Utc>,
    ) -> Result<Account> {
        let tables = tx.state_mut();
        if tables.accounts.values().any(|a| a.email == account.email) {
            return Err(Error::conflict("email already registered"));
        }
        tables.next_account_id += 1;
        let row = Account {
            account_id: tables.next_account_id,
            email: account.email.clone(),
            password_hash: account.password_hash.clone(),
            role: account.role,
            is_verified: false,
            created_at: now,
        };
        tables.accounts.insert(row.account_id, row.clone());
        Ok(row)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use halyard_core::TransactionSource;

    fn device() -> DeviceFingerprint {
        DeviceFingerprint::new("Mozilla/5.0", "10.0.0.1")
    }

    #[tokio::test]
    async fn expired_sessions_are_not_revoked_or_listed() {
        let store = MemoryAuthStore::default();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        store
            .insert_session(
                &mut tx,
                &NewSession {
                    account_id: 1,
                    parent_id: None,
                    token: "t1".into(),
                    device: device(),
                    expires_at: now - chrono::Duration::minutes(1),
                },
            )
            .await
            .unwrap();

        let revoked = store
            .revoke_active_session(&mut tx, 1, &device(), now)
            .await
            .unwrap();
        assert_eq!(revoked, None);
        assert!(
            store
                .active_sessions(&mut tx, 1, &device(), now)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn session_expiring_now_is_no_longer_active() {
        let store = MemoryAuthStore::default();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let id = store
            .insert_session(
                &mut tx,
                &NewSession {
                    account_id: 1,
                    parent_id: None,
                    token: "t1".into(),
                    device: device(),
                    expires_at: now,
                },
            )
            .await
            .unwrap();

        let session = store.session_by_id(&mut tx, id).await.unwrap().unwrap();
        assert!(!session.is_active(now));
        assert!(session.is_active(now - chrono::Duration::milliseconds(1)));
        assert_eq!(
            store
                .revoke_active_session(&mut tx, 1, &device(), now)
                .await
                .unwrap(),
            None
        );
        assert!(
            store
                .active_sessions(&mut tx, 1, &device(), now)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn revoke_by_token_only_matches_unrevoked() {
        let store = MemoryAuthStore::default();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let id = store
            .insert_session(
                &mut tx,
                &NewSession {
                    account_id: 1,
                    parent_id: None,
                    token: "t1".into(),
                    device: device(),
                    expires_at: now + chrono::Duration::hours(1),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store.revoke_session_by_token(&mut tx, "t1", now).await.unwrap(),
            Some(id)
        );
        assert_eq!(
            store.revoke_session_by_token(&mut tx, "t1", now).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let store = MemoryAuthStore::default();
        let mut tx = store.begin().await.unwrap();
        let new = NewAccount {
            email: "a@example.com".into(),
            password_hash: None,
            role: crate::identity::Role::Customer,
        };
        store.insert_account(&mut tx, &new, Utc::now()).await.unwrap();
        let err = store
            .insert_account(&mut tx, &new, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }
}
