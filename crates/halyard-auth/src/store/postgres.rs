//! Postgres account and session store.
//!
//! Session rotation for one (account, device) pair takes a
//! transaction-scoped advisory lock keyed on the pair, so concurrent
//! rotations for the same device run one after another under READ COMMITTED.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use halyard_core::tx::postgres::{PgDatabase, PgTx, map_sqlx_error};
use halyard_core::{Error, Result};

use super::{Account, AccountStore, NewAccount, NewSession, Session, SessionStore};
use crate::identity::{AccountId, DeviceFingerprint, SessionId};

/// Schema for the auth tables.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
    account_id    BIGSERIAL PRIMARY KEY,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT,
    role          TEXT NOT NULL,
    is_verified   BOOLEAN NOT NULL DEFAULT FALSE,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id  BIGSERIAL PRIMARY KEY,
    auth_id     BIGINT NOT NULL,
    parent_id   BIGINT REFERENCES sessions (session_id),
    token       TEXT NOT NULL UNIQUE,
    user_agent  TEXT NOT NULL,
    ip_address  TEXT NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL,
    revoked_at  TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS sessions_active_device_idx
    ON sessions (auth_id, user_agent, ip_address)
    WHERE revoked_at IS NULL;
";

#[derive(Debug, FromRow)]
struct SessionRow {
    session_id: i64,
    auth_id: i64,
    parent_id: Option<i64>,
    token: String,
    user_agent: String,
    ip_address: String,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            account_id: row.auth_id,
            parent_id: row.parent_id,
            token: row.token,
            device: DeviceFingerprint::new(row.user_agent, row.ip_address),
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct AccountRow {
    account_id: i64,
    email: String,
    password_hash: Option<String>,
    role: String,
    is_verified: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = Error;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Self {
            account_id: row.account_id,
            email: row.email,
            password_hash: row.password_hash,
            role: row.role.parse()?,
            is_verified: row.is_verified,
            created_at: row.created_at,
        })
    }
}

fn device_lock_key(account_id: AccountId, device: &DeviceFingerprint) -> String {
    format!(
        "session:{account_id}:{}:{}",
        device.user_agent, device.ip_address
    )
}

#[async_trait]
impl SessionStore for PgDatabase {
    async fn revoke_active_session(
        &self,
        tx: &mut PgTx,
        account_id: AccountId,
        device: &DeviceFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(device_lock_key(account_id, device))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("failed to lock device sessions", e))?;

        let revoked: Vec<(i64,)> = sqlx::query_as(
            "UPDATE sessions SET revoked_at = $5 \
             WHERE auth_id = $1 AND user_agent = $2 AND ip_address = $3 \
             AND revoked_at IS NULL AND expires_at > $4 \
             RETURNING session_id",
        )
        .bind(account_id)
        .bind(&device.user_agent)
        .bind(&device.ip_address)
        .bind(now)
        .bind(now)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to revoke active session", e))?;

        Ok(revoked.into_iter().map(|(id,)| id).max())
    }

    async fn insert_session(&self, tx: &mut PgTx, session: &NewSession) -> Result<SessionId> {
        let (session_id,): (i64,) = sqlx::query_as(
            "INSERT INTO sessions (auth_id, parent_id, token, user_agent, ip_address, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING session_id",
        )
        .bind(session.account_id)
        .bind(session.parent_id)
        .bind(&session.token)
        .bind(&session.device.user_agent)
        .bind(&session.device.ip_address)
        .bind(session.expires_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to create session", e))?;
        Ok(session_id)
    }

    async fn revoke_session_by_token(
        &self,
        tx: &mut PgTx,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>> {
        let revoked: Option<(i64,)> = sqlx::query_as(
            "UPDATE sessions SET revoked_at = $2 \
             WHERE token = $1 AND revoked_at IS NULL \
             RETURNING session_id",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to revoke session", e))?;
        Ok(revoked.map(|(id,)| id))
    }

    async fn active_sessions(
        &self,
        tx: &mut PgTx,
        account_id: AccountId,
        device: &DeviceFingerprint,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT session_id, auth_id, parent_id, token, user_agent, ip_address, \
             expires_at, revoked_at FROM sessions \
             WHERE auth_id = $1 AND user_agent = $2 AND ip_address = $3 \
             AND revoked_at IS NULL AND expires_at > $4 \
             ORDER BY session_id",
        )
        .bind(account_id)
        .bind(&device.user_agent)
        .bind(&device.ip_address)
        .bind(now)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to list active sessions", e))?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn session_by_id(&self, tx: &mut PgTx, session_id: SessionId) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT session_id, auth_id, parent_id, token, user_agent, ip_address, \
             expires_at, revoked_at FROM sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to load session", e))?;
        Ok(row.map(Session::from))
    }
}

#[async_trait]
impl AccountStore for PgDatabase {
    async fn email_registered(&self, tx: &mut PgTx, email: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM accounts WHERE email = $1)")
                .bind(email)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("failed to check email", e))?;
        Ok(exists)
    }

    async fn account_by_email(&self, tx: &mut PgTx, email: &str) -> Result<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT account_id, email, password_hash, role, is_verified, created_at \
             FROM accounts WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to load account", e))?;
        row.map(Account::try_from).transpose()
    }

    async fn insert_account(
        &self,
        tx: &mut PgTx,
        account: &NewAccount,
        now: DateTime<Utc>,
    ) -> Result<Account> {
        let row: AccountRow = sqlx::query_as(
            "INSERT INTO accounts (email, password_hash, role, created_at) \
             VALUES ($1, $2, $3, $4) \
             RETURNING account_id, email, password_hash, role, is_verified, created_at",
        )
        .bind(&account.email)
        .bind(account.password_hash.as_deref())
        .bind(account.role.as_str())
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("failed to create account", e))?;
        Account::try_from(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lock_key_distinguishes_devices() {
        let a = device_lock_key(1, &DeviceFingerprint::new("ua", "10.0.0.1"));
        let b = device_lock_key(1, &DeviceFingerprint::new("ua", "10.0.0.2"));
        let c = device_lock_key(2, &DeviceFingerprint::new("ua", "10.0.0.1"));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
