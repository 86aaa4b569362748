//! Session rotation invariants under sequential and concurrent sign-ins.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use halyard_auth::config::CredentialConfig;
use halyard_auth::credential::CredentialIssuer;
use halyard_auth::identity::{DeviceFingerprint, Identity, Role};
use halyard_auth::session::SessionManager;
use halyard_auth::signin::{PasswordVerifier, SignInWorkflow};
use halyard_auth::store::memory::MemoryAuthStore;
use halyard_auth::store::{AccountStore, NewAccount, Session};
use halyard_core::{Secret, TransactionSource};

fn issuer() -> CredentialIssuer {
    CredentialIssuer::new(CredentialConfig {
        secret: Secret::new("rotation-secret"),
        ..CredentialConfig::default()
    })
    .unwrap()
}

fn manager(store: &Arc<MemoryAuthStore>) -> SessionManager<MemoryAuthStore> {
    SessionManager::new(Arc::clone(store), issuer(), chrono::Duration::hours(1))
}

struct PlainVerifier;

impl PasswordVerifier for PlainVerifier {
    fn verify(&self, password: &str, password_hash: &str) -> halyard_core::Result<bool> {
        Ok(password == password_hash)
    }
}

fn identity(account_id: i64) -> Identity {
    Identity {
        account_id,
        role: Role::Customer,
        is_verified: true,
    }
}

#[tokio::test]
async fn second_sign_in_revokes_the_first_and_links_it_as_parent() {
    halyard_test_utils::init_test_logging();
    let store = Arc::new(MemoryAuthStore::default());
    let manager = manager(&store);
    let a = identity(1);
    let d1 = DeviceFingerprint::new("Mozilla/5.0", "10.0.0.1");

    let s1 = manager.create_session(&a, &d1).await.unwrap();
    let s2 = manager.create_session(&a, &d1).await.unwrap();

    assert_eq!(s1.parent_id, None);
    assert_eq!(s2.parent_id, Some(s1.session_id));

    let active: Vec<_> = manager
        .active_sessions(1, &d1)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(active, vec![s2.session_id]);

    let tables = store.snapshot().await;
    let first = tables
        .sessions()
        .into_iter()
        .find(|s| s.session_id == s1.session_id)
        .unwrap();
    assert!(first.revoked_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sign_ins_leave_exactly_one_active_session() {
    let store = Arc::new(MemoryAuthStore::default());
    let manager = Arc::new(manager(&store));
    let device = DeviceFingerprint::new("Mozilla/5.0", "10.0.0.1");

    let attempts = (0..16).map(|_| {
        let manager = Arc::clone(&manager);
        let device = device.clone();
        tokio::spawn(async move { manager.create_session(&identity(7), &device).await })
    });
    for result in join_all(attempts).await {
        result.unwrap().unwrap();
    }

    let tables = store.snapshot().await;
    let sessions: HashMap<i64, &Session> = tables
        .sessions()
        .into_iter()
        .map(|s| (s.session_id, s))
        .collect();
    let now = Utc::now();
    let active: Vec<&&Session> = sessions.values().filter(|s| s.is_active(now)).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(sessions.len(), 16);

    // Following parents from the active session visits every other session
    // once and ends at the first, which has no parent.
    let mut seen = 1;
    let mut cursor = active[0].parent_id;
    while let Some(parent_id) = cursor {
        let parent = sessions[&parent_id];
        assert!(parent.revoked_at.is_some());
        seen += 1;
        assert!(seen <= sessions.len(), "parent chain has a cycle");
        cursor = parent.parent_id;
    }
    assert_eq!(seen, sessions.len());
}

#[tokio::test]
async fn explicit_revocation_clears_the_active_session() {
    let store = Arc::new(MemoryAuthStore::default());
    let manager = manager(&store);
    let device = DeviceFingerprint::new("cli", "127.0.0.1");

    let grant = manager.create_session(&identity(3), &device).await.unwrap();
    manager.revoke_session(&grant.session_token).await.unwrap();

    assert!(manager.active_sessions(3, &device).await.unwrap().is_empty());

    let next = manager.create_session(&identity(3), &device).await.unwrap();
    assert_eq!(next.parent_id, None);
}

#[tokio::test]
async fn access_credential_carries_the_identity() {
    let store = Arc::new(MemoryAuthStore::default());
    let config = CredentialConfig {
        secret: Secret::new("rotation-secret"),
        ..CredentialConfig::default()
    };
    let verifier = CredentialIssuer::new(config).unwrap();
    let grant = manager(&store)
        .create_session(
            &Identity {
                account_id: 11,
                role: Role::Admin,
                is_verified: false,
            },
            &DeviceFingerprint::new("ua", "1.2.3.4"),
        )
        .await
        .unwrap();

    let claims = verifier.verify(&grant.access_token).unwrap();
    assert_eq!(claims.sub, "11");
    assert_eq!(claims.role, "admin");
    assert!(!claims.verified);
}

#[tokio::test]
async fn failed_commit_persists_nothing() {
    let store = Arc::new(MemoryAuthStore::default());
    let manager = manager(&store);
    store.fail_next_commit();

    let err = manager
        .create_session(&identity(5), &DeviceFingerprint::new("ua", "1.2.3.4"))
        .await
        .unwrap_err();

    assert!(matches!(err, halyard_core::Error::Transaction { .. }));
    assert!(store.snapshot().await.sessions().is_empty());
}

#[tokio::test]
async fn signed_in_account_gets_a_session_with_its_stored_role() {
    halyard_test_utils::init_test_logging();
    let store = Arc::new(MemoryAuthStore::default());
    let mut tx = store.begin().await.unwrap();
    let account = store
        .insert_account(
            &mut tx,
            &NewAccount {
                email: "ops@example.com".into(),
                password_hash: Some("s3cret".into()),
                role: Role::Admin,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    store.commit(tx).await.unwrap();

    let identity = SignInWorkflow::new(Arc::clone(&store))
        .sign_in("Ops@Example.com", "s3cret", &PlainVerifier)
        .await
        .unwrap();
    let device = DeviceFingerprint::new("Mozilla/5.0", "10.0.0.9");
    let first = manager(&store).create_session(&identity, &device).await.unwrap();
    let second = manager(&store).create_session(&identity, &device).await.unwrap();

    assert_eq!(identity.account_id, account.account_id);
    assert_eq!(second.parent_id, Some(first.session_id));
    let claims = issuer().verify(&second.access_token).unwrap();
    assert_eq!(claims.sub, account.account_id.to_string());
    assert_eq!(claims.role, "admin");
    assert!(!claims.verified);
}
