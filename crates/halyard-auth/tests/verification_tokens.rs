//! Verification token issuance through the script executor.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use halyard_auth::script::memory::MemoryScriptStore;
use halyard_auth::script::{ScriptExecutor, ScriptStore};
use halyard_auth::verification::{
    ROTATE_VERIFICATION, VerificationTokens, register_memory_scripts,
};
use halyard_core::RetryPolicy;

fn tokens(store: &Arc<MemoryScriptStore>) -> VerificationTokens<MemoryScriptStore> {
    VerificationTokens::new(
        ScriptExecutor::new(
            Arc::clone(store),
            RetryPolicy::new(3, Duration::from_millis(5)),
        ),
        Duration::from_secs(600),
    )
}

fn store() -> Arc<MemoryScriptStore> {
    let store = Arc::new(MemoryScriptStore::new());
    register_memory_scripts(&store);
    store
}

#[tokio::test]
async fn second_issue_invalidates_the_first_token() {
    let store = store();
    let tokens = tokens(&store);
    let cancel = CancellationToken::new();
    let old = Uuid::new_v4().to_string();
    let new = Uuid::new_v4().to_string();

    tokens.issue(100, &old, &cancel).await.unwrap();
    tokens.issue(100, &new, &cancel).await.unwrap();

    assert_eq!(tokens.identity_for_token(&old).await.unwrap(), None);
    assert_eq!(tokens.identity_for_token(&new).await.unwrap(), Some(100));
    assert_eq!(tokens.token_for_identity(100).await.unwrap(), Some(new));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_issues_leave_one_live_token() {
    let store = store();
    let tokens = Arc::new(tokens(&store));
    let issued: Vec<String> = (0..12).map(|_| Uuid::new_v4().to_string()).collect();

    let tasks = issued.iter().cloned().map(|token| {
        let tokens = Arc::clone(&tokens);
        tokio::spawn(async move { tokens.issue(55, &token, &CancellationToken::new()).await })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let live = tokens.token_for_identity(55).await.unwrap().unwrap();
    let mut resolvable = 0;
    for token in &issued {
        if tokens.identity_for_token(token).await.unwrap().is_some() {
            assert_eq!(token, &live);
            resolvable += 1;
        }
    }
    assert_eq!(resolvable, 1);
}

#[tokio::test]
async fn handle_is_cached_in_the_store_under_the_script_name() {
    let store = store();
    let tokens = tokens(&store);
    tokens
        .issue(1, &Uuid::new_v4().to_string(), &CancellationToken::new())
        .await
        .unwrap();

    let handle = store.get("hs:verification").await.unwrap();
    assert!(handle.is_some());
    assert_eq!(ROTATE_VERIFICATION.handle_key(), "hs:verification");
}

#[tokio::test]
async fn issuance_survives_a_script_cache_flush() {
    let store = store();
    let tokens = tokens(&store);
    let cancel = CancellationToken::new();

    tokens
        .issue(2, &Uuid::new_v4().to_string(), &cancel)
        .await
        .unwrap();
    store.flush_scripts();
    let token = Uuid::new_v4().to_string();
    tokens.issue(2, &token, &cancel).await.unwrap();

    assert_eq!(tokens.identity_for_token(&token).await.unwrap(), Some(2));
    assert_eq!(store.load_count(), 2);
}

#[tokio::test]
async fn cancelled_issue_writes_nothing() {
    let store = store();
    let tokens = tokens(&store);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = tokens
        .issue(3, &Uuid::new_v4().to_string(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, halyard_core::Error::Cancelled));
    assert_eq!(tokens.token_for_identity(3).await.unwrap(), None);
}
