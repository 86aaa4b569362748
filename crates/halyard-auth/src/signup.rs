//! Account sign-up.
//!
//! The account row is written in its own transaction. Issuing the
//! verification token and publishing the `AccountCreated` event happen after
//! commit and are best-effort: their failures are logged and counted, and
//! the sign-up still succeeds. No event is published without a token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use halyard_core::{
    ACCOUNT_CREATED_TOPIC, AccountCreated, Error, EventPublisher, Result, Transactor, UnitOfWork,
};

use crate::identity::Role;
use crate::metrics::record_signup_degraded;
use crate::script::ScriptStore;
use crate::store::{Account, AccountStore, NewAccount};
use crate::verification::VerificationTokens;

/// Result of a sign-up.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    /// The created account.
    pub account: Account,
    /// The issued verification token, if issuance succeeded.
    pub verification_token: Option<String>,
    /// Identifier of the published event, if publishing succeeded.
    pub event_id: Option<String>,
}

/// Inserts an account unless its email is already registered.
pub struct CreateAccount<'a, D> {
    /// Store holding the accounts.
    pub store: &'a D,
    /// The account to insert.
    pub account: NewAccount,
    /// Creation timestamp.
    pub now: DateTime<Utc>,
}

#[async_trait]
impl<D: AccountStore> UnitOfWork<D::Tx> for CreateAccount<'_, D> {
    type Output = Account;

    async fn run(self, tx: &mut D::Tx) -> Result<Account> {
        if self.store.email_registered(tx, &self.account.email).await? {
            return Err(Error::conflict("email already registered"));
        }
        self.store.insert_account(tx, &self.account, self.now).await
    }
}

struct EmailRegistered<'a, D> {
    store: &'a D,
    email: &'a str,
}

#[async_trait]
impl<D: AccountStore> UnitOfWork<D::Tx> for EmailRegistered<'_, D> {
    type Output = bool;

    async fn run(self, tx: &mut D::Tx) -> Result<bool> {
        self.store.email_registered(tx, self.email).await
    }
}

/// Normalizes an email for storage and lookup.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Event key for an account's events.
#[must_use]
pub fn account_event_key(account: &Account) -> String {
    format!("account_{}", account.account_id)
}

/// Creates accounts and announces them.
pub struct SignUpWorkflow<D, S: ?Sized, P: ?Sized> {
    store: Arc<D>,
    transactor: Transactor<D>,
    tokens: VerificationTokens<S>,
    publisher: Arc<P>,
}

impl<D, S: ?Sized, P: ?Sized> std::fmt::Debug for SignUpWorkflow<D, S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignUpWorkflow").finish_non_exhaustive()
    }
}

impl<D, S, P> SignUpWorkflow<D, S, P>
where
    D: AccountStore,
    S: ScriptStore + ?Sized,
    P: EventPublisher + ?Sized,
{
    /// Creates a sign-up workflow.
    #[must_use]
    pub fn new(store: Arc<D>, tokens: VerificationTokens<S>, publisher: Arc<P>) -> Self {
        Self {
            transactor: Transactor::new(Arc::clone(&store)),
            store,
            tokens,
            publisher,
        }
    }

    /// Returns true when no account is registered under `email`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] for a blank email and the store's
    /// error if the lookup fails.
    pub async fn is_email_available(&self, email: &str) -> Result<bool> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(Error::malformed("email is required"));
        }
        let registered = self
            .transactor
            .run(
                None,
                EmailRegistered {
                    store: &*self.store,
                    email: &email,
                },
            )
            .await?;
        Ok(!registered)
    }

    /// Creates a customer account for `email`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] for a blank email,
    /// [`Error::Conflict`] if the email is registered, and the store's error
    /// if the account cannot be written. Token and publish failures do not
    /// fail the sign-up.
    #[tracing::instrument(skip_all, fields(account_id = tracing::field::Empty))]
    pub async fn sign_up(
        &self,
        email: &str,
        password_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<SignUpOutcome> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(Error::malformed("email is required"));
        }

        let account = self
            .transactor
            .run(
                None,
                CreateAccount {
                    store: &*self.store,
                    account: NewAccount {
                        email,
                        password_hash: Some(password_hash.to_string()),
                        role: Role::Customer,
                    },
                    now: Utc::now(),
                },
            )
            .await?;
        tracing::Span::current().record("account_id", account.account_id);
        tracing::info!("account created");

        let token = Uuid::new_v4().to_string();
        if let Err(err) = self.tokens.issue(account.account_id, &token, cancel).await {
            tracing::warn!(error = %err, "verification token not issued");
            record_signup_degraded("verification_token");
            return Ok(SignUpOutcome {
                account,
                verification_token: None,
                event_id: None,
            });
        }

        let event = AccountCreated {
            event_id: Uuid::new_v4().to_string(),
            email: account.email.clone(),
            token: token.clone(),
            created_at: Utc::now(),
        };
        let published = match event.encode() {
            Ok(payload) => self
                .publisher
                .publish(ACCOUNT_CREATED_TOPIC, &account_event_key(&account), payload)
                .await,
            Err(err) => Err(err),
        };
        let event_id = match published {
            Ok(()) => Some(event.event_id),
            Err(err) => {
                tracing::warn!(error = %err, event_id = %event.event_id, "account event not published");
                record_signup_degraded("publish");
                None
            }
        };

        Ok(SignUpOutcome {
            account,
            verification_token: Some(token),
            event_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::script::ScriptExecutor;
    use crate::script::memory::MemoryScriptStore;
    use crate::store::memory::MemoryAuthStore;
    use crate::verification::register_memory_scripts;
    use halyard_core::RetryPolicy;
    use halyard_test_utils::RecordingPublisher;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryAuthStore>,
        scripts: Arc<MemoryScriptStore>,
        publisher: Arc<RecordingPublisher>,
        workflow: SignUpWorkflow<MemoryAuthStore, MemoryScriptStore, RecordingPublisher>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryAuthStore::default());
        let scripts = Arc::new(MemoryScriptStore::new());
        register_memory_scripts(&scripts);
        let publisher = Arc::new(RecordingPublisher::new());
        let tokens = VerificationTokens::new(
            ScriptExecutor::new(
                Arc::clone(&scripts),
                RetryPolicy::new(2, Duration::from_millis(10)),
            ),
            Duration::from_secs(3600),
        );
        let workflow = SignUpWorkflow::new(Arc::clone(&store), tokens, Arc::clone(&publisher));
        Harness {
            store,
            scripts,
            publisher,
            workflow,
        }
    }

    #[tokio::test]
    async fn sign_up_issues_token_and_publishes() {
        let h = harness();
        let outcome = h
            .workflow
            .sign_up("  Ada@Example.COM ", "hash", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.account.email, "ada@example.com");
        assert_eq!(outcome.account.role, Role::Customer);
        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, ACCOUNT_CREATED_TOPIC);
        assert_eq!(published[0].key, format!("account_{}", outcome.account.account_id));

        let event = AccountCreated::decode(&published[0].payload).unwrap();
        assert_eq!(Some(event.event_id), outcome.event_id);
        assert_eq!(Some(event.token), outcome.verification_token);
        assert_eq!(event.email, "ada@example.com");
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let h = harness();
        let cancel = CancellationToken::new();
        h.workflow.sign_up("ada@example.com", "h", &cancel).await.unwrap();

        let err = h
            .workflow
            .sign_up("ADA@example.com", "h", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(h.store.snapshot().await.accounts().len(), 1);
        assert_eq!(h.publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn email_is_unavailable_once_signed_up() {
        let h = harness();
        assert!(h.workflow.is_email_available("ada@example.com").await.unwrap());

        h.workflow
            .sign_up("ada@example.com", "h", &CancellationToken::new())
            .await
            .unwrap();

        assert!(!h.workflow.is_email_available(" Ada@Example.com ").await.unwrap());
        assert!(h.workflow.is_email_available("bob@example.com").await.unwrap());
        let err = h.workflow.is_email_available(" ").await.unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[tokio::test]
    async fn blank_email_is_malformed() {
        let h = harness();
        let err = h
            .workflow
            .sign_up("   ", "h", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
        assert_eq!(h.store.stats().begins, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_failure_keeps_the_account_and_skips_publishing() {
        let h = harness();
        h.scripts.fail_next_evals(10);

        let outcome = h
            .workflow
            .sign_up("ada@example.com", "h", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.verification_token, None);
        assert_eq!(outcome.event_id, None);
        assert_eq!(h.store.snapshot().await.accounts().len(), 1);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_account_and_token() {
        let h = harness();
        h.publisher.fail_publishes(true);

        let outcome = h
            .workflow
            .sign_up("ada@example.com", "h", &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.verification_token.is_some());
        assert_eq!(outcome.event_id, None);
        assert_eq!(h.store.snapshot().await.accounts().len(), 1);
    }
}
