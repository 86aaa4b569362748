//! Password sign-in.
//!
//! Sign-in resolves the account behind an email and checks the presented
//! password against its stored hash. Hashing lives outside this crate: a
//! [`PasswordVerifier`] does the comparison. Accounts created through
//! federation have no password hash and are refused here.
//!
//! The returned [`Identity`] is what [`crate::SessionManager::create_session`]
//! issues a session for.

use std::sync::Arc;

use async_trait::async_trait;

use halyard_core::{Error, Result, Transactor, UnitOfWork};

use crate::identity::Identity;
use crate::metrics::record_sign_in;
use crate::signup::normalize_email;
use crate::store::{Account, AccountStore};

/// Checks a presented password against a stored hash.
pub trait PasswordVerifier: Send + Sync {
    /// Returns true when `password` matches `password_hash`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash cannot be evaluated.
    fn verify(&self, password: &str, password_hash: &str) -> Result<bool>;
}

struct FindAccount<'a, D> {
    store: &'a D,
    email: &'a str,
}

#[async_trait]
impl<D: AccountStore> UnitOfWork<D::Tx> for FindAccount<'_, D> {
    type Output = Option<Account>;

    async fn run(self, tx: &mut D::Tx) -> Result<Option<Account>> {
        self.store.account_by_email(tx, self.email).await
    }
}

/// Authenticates accounts by email and password.
pub struct SignInWorkflow<D> {
    store: Arc<D>,
    transactor: Transactor<D>,
}

impl<D> std::fmt::Debug for SignInWorkflow<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignInWorkflow").finish_non_exhaustive()
    }
}

impl<D: AccountStore> SignInWorkflow<D> {
    /// Creates a sign-in workflow.
    #[must_use]
    pub fn new(store: Arc<D>) -> Self {
        Self {
            transactor: Transactor::new(Arc::clone(&store)),
            store,
        }
    }

    /// Loads the account registered under `email`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] for a blank email,
    /// [`Error::NotFound`] if no account uses it, and the store's error
    /// otherwise.
    pub async fn account(&self, email: &str) -> Result<Account> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(Error::malformed("email is required"));
        }
        self.transactor
            .run(
                None,
                FindAccount {
                    store: &*self.store,
                    email: &email,
                },
            )
            .await?
            .ok_or_else(|| Error::not_found("account", &email))
    }

    /// Signs in with `email` and `password`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown email and
    /// [`Error::InvalidInput`] if the account has no password or the
    /// password does not match. See also [`SignInWorkflow::account`].
    #[tracing::instrument(skip_all, fields(account_id = tracing::field::Empty))]
    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        verifier: &dyn PasswordVerifier,
    ) -> Result<Identity> {
        let account = match self.account(email).await {
            Ok(account) => account,
            Err(err @ Error::NotFound { .. }) => {
                record_sign_in("unknown_email");
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        tracing::Span::current().record("account_id", account.account_id);

        let Some(password_hash) = account.password_hash.as_deref() else {
            tracing::info!("password sign-in refused for federated account");
            record_sign_in("no_password");
            return Err(Error::InvalidInput(
                "account does not use password sign-in".to_string(),
            ));
        };
        if !verifier.verify(password, password_hash)? {
            record_sign_in("rejected");
            return Err(Error::InvalidInput("invalid credentials".to_string()));
        }

        record_sign_in("accepted");
        tracing::info!("signed in");
        Ok(account.identity())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use crate::store::NewAccount;
    use crate::store::memory::MemoryAuthStore;
    use chrono::Utc;
    use halyard_core::TransactionSource;

    /// Treats the stored hash as `hashed:<password>`.
    struct PrefixVerifier;

    impl PasswordVerifier for PrefixVerifier {
        fn verify(&self, password: &str, password_hash: &str) -> Result<bool> {
            Ok(password_hash.strip_prefix("hashed:") == Some(password))
        }
    }

    async fn store_with(accounts: &[(&str, Option<&str>)]) -> Arc<MemoryAuthStore> {
        let store = Arc::new(MemoryAuthStore::default());
        let mut tx = store.begin().await.unwrap();
        for (email, hash) in accounts {
            store
                .insert_account(
                    &mut tx,
                    &NewAccount {
                        email: (*email).to_string(),
                        password_hash: hash.map(str::to_string),
                        role: Role::Customer,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();
        store
    }

    #[tokio::test]
    async fn sign_in_returns_the_stored_identity() {
        let store = store_with(&[("ada@example.com", Some("hashed:pw"))]).await;
        let workflow = SignInWorkflow::new(store);

        let identity = workflow
            .sign_in(" ADA@example.com", "pw", &PrefixVerifier)
            .await
            .unwrap();

        assert_eq!(
            identity,
            Identity {
                account_id: 1,
                role: Role::Customer,
                is_verified: false,
            }
        );
    }

    #[tokio::test]
    async fn unknown_email_is_not_found() {
        let workflow = SignInWorkflow::new(store_with(&[]).await);
        let err = workflow
            .sign_in("nobody@example.com", "pw", &PrefixVerifier)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let store = store_with(&[("ada@example.com", Some("hashed:pw"))]).await;
        let err = SignInWorkflow::new(store)
            .sign_in("ada@example.com", "guess", &PrefixVerifier)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn account_without_password_cannot_sign_in() {
        let store = store_with(&[("fed@example.com", None)]).await;
        let err = SignInWorkflow::new(store)
            .sign_in("fed@example.com", "", &PrefixVerifier)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("password sign-in")));
    }

    #[tokio::test]
    async fn blank_email_is_malformed() {
        let store = store_with(&[]).await;
        let err = SignInWorkflow::new(Arc::clone(&store))
            .sign_in("  ", "pw", &PrefixVerifier)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
        assert_eq!(store.stats().begins, 1);
    }
}
