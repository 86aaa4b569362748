//! Welcome notification for newly created accounts.
//!
//! [`WelcomeHandler`] decodes `AccountCreated` events and sends the account
//! a welcome mail carrying its verification link. Mail leaves through a
//! [`Mailer`]; [`LazyMailer`] composes the message and delivers it over a
//! transport connected on first use, dropping the connection after a failed
//! delivery so the next send reconnects.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, Utc};

use halyard_core::{AccountCreated, Connector, Error, LazyConnection, Result};

use crate::broker::Message;
use crate::consumer::EventHandler;
use crate::metrics::record_welcome_mail;

/// Ledger type tag of account-created events.
pub const ACCOUNT_CREATED_EVENT_TYPE: &str = "account.created";

/// Path of the verification confirmation page.
pub const VERIFY_PATH: &str = "/auth/verify-account/confirm";

/// Subject of the welcome mail.
pub const WELCOME_SUBJECT: &str = "Welcome to Halyard!";

/// A composed outbound mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Sender.
    pub from: String,
    /// Recipient.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub text_body: String,
    /// HTML body.
    pub html_body: String,
}

/// Builds the verification link for `token`.
#[must_use]
pub fn verification_url(base_url: &str, token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let token: String = token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    format!("{base}{VERIFY_PATH}?token={token}")
}

/// Composes the welcome mail for `email`.
#[must_use]
pub fn welcome_email(from: &str, base_url: &str, email: &str, token: &str) -> Email {
    let url = verification_url(base_url, token);
    let year = Utc::now().year();
    Email {
        from: from.to_string(),
        to: email.to_string(),
        subject: WELCOME_SUBJECT.to_string(),
        text_body: format!(
            "Welcome to Halyard, {email}!\n\nConfirm your account: {url}\n\n(c) {year} Halyard\n"
        ),
        html_body: format!(
            "<p>Welcome to Halyard, {email}!</p>\
             <p><a href=\"{url}\">Confirm your account</a></p>\
             <p>&copy; {year} Halyard</p>"
        ),
    }
}

/// Sends welcome mail.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends the welcome mail with the verification `token` to `email`.
    async fn send_welcome(&self, email: &str, token: &str) -> Result<()>;
}

/// Delivers composed mail over an open connection.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Delivers `email`.
    async fn deliver(&self, email: &Email) -> Result<()>;
}

/// [`Mailer`] over a lazily connected [`MailTransport`].
pub struct LazyMailer<C: Connector> {
    connection: LazyConnection<C>,
    from: String,
    base_url: String,
}

impl<C: Connector> std::fmt::Debug for LazyMailer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyMailer")
            .field("from", &self.from)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl<C> LazyMailer<C>
where
    C: Connector,
    C::Connection: MailTransport,
{
    /// Creates a mailer that connects through `connector` on first send.
    #[must_use]
    pub fn new(connector: C, from: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            connection: LazyConnection::new(connector),
            from: from.into(),
            base_url: base_url.into(),
        }
    }

    /// Returns how many connections have been opened.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connection.connect_count()
    }
}

#[async_trait]
impl<C> Mailer for LazyMailer<C>
where
    C: Connector,
    C::Connection: MailTransport,
{
    async fn send_welcome(&self, email: &str, token: &str) -> Result<()> {
        let transport = self
            .connection
            .get()
            .await
            .map_err(|e| Error::delivery_with_source("failed to connect to mail relay", e))?;
        let message = welcome_email(&self.from, &self.base_url, email, token);
        match transport.deliver(&message).await {
            Ok(()) => {
                record_welcome_mail("sent");
                Ok(())
            }
            Err(err) => {
                self.connection.invalidate().await;
                record_welcome_mail("failed");
                Err(match err {
                    Error::Delivery { .. } => err,
                    other => Error::delivery_with_source("failed to send welcome mail", other),
                })
            }
        }
    }
}

/// Connector for a transport that writes mail to the log instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransportConnector;

/// Transport that writes mail to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Connector for LogTransportConnector {
    type Connection = LogTransport;

    async fn connect(&self) -> Result<LogTransport> {
        Ok(LogTransport)
    }
}

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, email: &Email) -> Result<()> {
        tracing::info!(to = %email.to, subject = %email.subject, "mail delivered to log");
        Ok(())
    }
}

/// A welcome mail recorded by [`MemoryMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentWelcome {
    /// Recipient.
    pub email: String,
    /// Verification token.
    pub token: String,
}

/// [`Mailer`] that records sends, or fails them on demand.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentWelcome>>,
    fail_sends: AtomicU32,
    attempts: AtomicU64,
}

impl MemoryMailer {
    /// Creates a mailer that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail with a delivery error.
    pub fn fail_next_sends(&self, count: u32) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    /// Returns every successful send.
    #[must_use]
    pub fn sent(&self) -> Vec<SentWelcome> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Returns how many sends were attempted, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send_welcome(&self, email: &str, token: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::delivery("mail relay unavailable"));
        }
        self.sent
            .lock()
            .map_err(|_| Error::internal("mailer lock poisoned"))?
            .push(SentWelcome {
                email: email.to_string(),
                token: token.to_string(),
            });
        Ok(())
    }
}

/// Sends a welcome mail for every account-created event.
#[derive(Debug)]
pub struct WelcomeHandler<M: ?Sized> {
    mailer: std::sync::Arc<M>,
}

impl<M: Mailer + ?Sized> WelcomeHandler<M> {
    /// Creates a handler sending through `mailer`.
    #[must_use]
    pub fn new(mailer: std::sync::Arc<M>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl<M: Mailer + ?Sized> EventHandler for WelcomeHandler<M> {
    fn event_type(&self) -> &str {
        ACCOUNT_CREATED_EVENT_TYPE
    }

    fn event_key(&self, message: &Message) -> Result<String> {
        Ok(AccountCreated::decode(&message.payload)?.event_id)
    }

    async fn handle(&self, message: &Message) -> Result<()> {
        let event = AccountCreated::decode(&message.payload)?;
        self.mailer.send_welcome(&event.email, &event.token).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn verification_url_joins_cleanly() {
        assert_eq!(
            verification_url("https://app.example/", "abc-123"),
            "https://app.example/auth/verify-account/confirm?token=abc-123"
        );
        assert_eq!(
            verification_url("https://app.example", "a&b=c"),
            "https://app.example/auth/verify-account/confirm?token=abbc"
        );
    }

    #[test]
    fn welcome_email_carries_link_and_recipient() {
        let email = welcome_email("ops@example.test", "https://app", "ada@example.com", "t-1");
        assert_eq!(email.to, "ada@example.com");
        assert_eq!(email.subject, WELCOME_SUBJECT);
        assert!(email.html_body.contains("https://app/auth/verify-account/confirm?token=t-1"));
        assert!(email.text_body.contains("token=t-1"));
    }

    struct FlakyConnector {
        fail_first: Arc<AtomicBool>,
    }

    struct FlakyTransport {
        fail: bool,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Connection = FlakyTransport;

        async fn connect(&self) -> Result<FlakyTransport> {
            Ok(FlakyTransport {
                fail: self.fail_first.swap(false, Ordering::SeqCst),
            })
        }
    }

    #[async_trait]
    impl MailTransport for FlakyTransport {
        async fn deliver(&self, _email: &Email) -> Result<()> {
            if self.fail {
                Err(Error::internal("connection reset"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn failed_delivery_reconnects_on_next_send() {
        let mailer = LazyMailer::new(
            FlakyConnector {
                fail_first: Arc::new(AtomicBool::new(true)),
            },
            "ops@example.test",
            "https://app",
        );

        let err = mailer.send_welcome("a@b.c", "t").await.unwrap_err();
        assert!(matches!(err, Error::Delivery { .. }));
        assert!(err.is_retryable());

        mailer.send_welcome("a@b.c", "t").await.unwrap();
        assert_eq!(mailer.connect_count(), 2);
    }

    #[tokio::test]
    async fn connection_is_reused_across_sends() {
        let mailer = LazyMailer::new(LogTransportConnector, "ops@example.test", "https://app");
        mailer.send_welcome("a@b.c", "t").await.unwrap();
        mailer.send_welcome("d@e.f", "u").await.unwrap();
        assert_eq!(mailer.connect_count(), 1);
    }

    #[tokio::test]
    async fn handler_rejects_malformed_payloads() {
        let handler = WelcomeHandler::new(Arc::new(MemoryMailer::new()));
        let message = Message {
            topic: "auth.created".into(),
            partition: 0,
            offset: 0,
            key: "account_1".into(),
            payload: b"garbage".to_vec(),
        };

        assert!(matches!(
            handler.event_key(&message),
            Err(Error::MalformedInput { .. })
        ));
        assert!(matches!(
            handler.handle(&message).await,
            Err(Error::MalformedInput { .. })
        ));
    }

    #[tokio::test]
    async fn handler_sends_to_the_event_email() {
        let mailer = Arc::new(MemoryMailer::new());
        let handler = WelcomeHandler::new(Arc::clone(&mailer));
        let event = halyard_test_utils::account_created("ada@example.com");
        let message = Message {
            topic: "auth.created".into(),
            partition: 0,
            offset: 3,
            key: "account_1".into(),
            payload: event.encode().unwrap(),
        };

        assert_eq!(handler.event_key(&message).unwrap(), event.event_id);
        handler.handle(&message).await.unwrap();
        assert_eq!(
            mailer.sent(),
            vec![SentWelcome {
                email: "ada@example.com".into(),
                token: event.token.clone(),
            }]
        );
    }
}
