//! Notification service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use halyard_core::{ACCOUNT_CREATED_TOPIC, EnvReader, Error, Result, RetryConfig, Secret};

/// Default ownership window (60 seconds).
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: u64 = 60;

/// Default broker retry base delay in milliseconds.
pub const DEFAULT_BROKER_BASE_DELAY_MS: u64 = 200;

/// Default consumer group.
pub const DEFAULT_CONSUMER_GROUP: &str = "halyard-notify";

/// Default sender address.
pub const DEFAULT_MAIL_FROM: &str = "Halyard <no-reply@halyard.dev>";

/// Default base URL for links in outbound mail.
pub const DEFAULT_APP_BASE_URL: &str = "http://localhost:3000";

/// Notification service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyConfig {
    /// Topic carrying account-created events.
    pub topic: String,
    /// Consumer group shared by all instances.
    pub consumer_group: String,
    /// Ownership window of an unfinished ledger entry, in seconds.
    pub processing_timeout_seconds: u64,
    /// Retry settings for fetch, handling and commit.
    pub broker_retry: RetryConfig,
    /// Sender address of outbound mail.
    pub mail_from: String,
    /// Base URL of the verification link.
    pub app_base_url: String,
    /// Postgres connection URL.
    pub database_url: Option<Secret>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            topic: ACCOUNT_CREATED_TOPIC.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            processing_timeout_seconds: DEFAULT_PROCESSING_TIMEOUT_SECS,
            broker_retry: RetryConfig {
                base_delay_ms: DEFAULT_BROKER_BASE_DELAY_MS,
                ..RetryConfig::default()
            },
            mail_from: DEFAULT_MAIL_FROM.to_string(),
            app_base_url: DEFAULT_APP_BASE_URL.to_string(),
            database_url: None,
        }
    }
}

impl NotifyConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or validation fails.
    pub fn from_env() -> Result<Self> {
        Self::from_reader(&EnvReader::process())
    }

    /// Loads configuration from `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or validation fails.
    pub fn from_reader<F>(env: &EnvReader<F>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(topic) = env.string("HALYARD_NOTIFY_TOPIC") {
            config.topic = topic;
        }
        if let Some(group) = env.string("HALYARD_NOTIFY_GROUP") {
            config.consumer_group = group;
        }
        if let Some(timeout) = env.u64("HALYARD_NOTIFY_PROCESSING_TIMEOUT_SECS")? {
            config.processing_timeout_seconds = timeout;
        }
        config.broker_retry = RetryConfig::from_reader(env, "HALYARD_BROKER", config.broker_retry)?;
        if let Some(from) = env.string("HALYARD_MAIL_FROM") {
            config.mail_from = from;
        }
        if let Some(url) = env.string("HALYARD_APP_BASE_URL") {
            config.app_base_url = url;
        }
        config.database_url = env.string("HALYARD_DATABASE_URL").map(Secret::new);

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration sanity.
    ///
    /// # Errors
    ///
    /// Returns an error when any setting is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::InvalidInput(
                "HALYARD_NOTIFY_TOPIC must not be empty".to_string(),
            ));
        }
        if self.processing_timeout_seconds == 0 {
            return Err(Error::InvalidInput(
                "HALYARD_NOTIFY_PROCESSING_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }
        if !self.mail_from.contains('@') {
            return Err(Error::InvalidInput(
                "HALYARD_MAIL_FROM must contain an address".to_string(),
            ));
        }
        self.broker_retry.validate("HALYARD_BROKER")
    }

    /// Returns the ledger ownership window.
    #[must_use]
    pub const fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_seconds)
    }
}
