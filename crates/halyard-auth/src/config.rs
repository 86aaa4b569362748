//! Auth service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use halyard_core::{EnvReader, Error, Result, RetryConfig, Secret};

/// Default access credential TTL (15 minutes).
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 900;

/// Maximum access credential TTL (24 hours).
pub const MAX_ACCESS_TTL_SECS: u64 = 86_400;

/// Default session TTL (7 days).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 86_400;

/// Default verification token TTL (24 hours).
pub const DEFAULT_VERIFICATION_TTL_SECS: u64 = 86_400;

/// Default credential issuer.
pub const DEFAULT_ISSUER: &str = "halyard-auth";

/// Access credential signing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    /// HS256 signing secret.
    pub secret: Secret,
    /// Issuer (`iss`) claim.
    pub issuer: String,
    /// Credential lifetime in seconds.
    pub ttl_seconds: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            secret: Secret::default(),
            issuer: DEFAULT_ISSUER.to_string(),
            ttl_seconds: DEFAULT_ACCESS_TTL_SECS,
        }
    }
}

impl CredentialConfig {
    /// Returns the credential lifetime.
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX))
    }

    /// Validates configuration sanity.
    ///
    /// # Errors
    ///
    /// Returns an error when the secret is missing or the TTL is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_blank() {
            return Err(Error::InvalidInput(
                "HALYARD_JWT_SECRET is required".to_string(),
            ));
        }
        if self.ttl_seconds == 0 || self.ttl_seconds > MAX_ACCESS_TTL_SECS {
            return Err(Error::InvalidInput(format!(
                "HALYARD_JWT_TTL_SECS must be between 1 and {MAX_ACCESS_TTL_SECS}"
            )));
        }
        Ok(())
    }
}

/// Auth service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Access credential settings.
    pub credential: CredentialConfig,
    /// Session lifetime in seconds.
    pub session_ttl_seconds: u64,
    /// Verification token lifetime in seconds.
    pub verification_ttl_seconds: u64,
    /// Retry settings for cache script execution.
    pub cache_retry: RetryConfig,
    /// Postgres connection URL.
    pub database_url: Option<Secret>,
    /// Redis connection URL.
    pub redis_url: Option<Secret>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential: CredentialConfig::default(),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECS,
            verification_ttl_seconds: DEFAULT_VERIFICATION_TTL_SECS,
            cache_retry: RetryConfig::default(),
            database_url: None,
            redis_url: None,
        }
    }
}

impl AuthConfig {
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

        if let Some(secret) = env.string("HALYARD_JWT_SECRET") {
            config.credential.secret = Secret::new(secret);
        }
        if let Some(issuer) = env.string("HALYARD_JWT_ISSUER") {
            config.credential.issuer = issuer;
        }
        if let Some(ttl) = env.u64("HALYARD_JWT_TTL_SECS")? {
            config.credential.ttl_seconds = ttl;
        }
        if let Some(ttl) = env.u64("HALYARD_SESSION_TTL_SECS")? {
            config.session_ttl_seconds = ttl;
        }
        if let Some(ttl) = env.u64("HALYARD_VERIFICATION_TTL_SECS")? {
            config.verification_ttl_seconds = ttl;
        }
        // HALYARD_CACHE_MAX_RETRIES is an alias for HALYARD_CACHE_MAX_ATTEMPTS.
        if let Some(attempts) = env.u32("HALYARD_CACHE_MAX_RETRIES")? {
            config.cache_retry.max_attempts = attempts;
        }
        config.cache_retry = RetryConfig::from_reader(env, "HALYARD_CACHE", config.cache_retry)?;
        config.database_url = env.string("HALYARD_DATABASE_URL").map(Secret::new);
        config.redis_url = env.string("HALYARD_REDIS_URL").map(Secret::new);

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration sanity.
    ///
    /// # Errors
    ///
    /// Returns an error when any setting is out of range.
    pub fn validate(&self) -> Result<()> {
        self.credential.validate()?;
        if self.session_ttl_seconds == 0 {
            return Err(Error::InvalidInput(
                "HALYARD_SESSION_TTL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.verification_ttl_seconds == 0 {
            return Err(Error::InvalidInput(
                "HALYARD_VERIFICATION_TTL_SECS must be greater than zero".to_string(),
            ));
        }
        self.cache_retry.validate("HALYARD_CACHE")
    }

    /// Returns the session lifetime.
    #[must_use]
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.session_ttl_seconds).unwrap_or(i64::MAX))
    }

    /// Returns the verification token lifetime.
    #[must_use]
    pub const fn verification_ttl(&self) -> Duration {
        Duration::from_secs(self.verification_ttl_seconds)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_required() {
        let err = AuthConfig::from_reader(&EnvReader::from_pairs([])).unwrap_err();
        assert!(err.to_string().contains("HALYARD_JWT_SECRET"));
    }

    #[test]
    fn reads_overrides() {
        let env = EnvReader::from_pairs([
            ("HALYARD_JWT_SECRET", "s3cret"),
            ("HALYARD_JWT_TTL_SECS", "60"),
            ("HALYARD_SESSION_TTL_SECS", "3600"),
            ("HALYARD_CACHE_MAX_RETRIES", "5"),
            ("HALYARD_CACHE_BASE_DELAY_MS", "25"),
            ("HALYARD_REDIS_URL", "redis://cache:6379"),
        ]);
        let config = AuthConfig::from_reader(&env).unwrap();
        assert_eq!(config.credential.ttl_seconds, 60);
        assert_eq!(config.session_ttl(), chrono::Duration::hours(1));
        assert_eq!(config.cache_retry.max_attempts, 5);
        assert_eq!(config.cache_retry.base_delay_ms, 25);
        assert_eq!(
            config.redis_url.as_ref().map(Secret::expose),
            Some("redis://cache:6379")
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let env = EnvReader::from_pairs([
            ("HALYARD_JWT_SECRET", "s3cret"),
            ("HALYARD_DATABASE_URL", "postgres://u:pw@db/halyard"),
        ]);
        let rendered = format!("{:?}", AuthConfig::from_reader(&env).unwrap());
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("pw@db"));
    }

    #[test]
    fn rejects_out_of_range_access_ttl() {
        let env = EnvReader::from_pairs([
            ("HALYARD_JWT_SECRET", "s3cret"),
            ("HALYARD_JWT_TTL_SECS", "0"),
        ]);
        assert!(AuthConfig::from_reader(&env).is_err());
    }
}
