//! Environment-driven configuration helpers.
//!
//! Each service builds its configuration from an [`EnvReader`], which wraps
//! a variable lookup function. Production code reads the process
//! environment; tests supply a map.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};

/// Reads typed values from an environment-like lookup.
pub struct EnvReader<F> {
    lookup: F,
}

impl EnvReader<fn(&str) -> Option<String>> {
    /// Reads from the process environment.
    #[must_use]
    pub fn process() -> Self {
        Self {
            lookup: |name| std::env::var(name).ok(),
        }
    }
}

impl EnvReader<Box<dyn Fn(&str) -> Option<String>>> {
    /// Reads from a fixed set of variables.
    #[must_use]
    pub fn from_pairs<const N: usize>(pairs: [(&str, &str); N]) -> Self {
        let vars: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            lookup: Box::new(move |name| vars.get(name).cloned()),
        }
    }
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Creates a reader over an arbitrary lookup function.
    pub const fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Returns the trimmed value of `name`, treating empty values as unset.
    pub fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// Parses `name` as a `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is not a valid `u32`.
    pub fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }

    /// Parses `name` as a `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is not a valid `u64`.
    pub fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    /// Parses `name` as a boolean (`true/false/1/0/yes/no`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is not a recognised boolean.
    pub fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

/// A configuration value that must never be printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true when the secret is empty or whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Backoff/retry settings shared by every retrying component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds; doubled per attempt.
    pub base_delay_ms: u64,
    /// Upper bound on a single wait in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: u64::try_from(DEFAULT_BASE_DELAY.as_millis()).unwrap_or(100),
            max_delay_ms: u64::try_from(DEFAULT_MAX_DELAY.as_millis()).unwrap_or(5_000),
        }
    }
}

impl RetryConfig {
    /// Reads retry settings from `{prefix}_MAX_ATTEMPTS`, `{prefix}_BASE_DELAY_MS`
    /// and `{prefix}_MAX_DELAY_MS`, falling back to `defaults`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparsable, or if the
    /// resulting settings fail [`RetryConfig::validate`].
    pub fn from_reader<F>(env: &EnvReader<F>, prefix: &str, defaults: Self) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = defaults;
        if let Some(v) = env.u32(&format!("{prefix}_MAX_ATTEMPTS"))? {
            config.max_attempts = v;
        }
        if let Some(v) = env.u64(&format!("{prefix}_BASE_DELAY_MS"))? {
            config.base_delay_ms = v;
        }
        if let Some(v) = env.u64(&format!("{prefix}_MAX_DELAY_MS"))? {
            config.max_delay_ms = v;
        }
        config.validate(prefix)?;
        Ok(config)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_attempts` is zero or `max_delay_ms` is below `base_delay_ms`.
    pub fn validate(&self, prefix: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput(format!(
                "{prefix}_MAX_ATTEMPTS must be greater than zero"
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::InvalidInput(format!(
                "{prefix}_MAX_DELAY_MS must be at least {prefix}_BASE_DELAY_MS"
            )));
        }
        Ok(())
    }

    /// Returns the base delay.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Returns the maximum delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_are_unset() {
        let env = EnvReader::from_pairs([("A", "  "), ("B", " x ")]);
        assert_eq!(env.string("A"), None);
        assert_eq!(env.string("B").as_deref(), Some("x"));
        assert_eq!(env.string("C"), None);
    }

    #[test]
    fn numeric_parse_errors_name_the_variable() {
        let env = EnvReader::from_pairs([("N", "ten")]);
        let err = env.u64("N").unwrap_err();
        assert!(err.to_string().contains("N must be a u64"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("T", "YES").unwrap());
        assert!(parse_bool("T", "1").unwrap());
        assert!(!parse_bool("T", "false").unwrap());
        assert!(!parse_bool("T", "n").unwrap());
        assert!(parse_bool("T", "maybe").is_err());
    }

    #[test]
    fn retry_config_reads_prefixed_variables() {
        let env = EnvReader::from_pairs([
            ("HALYARD_CACHE_MAX_ATTEMPTS", "5"),
            ("HALYARD_CACHE_BASE_DELAY_MS", "20"),
        ]);
        let config =
            RetryConfig::from_reader(&env, "HALYARD_CACHE", RetryConfig::default()).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay(), Duration::from_millis(20));
        assert_eq!(config.max_delay_ms, 5_000);
    }

    #[test]
    fn retry_config_rejects_zero_attempts() {
        let env = EnvReader::from_pairs([("X_MAX_ATTEMPTS", "0")]);
        assert!(RetryConfig::from_reader(&env, "X", RetryConfig::default()).is_err());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.expose(), "hunter2");
    }
}
