//! # halyard-cli
//!
//! Operator command-line interface for Halyard.
//!
//! ## Commands
//!
//! - `halyard migrate` - Create the account, session and event tables
//! - `halyard session` - Create, revoke or list device sessions
//! - `halyard ledger` - Inspect or complete event ledger entries
//! - `halyard token` - Issue or look up verification tokens
//! - `halyard pipeline` - Run sign-ups through the in-memory delivery pipeline
//!
//! ## Configuration
//!
//! - `HALYARD_DATABASE_URL` - Postgres connection string
//! - `HALYARD_REDIS_URL` - Redis connection string for verification tokens
//! - `HALYARD_LOG_FORMAT` - `json` or `pretty` (default)
//!
//! Service settings (credential secret, TTLs, retry budgets) are read from
//! the `HALYARD_*` variables documented on `AuthConfig` and `NotifyConfig`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod metrics;

use clap::{Parser, Subcommand};

use halyard_core::LogFormat;

/// Halyard operator command-line interface.
#[derive(Debug, Parser)]
#[command(name = "halyard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "HALYARD_DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Redis connection string.
    #[arg(long, env = "HALYARD_REDIS_URL", hide_env_values = true)]
    pub redis_url: Option<String>,

    /// Output format.
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Log format.
    #[arg(long, env = "HALYARD_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            database_url: self.database_url.clone(),
            redis_url: self.redis_url.clone(),
            format: self.format,
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the account, session and event tables.
    Migrate,
    /// Manage device sessions.
    Session(commands::session::SessionArgs),
    /// Inspect the event ledger.
    Ledger(commands::ledger::LedgerArgs),
    /// Manage verification tokens.
    Token(commands::token::TokenArgs),
    /// Run sign-ups through the in-memory delivery pipeline.
    Pipeline(commands::pipeline::PipelineArgs),
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

/// CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: Option<String>,
    /// Redis connection string.
    pub redis_url: Option<String>,
    /// Output format.
    pub format: OutputFormat,
}

impl Config {
    /// Returns the database URL or explains how to set it.
    ///
    /// # Errors
    ///
    /// Returns an error if no database URL was given.
    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "database URL is required. Set HALYARD_DATABASE_URL or use --database-url"
            )
        })
    }

    /// Returns the Redis URL or explains how to set it.
    ///
    /// # Errors
    ///
    /// Returns an error if no Redis URL was given.
    pub fn require_redis_url(&self) -> anyhow::Result<&str> {
        self.redis_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("redis URL is required. Set HALYARD_REDIS_URL or use --redis-url")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_flags() {
        let cli = Cli::parse_from([
            "halyard",
            "--database-url",
            "postgres://localhost/halyard",
            "--format",
            "json",
            "--log-format",
            "json",
            "ledger",
            "show",
            "evt-1",
        ]);

        let config = cli.config();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/halyard")
        );
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Ledger(_)));
    }

    #[test]
    fn session_create_names_the_account_by_email() {
        use crate::commands::session::SessionAction;

        let cli = Cli::parse_from([
            "halyard",
            "session",
            "create",
            "--email",
            "ada@example.com",
            "--user-agent",
            "curl/8",
            "--ip",
            "127.0.0.1",
        ]);

        let Commands::Session(args) = cli.command else {
            panic!("expected the session command");
        };
        let SessionAction::Create { email, device } = args.action else {
            panic!("expected session create");
        };
        assert_eq!(email, "ada@example.com");
        assert_eq!(device.user_agent, "curl/8");
        assert!(
            Cli::try_parse_from(["halyard", "session", "create", "--account-id", "1"]).is_err()
        );
    }

    #[test]
    fn missing_urls_are_reported() {
        let config = Config::default();
        let err = config.require_database_url().unwrap_err();
        assert!(err.to_string().contains("HALYARD_DATABASE_URL"));
        assert!(config.require_redis_url().is_err());
    }

    #[test]
    fn command_tree_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
