//! Token command - issue and look up verification tokens.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use halyard_auth::script::redis::RedisScriptStore;
use halyard_auth::{AccountId, AuthConfig, ScriptExecutor, VerificationTokens};
use halyard_core::RetryPolicy;

use crate::{Config, OutputFormat};

/// Arguments for the token command.
#[derive(Debug, Args)]
pub struct TokenArgs {
    /// Token action.
    #[command(subcommand)]
    pub action: TokenAction,
}

/// Token actions.
#[derive(Debug, Subcommand)]
pub enum TokenAction {
    /// Issue a fresh verification token, invalidating the previous one.
    Issue {
        /// Account the token verifies.
        #[arg(long)]
        account_id: AccountId,
    },
    /// Show the live token of an account, or the account of a token.
    Lookup {
        /// Account whose live token to show.
        #[arg(long, conflicts_with = "token", required_unless_present = "token")]
        account_id: Option<AccountId>,
        /// Token whose account to show.
        #[arg(long)]
        token: Option<String>,
    },
}

/// Execute the token command.
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, or the cache
/// fails every attempt.
pub async fn execute(args: TokenArgs, config: &Config) -> Result<()> {
    let auth = AuthConfig::from_env().context("invalid auth configuration")?;
    let store = RedisScriptStore::open(config.require_redis_url()?)?;
    let executor = ScriptExecutor::new(Arc::new(store), RetryPolicy::from_config(&auth.cache_retry));
    let tokens = VerificationTokens::new(executor, auth.verification_ttl());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match args.action {
        TokenAction::Issue { account_id } => {
            let token = Uuid::new_v4().to_string();
            tokens.issue(account_id, &token, &cancel).await?;
            match config.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "accountId": account_id, "token": token })
                ),
                OutputFormat::Text => println!("Issued token {token} for account {account_id}"),
            }
        }
        TokenAction::Lookup {
            account_id: Some(account_id),
            ..
        } => {
            let token = tokens.token_for_identity(account_id).await?;
            match config.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "accountId": account_id, "token": token })
                ),
                OutputFormat::Text => match token {
                    Some(token) => println!("Account {account_id}: {token}"),
                    None => println!("Account {account_id}: no live token"),
                },
            }
        }
        TokenAction::Lookup { token, .. } => {
            let token = token.context("either --account-id or --token is required")?;
            let account_id = tokens.identity_for_token(&token).await?;
            match config.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "token": token, "accountId": account_id })
                ),
                OutputFormat::Text => match account_id {
                    Some(id) => println!("Token {token}: account {id}"),
                    None => println!("Token {token}: not live"),
                },
            }
        }
    }
    Ok(())
}
