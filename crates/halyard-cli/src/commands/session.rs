//! Session command - create, revoke and list device sessions.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use halyard_auth::identity::{AccountId, DeviceFingerprint};
use halyard_auth::{AuthConfig, CredentialIssuer, SessionManager, SignInWorkflow};
use halyard_core::tx::postgres::{PgDatabase, PgPoolSettings};

use crate::{Config, OutputFormat};

/// Arguments for the session command.
#[derive(Debug, Args)]
pub struct SessionArgs {
    /// Session action.
    #[command(subcommand)]
    pub action: SessionAction,
}

/// Session actions.
#[derive(Debug, Subcommand)]
pub enum SessionAction {
    /// Sign an account in from a device, rotating its current session.
    ///
    /// Role and verification state are read from the stored account.
    Create {
        /// Email of the account to sign in.
        #[arg(long)]
        email: String,
        #[allow(missing_docs)]
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Revoke the session holding a token.
    Revoke {
        /// Session token to revoke.
        token: String,
    },
    /// List the active sessions of an account on a device.
    List {
        /// Account to list sessions for.
        #[arg(long)]
        account_id: AccountId,
        #[allow(missing_docs)]
        #[command(flatten)]
        device: DeviceArgs,
    },
}

/// Device identifying a session.
#[derive(Debug, Args)]
pub struct DeviceArgs {
    /// User agent of the device.
    #[arg(long)]
    pub user_agent: String,
    /// IP address of the device.
    #[arg(long)]
    pub ip: String,
}

impl DeviceArgs {
    fn fingerprint(&self) -> DeviceFingerprint {
        DeviceFingerprint::new(&self.user_agent, &self.ip)
    }
}

/// Execute the session command.
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, the database
/// cannot be reached, or the session operation fails.
pub async fn execute(args: SessionArgs, config: &Config) -> Result<()> {
    let auth = AuthConfig::from_env().context("invalid auth configuration")?;
    let database = PgDatabase::connect(config.require_database_url()?, PgPoolSettings::default())
        .await
        .context("failed to connect to database")?;
    let issuer = CredentialIssuer::new(auth.credential.clone())?;
    let database = Arc::new(database);
    let sessions = SessionManager::new(Arc::clone(&database), issuer, auth.session_ttl());

    match args.action {
        SessionAction::Create { email, device } => {
            let identity = SignInWorkflow::new(database)
                .account(&email)
                .await
                .with_context(|| format!("no usable account for {email}"))?
                .identity();
            let grant = sessions
                .create_session(&identity, &device.fingerprint())
                .await?;
            match config.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&grant)?),
                OutputFormat::Text => {
                    println!("Session {} created", grant.session_id);
                    if let Some(parent) = grant.parent_id {
                        println!("  replaces:      {parent}");
                    }
                    println!("  session token: {}", grant.session_token);
                    println!("  access token:  {}", grant.access_token);
                    println!("  expires:       {}", grant.session_expires_at);
                }
            }
        }
        SessionAction::Revoke { token } => {
            let session_id = sessions.revoke_session(&token).await?;
            match config.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "revoked": session_id }));
                }
                OutputFormat::Text => println!("Session {session_id} revoked"),
            }
        }
        SessionAction::List { account_id, device } => {
            let active = sessions
                .active_sessions(account_id, &device.fingerprint())
                .await?;
            match config.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&active)?),
                OutputFormat::Text if active.is_empty() => println!("No active sessions"),
                OutputFormat::Text => {
                    for session in &active {
                        let parent = session
                            .parent_id
                            .map_or_else(|| "-".to_string(), |id| id.to_string());
                        println!(
                            "  {} (parent {parent}, expires {})",
                            session.session_id, session.expires_at
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
