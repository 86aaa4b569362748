//! Ledger command - inspect and complete event ledger entries.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};

use halyard_core::tx::postgres::{PgDatabase, PgPoolSettings};
use halyard_notify::{EventLedger, LedgerDecision, NotifyConfig};

use crate::{Config, OutputFormat};

/// Arguments for the ledger command.
#[derive(Debug, Args)]
pub struct LedgerArgs {
    /// Ledger action.
    #[command(subcommand)]
    pub action: LedgerAction,
}

/// Ledger actions.
#[derive(Debug, Subcommand)]
pub enum LedgerAction {
    /// Show an event's entry and what a consumer would decide for it now.
    Show {
        /// Event id to look up.
        event_id: String,
    },
    /// Mark an event as completed so consumers skip it.
    Complete {
        /// Event id to complete.
        event_id: String,
    },
}

/// Execute the ledger command.
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, the database
/// cannot be reached, or the event has no ledger entry to complete.
pub async fn execute(args: LedgerArgs, config: &Config) -> Result<()> {
    let notify = NotifyConfig::from_env().context("invalid notify configuration")?;
    let database = PgDatabase::connect(config.require_database_url()?, PgPoolSettings::default())
        .await
        .context("failed to connect to database")?;
    let ledger = EventLedger::new(Arc::new(database), notify.processing_timeout());

    match args.action {
        LedgerAction::Show { event_id } => {
            let entry = ledger.entry(&event_id).await?;
            let decision =
                LedgerDecision::for_entry(entry.as_ref(), Utc::now(), ledger.processing_timeout());
            match config.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "eventId": event_id,
                        "entry": entry,
                        "decision": decision,
                    }))?
                ),
                OutputFormat::Text => {
                    match &entry {
                        None => println!("Event {event_id}: no ledger entry"),
                        Some(entry) => {
                            println!("Event {event_id} ({})", entry.event_type);
                            println!("  first seen: {}", entry.processed_at);
                            match entry.completed_at {
                                Some(at) => println!("  completed:  {at}"),
                                None => println!("  completed:  -"),
                            }
                        }
                    }
                    println!("  decision:   {decision}");
                }
            }
        }
        LedgerAction::Complete { event_id } => {
            ledger.mark_completed(&event_id).await?;
            match config.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "completed": event_id }));
                }
                OutputFormat::Text => println!("Event {event_id} marked completed"),
            }
        }
    }
    Ok(())
}
