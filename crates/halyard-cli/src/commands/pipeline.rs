//! Pipeline command - run sign-ups through the in-memory delivery pipeline.
//!
//! Wires the sign-up workflow, the in-memory broker and a consumer loop
//! sending welcome mail to the log transport. With `--replay` every event
//! is published a second time so the ledger's duplicate handling shows in
//! the report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use halyard_auth::script::memory::MemoryScriptStore;
use halyard_auth::signup::account_event_key;
use halyard_auth::store::memory::MemoryAuthStore;
use halyard_auth::verification::register_memory_scripts;
use halyard_auth::{AuthConfig, ScriptExecutor, SignUpWorkflow, VerificationTokens};
use halyard_core::{ACCOUNT_CREATED_TOPIC, AccountCreated, Error, EventPublisher, RetryPolicy};
use halyard_notify::broker::memory::MemoryBroker;
use halyard_notify::ledger::memory::MemoryLedgerStore;
use halyard_notify::welcome::{LazyMailer, LogTransportConnector};
use halyard_notify::{ConsumerLoop, ConsumerStats, EventLedger, NotifyConfig, WelcomeHandler};

use crate::{Config, OutputFormat};

/// Arguments for the pipeline command.
#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Number of accounts to sign up.
    #[arg(long, default_value = "3")]
    pub accounts: u32,

    /// Publish every account event a second time.
    #[arg(long)]
    pub replay: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Seconds to wait for the consumer to drain the topic.
    #[arg(long, default_value = "10")]
    pub timeout_secs: u64,
}

/// Summary of a pipeline run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    /// Accounts created.
    pub accounts: u32,
    /// Messages published, replays included.
    pub published: u32,
    /// Messages still uncommitted when the consumer stopped.
    pub pending: usize,
    /// Consumer counters.
    pub consumer: ConsumerStats,
}

/// Execute the pipeline command.
///
/// # Errors
///
/// Returns an error if configuration is invalid, a sign-up fails, or the
/// consumer stops with an error.
pub async fn execute(args: PipelineArgs, config: &Config) -> Result<()> {
    let prometheus = if args.metrics {
        Some(crate::metrics::init_metrics()?)
    } else {
        None
    };
    let auth = AuthConfig::default();
    let notify = NotifyConfig::from_env().context("invalid notify configuration")?;

    let scripts = Arc::new(MemoryScriptStore::new());
    register_memory_scripts(&scripts);
    let tokens = VerificationTokens::new(
        ScriptExecutor::new(scripts, RetryPolicy::from_config(&auth.cache_retry)),
        auth.verification_ttl(),
    );
    let broker = Arc::new(MemoryBroker::new(Duration::from_secs(1)));
    let signup = SignUpWorkflow::new(
        Arc::new(MemoryAuthStore::default()),
        tokens,
        Arc::clone(&broker),
    );

    let ledger = Arc::new(EventLedger::new(
        Arc::new(MemoryLedgerStore::default()),
        notify.processing_timeout(),
    ));
    let mailer = Arc::new(LazyMailer::new(
        LogTransportConnector,
        notify.mail_from.clone(),
        notify.app_base_url.clone(),
    ));
    let consumer = Arc::new(ConsumerLoop::new(
        "pipeline",
        Arc::new(broker.subscribe(&notify.consumer_group, ACCOUNT_CREATED_TOPIC)),
        ledger,
        Arc::new(WelcomeHandler::new(mailer)),
        RetryPolicy::from_config(&notify.broker_retry),
    ));

    let cancel = CancellationToken::new();
    let handle = Arc::clone(&consumer).spawn(cancel.clone());

    let mut published = 0;
    for n in 0..args.accounts {
        let outcome = signup
            .sign_up(&format!("user{n}@example.test"), "pipeline", &cancel)
            .await
            .with_context(|| format!("sign-up {n} failed"))?;
        if outcome.event_id.is_some() {
            published += 1;
        }
        if let (true, Some(event_id), Some(token)) =
            (args.replay, outcome.event_id, outcome.verification_token)
        {
            let event = AccountCreated {
                event_id,
                email: outcome.account.email.clone(),
                token,
                created_at: outcome.account.created_at,
            };
            broker
                .publish(
                    ACCOUNT_CREATED_TOPIC,
                    &account_event_key(&outcome.account),
                    event.encode()?,
                )
                .await?;
            published += 1;
        }
    }

    let group = notify.consumer_group.as_str();
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    while broker.pending(group, ACCOUNT_CREATED_TOPIC) > 0 && Instant::now() < deadline {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }
    cancel.cancel();
    let Err(stopped) = handle.await.context("consumer task panicked")?;
    if !matches!(stopped, Error::Cancelled) {
        return Err(stopped).context("consumer stopped");
    }
    let stats = consumer.stats();

    let report = PipelineReport {
        accounts: args.accounts,
        published,
        pending: broker.pending(group, ACCOUNT_CREATED_TOPIC),
        consumer: stats,
    };
    match config.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!(
                "Signed up {} accounts, published {} events",
                report.accounts, report.published
            );
            println!(
                "  processed {}, duplicates {}, contended {}, failed {}, pending {}",
                stats.processed, stats.duplicates, stats.contended, stats.failed, report.pending
            );
        }
    }
    if let Some(prometheus) = prometheus {
        println!("{}", prometheus.render());
    }
    Ok(())
}
