//! Notification metrics.

use metrics::{counter, describe_counter};

/// Ledger decisions, labelled by decision.
pub const LEDGER_DECISIONS: &str = "halyard_ledger_decisions_total";

/// Consumed messages, labelled by topic and outcome.
pub const CONSUMER_MESSAGES: &str = "halyard_consumer_messages_total";

/// Welcome mails handed to the transport, labelled by outcome.
pub const WELCOME_MAILS: &str = "halyard_welcome_mails_total";

/// Registers all notification metric descriptions.
pub fn register_metrics() {
    describe_counter!(LEDGER_DECISIONS, "Total idempotency ledger decisions");
    describe_counter!(CONSUMER_MESSAGES, "Total messages handled by consumer loops");
    describe_counter!(WELCOME_MAILS, "Total welcome mail deliveries");
}

/// Records a ledger decision.
pub fn record_ledger_decision(decision: &'static str) {
    counter!(LEDGER_DECISIONS, "decision" => decision).increment(1);
}

/// Records what a consumer loop did with one message.
pub fn record_consumer_outcome(topic: &str, outcome: &'static str) {
    counter!(CONSUMER_MESSAGES, "topic" => topic.to_string(), "outcome" => outcome).increment(1);
}

/// Records a welcome mail delivery outcome (`sent` or `failed`).
pub fn record_welcome_mail(outcome: &'static str) {
    counter!(WELCOME_MAILS, "outcome" => outcome).increment(1);
}
