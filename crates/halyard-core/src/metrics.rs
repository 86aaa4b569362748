//! Core metrics.
//!
//! Counters for retry attempts and transaction outcomes. These complement
//! the structured logs emitted by the retry policy and the transactor.

use metrics::{counter, describe_counter};

// ============================================================================
// Retry Metrics
// ============================================================================

/// Retry attempt counter (one per backoff wait).
pub const RETRY_ATTEMPTS: &str = "halyard_retry_attempts_total";

/// Retry exhaustion counter.
pub const RETRY_EXHAUSTED: &str = "halyard_retry_exhausted_total";

// ============================================================================
// Transaction Metrics
// ============================================================================

/// Transaction outcome counter.
pub const TX_OUTCOMES: &str = "halyard_transactions_total";

/// Registers all core metric descriptions.
///
/// Call this once at application startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(RETRY_ATTEMPTS, "Total backoff waits taken before a retry");
    describe_counter!(RETRY_EXHAUSTED, "Total operations that exhausted their attempts");
    describe_counter!(TX_OUTCOMES, "Total transactions by outcome");
}

/// Records a retry attempt for an operation.
pub fn record_retry(operation: &str) {
    counter!(RETRY_ATTEMPTS, "operation" => operation.to_string()).increment(1);
}

/// Records an operation that gave up after its last attempt.
pub fn record_retry_exhausted(operation: &str) {
    counter!(RETRY_EXHAUSTED, "operation" => operation.to_string()).increment(1);
}

/// Records a transaction outcome (`committed`, `rolled_back`, `begin_failed`, `commit_failed`).
pub fn record_tx_outcome(outcome: &'static str) {
    counter!(TX_OUTCOMES, "outcome" => outcome).increment(1);
}
