//! Auth metrics.
//!
//! Counters for session rotation, script cache reloads, verification
//! token issuance and sign-in attempts.

use metrics::{counter, describe_counter};

/// Session creations, labelled by whether a prior session was revoked.
pub const SESSION_ROTATIONS: &str = "halyard_session_rotations_total";

/// Script registrations, labelled by cause (`cold` or `evicted`).
pub const SCRIPT_LOADS: &str = "halyard_script_loads_total";

/// Verification token issuance outcomes.
pub const VERIFICATION_TOKENS: &str = "halyard_verification_tokens_total";

/// Sign-up steps that failed without failing the sign-up.
pub const SIGNUP_DEGRADED: &str = "halyard_signup_degraded_total";

/// Sign-in attempts, labelled by outcome.
pub const SIGN_INS: &str = "halyard_sign_ins_total";

/// Registers all auth metric descriptions.
pub fn register_metrics() {
    describe_counter!(SESSION_ROTATIONS, "Total sessions created");
    describe_counter!(SCRIPT_LOADS, "Total scripts registered with the cache");
    describe_counter!(VERIFICATION_TOKENS, "Total verification token issuance attempts");
    describe_counter!(
        SIGNUP_DEGRADED,
        "Total sign-ups that completed with a failed follow-up step"
    );
    describe_counter!(SIGN_INS, "Total sign-in attempts");
}

/// Records a session creation.
pub fn record_session_rotation(replaced_previous: bool) {
    let replaced = if replaced_previous { "true" } else { "false" };
    counter!(SESSION_ROTATIONS, "replaced" => replaced).increment(1);
}

/// Records a script registration.
pub fn record_script_load(script: &str, cause: &'static str) {
    counter!(SCRIPT_LOADS, "script" => script.to_string(), "cause" => cause).increment(1);
}

/// Records a verification token issuance outcome (`issued` or `failed`).
pub fn record_verification_token(outcome: &'static str) {
    counter!(VERIFICATION_TOKENS, "outcome" => outcome).increment(1);
}

/// Records a degraded sign-up step (`verification_token` or `publish`).
pub fn record_signup_degraded(step: &'static str) {
    counter!(SIGNUP_DEGRADED, "step" => step).increment(1);
}

/// Records a sign-in outcome (`accepted`, `unknown_email`, `no_password` or `rejected`).
pub fn record_sign_in(outcome: &'static str) {
    counter!(SIGN_INS, "outcome" => outcome).increment(1);
}
