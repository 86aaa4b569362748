//! Test data factories.

use chrono::Utc;
use uuid::Uuid;

use halyard_core::AccountCreated;

/// Builds an account-created event for `email` with a fresh event id and token.
pub fn account_created(email: &str) -> AccountCreated {
    AccountCreated {
        event_id: Uuid::new_v4().to_string(),
        email: email.to_string(),
        token: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
    }
}

/// Builds an account-created event with a fixed event id.
pub fn account_created_with_id(event_id: &str, email: &str) -> AccountCreated {
    AccountCreated {
        event_id: event_id.to_string(),
        ..account_created(email)
    }
}

/// Returns an email address unique to this call.
pub fn unique_email() -> String {
    format!("user-{}@example.test", Uuid::new_v4().simple())
}
