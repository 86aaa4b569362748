//! Identity and device primitives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use halyard_core::Error;

/// Store-assigned account identifier.
pub type AccountId = i64;

/// Store-assigned session identifier.
pub type SessionId = i64;

/// Authorization role of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular customer account.
    Customer,
    /// Staff account with administrative access.
    Admin,
}

impl Role {
    /// Returns the role as stored and as carried in credentials.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "customer" => Ok(Self::Customer),
            "admin" => Ok(Self::Admin),
            other => Err(Error::internal(format!("unknown role: {other}"))),
        }
    }
}

/// The authenticated principal a session is issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account identifier.
    pub account_id: AccountId,
    /// Authorization role.
    pub role: Role,
    /// Whether the account's email is verified.
    pub is_verified: bool,
}

/// The (user agent, IP address) pair scoping one session per device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFingerprint {
    /// Client user-agent string.
    pub user_agent: String,
    /// Client IP address.
    pub ip_address: String,
}

impl DeviceFingerprint {
    /// Creates a fingerprint.
    #[must_use]
    pub fn new(user_agent: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ip_address: ip_address.into(),
        }
    }
}
