//! Short-lived access credentials.
//!
//! Access credentials are stateless HS256 JWTs bound to an identity, its
//! role and its verification flag. They are never persisted; the session
//! token is the durable half of a sign-in.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use halyard_core::{Error, Result};

use crate::config::CredentialConfig;
use crate::identity::Identity;

/// Claims carried by an access credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject: the account identifier.
    pub sub: String,
    /// Authorization role.
    pub role: String,
    /// Whether the account's email is verified.
    pub verified: bool,
    /// Issuer.
    pub iss: String,
    /// Issued-at (unix timestamp seconds).
    pub iat: usize,
    /// Expiry (unix timestamp seconds).
    pub exp: usize,
}

/// A signed access credential.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    /// Signed JWT.
    pub token: String,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

fn timestamp_to_usize(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("{field} timestamp out of range")))
}

/// Mints and verifies access credentials.
#[derive(Clone)]
pub struct CredentialIssuer {
    config: CredentialConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CredentialIssuer {
    /// Creates an issuer from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: CredentialConfig) -> Result<Self> {
        config.validate()?;
        let secret = config.secret.expose().as_bytes();
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            config,
        })
    }

    /// Mints a credential for `identity`, issued at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credential`] if signing fails.
    pub fn mint(&self, identity: &Identity, now: DateTime<Utc>) -> Result<AccessCredential> {
        let expires_at = now + self.config.ttl();
        let claims = AccessClaims {
            sub: identity.account_id.to_string(),
            role: identity.role.as_str().to_string(),
            verified: identity.is_verified,
            iss: self.config.issuer.clone(),
            iat: timestamp_to_usize(now.timestamp(), "iat")?,
            exp: timestamp_to_usize(expires_at.timestamp(), "exp")?,
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::credential_with_source("failed to sign access credential", e))?;

        Ok(AccessCredential { token, expires_at })
    }

    /// Decodes and validates a credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the token is expired, tampered
    /// with, or was issued by someone else.
    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation)
            .map_err(|e| Error::InvalidInput(format!("invalid access credential: {e}")))?;
        Ok(data.claims)
    }
}
