//! Authentication Module
//!
//! Verifies opaque identity tokens. The registry only depends on the
//! [`IdentityVerifier`] trait; [`TokenVerifier`] is the bundled implementation
//! backed by a configured token table.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::AuthConfig;


/// Longest token the bundled verifier will look up
pub const MAX_TOKEN_LENGTH: usize = 4096;

/// Verified identity bound to a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
        }
    }
}

/// Token verification failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token is past its expiry
    Expired,
    /// Token is empty, oversized or contains invalid characters
    Malformed,
    /// Token was revoked
    Revoked,
    /// Token is not known to the verifier
    Unknown,
    /// The verifier backend could not be reached
    Unavailable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Expired => write!(f, "token expired"),
            AuthError::Malformed => write!(f, "token malformed"),
            AuthError::Revoked => write!(f, "token revoked"),
            AuthError::Unknown => write!(f, "token not recognised"),
            AuthError::Unavailable(msg) => write!(f, "identity verifier unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Identity verification contract
///
/// Implement this trait to plug in an external identity service. Any error is
/// treated by the registry as an invalid token.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a token and return the identity it carries
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Token table entry
#[derive(Debug, Clone)]
struct TokenEntry {
    identity: UserIdentity,
    expires_at: Option<DateTime<Utc>>,
    revoked: bool,
}

/// Verifier backed by a static token table with runtime revocation
pub struct TokenVerifier {
    tokens: DashMap<String, TokenEntry>,
}

impl TokenVerifier {
    /// Create a verifier from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let tokens = DashMap::with_capacity(config.tokens.len());
        for entry in &config.tokens {
            tokens.insert(
                entry.token.clone(),
                TokenEntry {
                    identity: UserIdentity::new(entry.user_id.clone(), entry.roles.clone()),
                    expires_at: entry.expires_at,
                    revoked: entry.revoked,
                },
            );
        }
        Self { tokens }
    }

    /// Register a token at runtime
    pub fn insert(&self, token: impl Into<String>, identity: UserIdentity, expires_at: Option<DateTime<Utc>>) {
        self.tokens.insert(
            token.into(),
            TokenEntry {
                identity,
                expires_at,
                revoked: false,
            },
        );
    }

    /// Revoke a token; returns false if it was never registered
    pub fn revoke(&self, token: &str) -> bool {
        match self.tokens.get_mut(token) {
            Some(mut entry) => {
                entry.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Number of registered tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn is_well_formed(token: &str) -> bool {
        !token.is_empty()
            && token.len() <= MAX_TOKEN_LENGTH
            && token.bytes().all(|b| b.is_ascii_graphic())
    }
}

#[async_trait]
impl IdentityVerifier for TokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        if !Self::is_well_formed(token) {
            return Err(AuthError::Malformed);
        }

        let entry = self.tokens.get(token).ok_or(AuthError::Unknown)?;

        if entry.revoked {
            return Err(AuthError::Revoked);
        }

        if let Some(expires_at) = entry.expires_at {
            if expires_at <= Utc::now() {
                return Err(AuthError::Expired);
            }
        }

        Ok(entry.identity.clone())
    }
}
