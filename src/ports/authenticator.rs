use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verified caller identity returned by an [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            user_id: user_id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }
}

/// Errors raised while verifying a credential
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Authentication provider unavailable: {0}")]
    Unavailable(String),
}

/// Token verifier consumed by the router. Token issuance lives elsewhere.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Verify a bearer token and resolve the caller.
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}
