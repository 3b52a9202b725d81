use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::{
    config::AuthConfig,
    ports::authenticator::{AuthError, Authenticator, Principal},
};

/// Bearer tokens mapped to principals straight from configuration.
///
/// Meant for service-to-service credentials and local setups; token issuance
/// and expiry belong to an identity provider behind the same port.
pub struct StaticTokenAuthenticator {
    tokens: ArcSwap<HashMap<String, Principal>>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, Principal>) -> Self {
        Self {
            tokens: ArcSwap::from_pointee(tokens),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.tokens.clone())
    }

    /// Swap the token table after a config reload.
    pub fn update(&self, config: &AuthConfig) {
        self.tokens.store(Arc::new(config.tokens.clone()));
        tracing::info!(tokens = config.tokens.len(), "Authentication tokens reloaded");
    }

    pub fn token_count(&self) -> usize {
        self.tokens.load().len()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .load()
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_tokens_resolve_and_reload() {
        let mut config = AuthConfig::default();
        config
            .tokens
            .insert("t-1".to_string(), Principal::new("alice", &["premium"]));
        let auth = StaticTokenAuthenticator::from_config(&config);

        let principal = auth.verify("t-1").await.unwrap();
        assert_eq!(principal.user_id, "alice");
        assert!(matches!(auth.verify("nope").await, Err(AuthError::InvalidToken)));

        auth.update(&AuthConfig::default());
        assert_eq!(auth.token_count(), 0);
        assert!(auth.verify("t-1").await.is_err());
    }
}
