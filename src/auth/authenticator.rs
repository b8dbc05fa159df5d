//! Connection authentication
//!
//! Resolves the token presented on a WebSocket upgrade to a principal before
//! the hub ever sees the connection. A rejected token never reaches the hub.

use crate::config::TokenGrant;
use crate::error::Result;
use crate::types::Principal;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Trait for upgrade token authentication
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a token to a principal, or `None` if it is not valid
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>>;
}

/// Authenticator backed by a fixed token table from configuration
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    /// Create an authenticator from configured token grants
    pub fn new(grants: HashMap<String, TokenGrant>) -> Self {
        let tokens = grants
            .into_iter()
            .map(|(token, grant)| (token, Principal::from(grant)))
            .collect();
        Self { tokens }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>> {
        if token.is_empty() {
            return Ok(None);
        }

        match self.tokens.get(token) {
            Some(principal) => {
                debug!(
                    "Token resolved to {} {}",
                    principal.kind, principal.user_id
                );
                Ok(Some(principal.clone()))
            }
            None => {
                warn!("Rejected unknown upgrade token");
                Ok(None)
            }
        }
    }
}

/// Mock authenticator for testing
///
/// Accepts tokens of the form `customer:<id>` and `worker:<id>`, or denies
/// everything.
pub struct MockAuthenticator {
    allow: bool,
}

impl MockAuthenticator {
    /// Accept any well-formed `kind:id` token
    pub fn allow_all() -> Self {
        Self { allow: true }
    }

    /// Reject every token
    pub fn deny_all() -> Self {
        Self { allow: false }
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>> {
        if !self.allow {
            return Ok(None);
        }

        Ok(match token.split_once(':') {
            Some(("customer", id)) if !id.is_empty() => Some(Principal::customer(id)),
            Some(("worker", id)) if !id.is_empty() => Some(Principal::worker(id)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalKind;

    #[tokio::test]
    async fn test_static_tokens() {
        let mut grants = HashMap::new();
        grants.insert(
            "secret-w1".to_string(),
            TokenGrant {
                user_id: "w1".to_string(),
                kind: PrincipalKind::Worker,
            },
        );
        let auth = StaticTokenAuthenticator::new(grants);
        assert_eq!(auth.token_count(), 1);

        let principal = auth.authenticate("secret-w1").await.unwrap().unwrap();
        assert_eq!(principal, Principal::worker("w1"));

        assert!(auth.authenticate("nope").await.unwrap().is_none());
        assert!(auth.authenticate("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_authenticator() {
        let allow = MockAuthenticator::allow_all();
        assert_eq!(
            allow.authenticate("customer:c1").await.unwrap(),
            Some(Principal::customer("c1"))
        );
        assert!(allow.authenticate("admin:x").await.unwrap().is_none());
        assert!(allow.authenticate("worker:").await.unwrap().is_none());

        let deny = MockAuthenticator::deny_all();
        assert!(deny.authenticate("worker:w1").await.unwrap().is_none());
    }
}
