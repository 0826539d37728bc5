//! Access token checks for user-scoped runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolves an access token to the user it was issued for
#[async_trait]
pub trait AccessTokenVerifier: Send + Sync {
    /// `None` when the token is unknown or no longer valid
    async fn resolve(&self, access_token: &str) -> Option<String>;
}

/// Fixed token table, filled by the embedding application
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue(&self, access_token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens
            .write()
            .await
            .insert(access_token.into(), user_id.into());
    }

    pub async fn revoke(&self, access_token: &str) -> bool {
        self.tokens.write().await.remove(access_token).is_some()
    }
}

#[async_trait]
impl AccessTokenVerifier for StaticTokenVerifier {
    async fn resolve(&self, access_token: &str) -> Option<String> {
        self.tokens.read().await.get(access_token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_resolve_revoke() {
        let verifier = StaticTokenVerifier::new();
        verifier.issue("tok-1", "alice").await;

        assert_eq!(verifier.resolve("tok-1").await.as_deref(), Some("alice"));
        assert_eq!(verifier.resolve("tok-2").await, None);

        assert!(verifier.revoke("tok-1").await);
        assert_eq!(verifier.resolve("tok-1").await, None);
    }
}
