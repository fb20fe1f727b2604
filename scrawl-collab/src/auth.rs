//! Authentication collaborator.
//!
//! The engine does not own identity. Connections present an opaque token
//! with their join request; an [`Authenticator`] implementation verifies it
//! into a [`UserIdentity`] before the session touches any document. Real
//! deployments plug in their identity service; [`StaticTokens`] covers tests
//! and the demo server.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verified identity of a connected user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub name: String,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// Authentication errors.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// Token unknown, expired, or malformed.
    InvalidToken,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "Invalid authentication token"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Token verification hook, implemented outside the engine.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify `token` and resolve the identity behind it.
    async fn authenticate(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Fixed token table for tests and the demo server.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserIdentity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token resolving to a freshly minted user.
    pub fn with_token(mut self, token: impl Into<String>, name: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), UserIdentity::new(name));
        self
    }

    /// Register a token resolving to an explicit identity.
    pub fn insert(&mut self, token: impl Into<String>, user: UserIdentity) {
        self.tokens.insert(token.into(), user);
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, token: &str) -> Result<UserIdentity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tokens_accepts_known_token() {
        let auth = StaticTokens::new().with_token("secret", "Alice");
        let user = auth.authenticate("secret").await.unwrap();
        assert_eq!(user.name, "Alice");
    }

    #[tokio::test]
    async fn test_static_tokens_rejects_unknown_token() {
        let auth = StaticTokens::new().with_token("secret", "Alice");
        assert!(auth.authenticate("wrong").await.is_err());
    }

    #[tokio::test]
    async fn test_static_tokens_explicit_identity() {
        let user = UserIdentity {
            user_id: Uuid::from_u128(7),
            name: "Bob".to_string(),
        };
        let mut auth = StaticTokens::new();
        auth.insert("tok", user.clone());

        let resolved = auth.authenticate("tok").await.unwrap();
        assert_eq!(resolved, user);
    }
}
