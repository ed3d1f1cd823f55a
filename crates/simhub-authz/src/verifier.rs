use crate::{AuthzError, AuthzResult};
use async_trait::async_trait;
use std::collections::HashMap;

/// Authenticated identity attached to a session after login.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> AuthzResult<Principal>;
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Principal>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, name: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), Principal::new(name));
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokens {
    async fn verify(&self, token: &str) -> AuthzResult<Principal> {
        if token.is_empty() {
            return Err(AuthzError::EmptyToken);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthzError::UnknownToken)
    }
}
