//! Username/password exchange for broker access tokens.
//!
//! The passport service is an HTTP endpoint outside the broker. Clients call
//! it once, then present the returned access token in their `login` envelope.
//! Passwords never leave the process in clear text: only the lowercase hex
//! SHA-256 digest is posted.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ClientError, Result};

const SUCCESS_CODE: &str = "Success";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
}

#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<Tokens>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    code: String,
    #[serde(default)]
    msg: String,
    data: Option<Tokens>,
}

#[derive(Debug, Clone)]
pub struct PassportClient {
    base_url: String,
    client: reqwest::Client,
}

impl PassportClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialExchange for PassportClient {
    async fn login(&self, username: &str, password: &str) -> Result<Tokens> {
        let request = LoginRequest {
            username,
            password: password_digest(password),
        };
        let response: LoginResponse = self
            .client
            .post(format!("{}/login", self.base_url))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if response.code != SUCCESS_CODE {
            return Err(ClientError::Login(response.msg));
        }
        let tokens = response
            .data
            .ok_or_else(|| ClientError::Login("response carried no tokens".to_string()))?;
        tracing::debug!(username, "passport login succeeded");
        Ok(tokens)
    }
}

fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
