use crate::{AuthzError, AuthzResult, Principal, TokenVerifier};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimhubClaims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl SimhubClaims {
    pub fn principal(&self) -> Principal {
        let name = match self.username.as_deref() {
            Some(username) if !username.is_empty() => username,
            _ => self.sub.as_str(),
        };
        Principal::new(name)
    }
}

pub struct TokenIssuer {
    ttl: Duration,
    encoding_key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> AuthzResult<Self> {
        if secret.is_empty() {
            return Err(AuthzError::MissingSecret);
        }
        Ok(Self {
            ttl,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
        })
    }

    pub fn mint(&self, subject: &str, username: Option<&str>) -> AuthzResult<String> {
        let now = now_epoch_seconds();
        let claims = SimhubClaims {
            sub: subject.to_string(),
            exp: now + self.ttl.as_secs() as i64,
            iat: now,
            username: username.map(str::to_string),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(token)
    }
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> AuthzResult<Self> {
        if secret.is_empty() {
            return Err(AuthzError::MissingSecret);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn verify_blocking(&self, token: &str) -> AuthzResult<Principal> {
        if token.is_empty() {
            return Err(AuthzError::EmptyToken);
        }
        let data = jsonwebtoken::decode::<SimhubClaims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims.principal())
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> AuthzResult<Principal> {
        self.verify_blocking(token)
    }
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_verify_prefers_username() {
        let issuer = TokenIssuer::new("secret", Duration::from_secs(60)).expect("issuer");
        let verifier = JwtVerifier::new("secret").expect("verifier");

        let token = issuer.mint("id-7", Some("alice")).expect("mint");
        assert_eq!(verifier.verify_blocking(&token).expect("verify").name, "alice");

        let token = issuer.mint("id-7", None).expect("mint");
        assert_eq!(verifier.verify_blocking(&token).expect("verify").name, "id-7");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = TokenIssuer::new("secret", Duration::from_secs(60)).expect("issuer");
        let verifier = JwtVerifier::new("other").expect("verifier");
        let token = issuer.mint("alice", None).expect("mint");
        assert!(matches!(
            verifier.verify_blocking(&token),
            Err(AuthzError::Jwt(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = SimhubClaims {
            sub: "alice".to_string(),
            exp: now_epoch_seconds() - 120,
            iat: now_epoch_seconds() - 180,
            username: None,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .expect("encode");
        let verifier = JwtVerifier::new("secret").expect("verifier");
        let err = verifier.verify_blocking(&token).expect_err("expired");
        match err {
            AuthzError::Jwt(inner) => assert!(matches!(
                inner.kind(),
                jsonwebtoken::errors::ErrorKind::ExpiredSignature
            )),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn garbage_and_empty_tokens_are_rejected() {
        let verifier = JwtVerifier::new("secret").expect("verifier");
        assert!(matches!(
            verifier.verify_blocking(""),
            Err(AuthzError::EmptyToken)
        ));
        assert!(matches!(
            verifier.verify_blocking("not-a-jwt"),
            Err(AuthzError::Jwt(_))
        ));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(JwtVerifier::new(""), Err(AuthzError::MissingSecret)));
        assert!(matches!(
            TokenIssuer::new("", Duration::from_secs(1)),
            Err(AuthzError::MissingSecret)
        ));
    }
}
