use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("empty access token")]
    EmptyToken,
    #[error("unknown access token")]
    UnknownToken,
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token secret is not configured")]
    MissingSecret,
}

pub type AuthzResult<T> = Result<T, AuthzError>;
