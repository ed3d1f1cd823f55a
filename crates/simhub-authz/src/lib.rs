//! Token verification for simhub sessions.
//!
//! # Purpose
//! The broker gates subscribe/publish behind a `login` carrying an opaque
//! access token. This crate turns that token into a [`Principal`].
//!
//! # How it fits
//! The hub holds an `Arc<dyn TokenVerifier>`; production wiring uses
//! [`JwtVerifier`] keyed by a shared secret, tests and local tooling use
//! [`StaticTokens`] or mint tokens with [`TokenIssuer`].
//!
//! # Key invariants
//! - Tokens are HS256 JWTs with a mandatory `exp` claim.
//! - The principal name is the `username` claim when present, else `sub`.
//! - Empty tokens never verify.
//!
//! # Examples
//! ```rust
//! use simhub_authz::{JwtVerifier, TokenIssuer};
//! use std::time::Duration;
//!
//! let issuer = TokenIssuer::new("dev-secret", Duration::from_secs(60)).expect("issuer");
//! let token = issuer.mint("user-1", Some("alice")).expect("mint");
//! let verifier = JwtVerifier::new("dev-secret").expect("verifier");
//! assert_eq!(verifier.verify_blocking(&token).expect("verify").name, "alice");
//! ```

mod errors;
mod token;
mod verifier;

pub use errors::{AuthzError, AuthzResult};
pub use token::{JwtVerifier, SimhubClaims, TokenIssuer};
pub use verifier::{Principal, StaticTokens, TokenVerifier};
