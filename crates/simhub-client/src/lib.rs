// Client library for the simhub broker.
//
// `Client` owns one transport connection and a reader task. The reader
// answers broker heartbeats (`ping` envelopes) on its own and forwards every
// other envelope to an inbox that `next_envelope` and `login` drain.
mod client;
mod config;
pub mod passport;

pub use client::Client;
pub use config::ClientConfig;
pub use passport::{CredentialExchange, PassportClient, Tokens};

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] simhub_transport::TransportError),
    #[error("envelope error: {0}")]
    Wire(#[from] simhub_wire::Error),
    #[error("broker rejected request: {0}")]
    Rejected(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for the broker")]
    Timeout,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("login failed: {0}")]
    Login(String),
}
