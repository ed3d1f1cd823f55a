//! simhub broker service library crate.
//!
//! # Purpose
//! Exposes the broker's service layer (configuration, observability, the
//! per-connection session loops and the TCP accept loop) for the
//! `simhub-broker` binary and integration tests.
//!
//! # Notes
//! Routing and authentication live in `simhub-broker` and `simhub-authz`;
//! this crate only wires them to sockets and the process environment.
pub mod config;
pub mod observability;
pub mod server;
pub mod session;

pub use server::RunningBroker;

#[cfg(test)]
// Test utilities live alongside the library for reuse across unit tests.
mod test_support;
