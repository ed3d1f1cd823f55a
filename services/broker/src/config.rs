use anyhow::{Context, Result};
use serde::Deserialize;
use simhub_broker::HubConfig;
use simhub_transport::TransportConfig;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use crate::session::SessionConfig;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // TCP listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener; disabled when unset.
    pub metrics_bind: Option<SocketAddr>,
    // HS256 secret used to verify login tokens.
    pub token_secret: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub login_timeout_ms: u64,
    pub ack_retry_interval_ms: u64,
    // Total transmissions of an ack-requested message.
    pub ack_max_attempts: u32,
    // Largest reassembled message accepted from a peer.
    pub max_message_bytes: usize,
    pub inbound_queue_depth: usize,
    pub outbound_queue_depth: usize,
}

const DEFAULT_BIND: &str = "0.0.0.0:9000";
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PONG_TIMEOUT_MS: u64 = 40_000;
const DEFAULT_LOGIN_TIMEOUT_MS: u64 = 50_000;
const DEFAULT_ACK_RETRY_INTERVAL_MS: u64 = 10_000;
const DEFAULT_ACK_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    token_secret: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    pong_timeout_ms: Option<u64>,
    login_timeout_ms: Option<u64>,
    ack_retry_interval_ms: Option<u64>,
    ack_max_attempts: Option<u32>,
    max_message_bytes: Option<usize>,
    inbound_queue_depth: Option<usize>,
    outbound_queue_depth: Option<usize>,
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let bind = std::env::var("SIMHUB_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse SIMHUB_BIND")?;
        let metrics_bind = match std::env::var("SIMHUB_METRICS_BIND") {
            Ok(value) => Some(
                value
                    .parse()
                    .with_context(|| "parse SIMHUB_METRICS_BIND")?,
            ),
            Err(_) => None,
        };
        let token_secret = std::env::var("SIMHUB_TOKEN_SECRET")
            .ok()
            .filter(|value| !value.is_empty());
        Ok(Self {
            bind,
            metrics_bind,
            token_secret,
            heartbeat_interval_ms: env_positive("SIMHUB_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            pong_timeout_ms: env_positive("SIMHUB_PONG_TIMEOUT_MS")
                .unwrap_or(DEFAULT_PONG_TIMEOUT_MS),
            login_timeout_ms: env_positive("SIMHUB_LOGIN_TIMEOUT_MS")
                .unwrap_or(DEFAULT_LOGIN_TIMEOUT_MS),
            ack_retry_interval_ms: env_positive("SIMHUB_ACK_RETRY_INTERVAL_MS")
                .unwrap_or(DEFAULT_ACK_RETRY_INTERVAL_MS),
            ack_max_attempts: env_positive("SIMHUB_ACK_MAX_ATTEMPTS")
                .unwrap_or(DEFAULT_ACK_MAX_ATTEMPTS),
            max_message_bytes: env_positive("SIMHUB_MAX_MESSAGE_BYTES")
                .unwrap_or(simhub_wire::DEFAULT_MAX_MESSAGE_BYTES),
            inbound_queue_depth: env_positive("SIMHUB_INBOUND_QUEUE_DEPTH")
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
            outbound_queue_depth: env_positive("SIMHUB_OUTBOUND_QUEUE_DEPTH")
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("SIMHUB_BROKER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read SIMHUB_BROKER_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: BrokerConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse broker config yaml")?;
        if let Some(value) = override_cfg.bind {
            self.bind = value.parse().with_context(|| "parse bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = Some(value.parse().with_context(|| "parse metrics_bind")?);
        }
        if let Some(value) = override_cfg.token_secret {
            self.token_secret = Some(value);
        }
        if let Some(value) = override_cfg.heartbeat_interval_ms
            && value > 0
        {
            self.heartbeat_interval_ms = value;
        }
        if let Some(value) = override_cfg.pong_timeout_ms
            && value > 0
        {
            self.pong_timeout_ms = value;
        }
        if let Some(value) = override_cfg.login_timeout_ms
            && value > 0
        {
            self.login_timeout_ms = value;
        }
        if let Some(value) = override_cfg.ack_retry_interval_ms
            && value > 0
        {
            self.ack_retry_interval_ms = value;
        }
        if let Some(value) = override_cfg.ack_max_attempts
            && value > 0
        {
            self.ack_max_attempts = value;
        }
        if let Some(value) = override_cfg.max_message_bytes
            && value > 0
        {
            self.max_message_bytes = value;
        }
        if let Some(value) = override_cfg.inbound_queue_depth
            && value > 0
        {
            self.inbound_queue_depth = value;
        }
        if let Some(value) = override_cfg.outbound_queue_depth
            && value > 0
        {
            self.outbound_queue_depth = value;
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_message_bytes: self.max_message_bytes,
            ack_retry_interval: Duration::from_millis(self.ack_retry_interval_ms),
            ack_max_attempts: self.ack_max_attempts,
            ..TransportConfig::default()
        }
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            inbound_queue_depth: self.inbound_queue_depth,
            outbound_queue_depth: self.outbound_queue_depth,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            login_timeout: Duration::from_millis(self.login_timeout_ms),
        }
    }
}
