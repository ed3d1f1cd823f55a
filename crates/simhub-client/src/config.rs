// Client-side defaults.
use simhub_transport::TransportConfig;
use std::time::Duration;

pub(crate) const DEFAULT_INBOX_DEPTH: usize = 1024;
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// How long `login` waits for the broker's verdict.
    pub request_timeout: Duration,
    pub inbox_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inbox_depth: DEFAULT_INBOX_DEPTH,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `SIMHUB_CLIENT_REQUEST_TIMEOUT_MS` and
    /// `SIMHUB_CLIENT_INBOX_DEPTH`; unparsable or zero values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("SIMHUB_CLIENT_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
        {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(depth) = std::env::var("SIMHUB_CLIENT_INBOX_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            config.inbox_depth = depth;
        }
        config
    }
}
