//! Connector configuration.

use std::time::Duration;

use reqwest::Url;

use crate::error::ConnectorError;

/// Default pause before the first reconnection attempt; attempt `n` waits `n` times this.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default cap on consecutive reconnection attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default period of the application-level keepalive ping.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Base URL of the relay's HTTP API, e.g. `https://relay.example.com`.
    pub api_base_url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub keepalive_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl ConnectorConfig {
    /// Config pointing at `api_base_url` with default timings.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_interval.saturating_mul(attempt)
    }

    /// URL of an HTTP endpoint under the API base.
    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url.trim_end_matches('/'))
    }

    /// WebSocket URL the agent connects to: `ws(s)://host/api/browser/{id}/connect?token=…`.
    ///
    /// # Errors
    /// Returns error if the base URL does not parse or is not http(s).
    pub fn connect_url(&self, agent_id: &str, token: &str) -> Result<Url, ConnectorError> {
        let mut url = Url::parse(&self.api_url(&format!("/api/browser/{agent_id}/connect")))
            .map_err(|e| ConnectorError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(ConnectorError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| ConnectorError::InvalidUrl(format!("cannot switch to {scheme}")))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}
