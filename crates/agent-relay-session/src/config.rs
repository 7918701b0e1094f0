//! Relay configuration.

use std::time::Duration;

/// Default deadline for a tool execution.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long an invocation waits for the agent's response.
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}
