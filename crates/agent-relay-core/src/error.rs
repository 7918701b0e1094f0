//! Error taxonomy shared by the relay and its HTTP surface.

use thiserror::Error;

/// Relay error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// No live connection for the addressed agent.
    #[error("No agent connection")]
    NoConnection,
    /// No response arrived before the deadline.
    #[error("Agent did not respond in time")]
    Timeout,
    /// The connection dropped while the request was in flight.
    #[error("Agent disconnected")]
    AgentDisconnected,
    /// The agent answered with an explicit failure.
    #[error("Agent error: {0}")]
    AgentError(String),
    /// A frame did not parse into any known message.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    /// The caller does not own the agent it addressed.
    #[error("Forbidden")]
    ForbiddenIdentity,
    /// No agent is registered under the given id.
    #[error("Agent not found")]
    UnknownIdentity,
    #[error("Agent ID is required")]
    MissingIdentity,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Expected WebSocket upgrade")]
    UpgradeRequired,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::MissingIdentity | Self::MalformedMessage(_) => 400,
            Self::Unauthorized => 401,
            Self::ForbiddenIdentity => 403,
            Self::UnknownIdentity => 404,
            Self::UpgradeRequired => 426,
            Self::NoConnection => 503,
            Self::Timeout | Self::AgentDisconnected | Self::AgentError(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether the caller may reasonably retry the same call later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoConnection | Self::Timeout)
    }
}
