//! Connector error types.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Connector error.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// No session token is available.
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Identity store error: {0}")]
    Identity(String),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),
}

impl ConnectorError {
    /// Whether the failure happened at the WebSocket handshake, after
    /// credentials and identity were resolved.
    #[must_use]
    pub const fn is_handshake(&self) -> bool {
        matches!(self, Self::WebSocket(_))
    }
}

impl From<tungstenite::Error> for ConnectorError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        Self::Identity(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Identity(err.to_string())
    }
}
