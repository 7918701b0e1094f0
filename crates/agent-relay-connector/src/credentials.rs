//! Session credentials and agent registration.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE};
use serde::Deserialize;
use serde_json::json;

use crate::{config::ConnectorConfig, error::ConnectorError};

/// Source of the user's session token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current session token, or `None` if the user is signed out.
    async fn session_token(&self) -> Result<Option<String>, ConnectorError>;
}

/// Registers this agent with the relay's backend and returns its new id.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, token: &str) -> Result<String, ConnectorError>;
}

/// Credential provider with a fixed token.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<String>);

impl StaticCredentials {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn session_token(&self) -> Result<Option<String>, ConnectorError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session: Option<SessionBody>,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    browser_id: String,
}

/// Client for the relay backend's auth endpoints.
///
/// - `GET {base}/api/auth/get-session` yields `{"session": {"token": ...}}`
/// - `POST {base}/api/browser/register` yields `{"browserId": ...}`
#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    client: reqwest::Client,
    session_url: String,
    register_url: String,
    session_cookie: Option<String>,
}

impl HttpAuthClient {
    /// Create a client for the API under `config.api_base_url`.
    #[must_use]
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            session_url: config.api_url("/api/auth/get-session"),
            register_url: config.api_url("/api/browser/register"),
            session_cookie: None,
        }
    }

    /// Send `cookie` with the session lookup, as a signed-in browser would.
    #[must_use]
    pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.session_cookie = Some(cookie.into());
        self
    }
}

#[async_trait]
impl CredentialProvider for HttpAuthClient {
    async fn session_token(&self) -> Result<Option<String>, ConnectorError> {
        let mut request = self.client.get(&self.session_url);
        if let Some(cookie) = &self.session_cookie {
            request = request.header(COOKIE, cookie);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "Session lookup failed");
            return Ok(None);
        }
        let body: SessionResponse = response.json().await?;
        Ok(body.session.and_then(|s| s.token))
    }
}

#[async_trait]
impl Registrar for HttpAuthClient {
    async fn register(&self, token: &str) -> Result<String, ConnectorError> {
        let response = self
            .client
            .post(&self.register_url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(&json!({}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::Registration(format!("status {status}")));
        }
        let body: RegisterResponse = response.json().await?;
        tracing::info!(agent_id = %body.browser_id, "Registered agent");
        Ok(body.browser_id)
    }
}
