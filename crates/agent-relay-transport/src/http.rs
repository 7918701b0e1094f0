//! HTTP surface of the relay: agent connect endpoint and caller invoke endpoint.

use std::sync::Arc;

use agent_relay_core::{AgentDirectory, Authenticator, OwnerId, RelayError};
use agent_relay_session::{ConnectionState, SessionRegistry};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection,
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::websocket::serve_connection;

/// Shared state of the relay's HTTP handlers.
#[derive(Clone)]
pub struct RelayState {
    /// Sessions, one per agent.
    pub registry: Arc<SessionRegistry>,
    /// Who owns which agent.
    pub directory: Arc<dyn AgentDirectory>,
    /// Who the caller is.
    pub authenticator: Arc<dyn Authenticator>,
}

impl RelayState {
    /// Create new relay state.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        directory: Arc<dyn AgentDirectory>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry,
            directory,
            authenticator,
        }
    }
}

/// Error rendered as `{"error": "..."}` with the matching status code.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Query parameters accepted by the relay endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    /// Bearer token; browsers cannot set headers on a WebSocket handshake.
    pub token: Option<String>,
}

/// Body of an invocation request.
#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub tool: String,
    #[serde(default = "empty_input")]
    pub input: Value,
}

fn empty_input() -> Value {
    json!({})
}

/// Connection status of one agent.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub connected: bool,
    pub pending_requests: usize,
    pub accepted_at: Option<i64>,
}

/// Create the relay router.
///
/// # Example
/// ```ignore
/// let app = create_router(RelayState::new(registry, directory, authenticator));
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn create_router(state: RelayState) -> Router {
    Router::new()
        .route("/api/browser/{agent_id}/connect", get(connect_handler))
        .route("/api/browser/{agent_id}/invoke", post(invoke_handler))
        .route("/api/browser/{agent_id}/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bearer_token<'a>(headers: &'a HeaderMap, query: &'a TokenQuery) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref())
}

/// Check that the caller owns `agent_id`.
async fn authorize(
    state: &RelayState,
    agent_id: &str,
    token: Option<&str>,
) -> Result<OwnerId, RelayError> {
    if agent_id.trim().is_empty() {
        return Err(RelayError::MissingIdentity);
    }
    let token = token.ok_or(RelayError::Unauthorized)?;
    let principal = state
        .authenticator
        .authenticate(token)
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .ok_or(RelayError::Unauthorized)?;
    let owner = state
        .directory
        .owner_of(agent_id)
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .ok_or(RelayError::UnknownIdentity)?;
    if owner != principal {
        tracing::warn!(agent_id, principal, "Rejected access to agent owned by another principal");
        return Err(RelayError::ForbiddenIdentity);
    }
    Ok(principal)
}

async fn connect_handler(
    State(state): State<RelayState>,
    Path(agent_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    authorize(&state, &agent_id, bearer_token(&headers, &query)).await?;
    let ws = ws.map_err(|_| RelayError::UpgradeRequired)?;

    let registry = Arc::clone(&state.registry);
    Ok(ws.on_upgrade(move |socket| serve_connection(socket, registry, agent_id)))
}

async fn invoke_handler(
    State(state): State<RelayState>,
    Path(agent_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(request): Json<InvokeRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &agent_id, bearer_token(&headers, &query)).await?;

    let result = state
        .registry
        .invoke(&agent_id, &request.tool, request.input)
        .await
        .inspect_err(|e| tracing::warn!(%agent_id, tool = %request.tool, "Invocation failed: {e}"))?;
    Ok(Json(result))
}

async fn status_handler(
    State(state): State<RelayState>,
    Path(agent_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<AgentStatus>, ApiError> {
    authorize(&state, &agent_id, bearer_token(&headers, &query)).await?;

    let status = match state.registry.get(&agent_id).await {
        Some(session) => {
            let attachment = session.attachment();
            AgentStatus {
                connected: session.state() == ConnectionState::Connected,
                pending_requests: session.pending_count(),
                accepted_at: attachment.map(|a| a.accepted_at),
            }
        }
        None => AgentStatus {
            connected: false,
            pending_requests: 0,
            accepted_at: None,
        },
    };
    Ok(Json(status))
}
