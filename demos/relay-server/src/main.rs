//! Demo relay server.
//!
//! Run with: cargo run -p relay-server
//!
//! Environment:
//! - `RELAY_ADDR` (default `127.0.0.1:3000`)
//! - `RELAY_REQUEST_TIMEOUT_SECS` (default 30)
//! - `RELAY_DEMO_TOKEN` bearer token of the single demo user (default `demo-token`)
//! - `RUST_LOG` log filter (default `info`)
//!
//! Besides the relay endpoints it serves a toy auth backend
//! (`/api/auth/get-session`, `/api/browser/register`) so the demo agent can
//! sign in and register itself.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use agent_relay_core::Authenticator;
use agent_relay_session::{
    RelayConfig, SessionRegistry,
    storage::{MemoryAttachmentStore, MemoryDirectory},
};
use agent_relay_transport::{RelayState, create_router};
use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    routing::{get, post},
};
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_OWNER: &str = "demo-user";

#[derive(Clone)]
struct AuthState {
    directory: Arc<MemoryDirectory>,
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr: SocketAddr = std::env::var("RELAY_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
        .parse()
        .context("RELAY_ADDR is not a socket address")?;

    let mut config = RelayConfig::default();
    if let Ok(secs) = std::env::var("RELAY_REQUEST_TIMEOUT_SECS") {
        let secs: u64 = secs
            .parse()
            .context("RELAY_REQUEST_TIMEOUT_SECS is not a number")?;
        config.request_timeout = Duration::from_secs(secs);
    }

    let token = std::env::var("RELAY_DEMO_TOKEN").unwrap_or_else(|_| "demo-token".to_string());
    let directory = Arc::new(MemoryDirectory::new());
    directory.insert_token(token.clone(), DEMO_OWNER)?;

    let registry = Arc::new(SessionRegistry::new(
        config,
        Arc::new(MemoryAttachmentStore::new()),
    ));

    let auth = Router::new()
        .route("/api/auth/get-session", get(get_session))
        .route("/api/browser/register", post(register))
        .with_state(AuthState {
            directory: Arc::clone(&directory),
            token,
        });

    let app = create_router(RelayState::new(
        registry,
        directory.clone(),
        directory,
    ))
    .merge(auth);

    tracing::info!("Relay listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_session(State(state): State<AuthState>) -> Json<Value> {
    Json(json!({ "session": { "token": state.token } }))
}

async fn register(
    State(state): State<AuthState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let owner = state
        .directory
        .authenticate(token)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let agent_id = state
        .directory
        .register_agent(owner)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    tracing::info!(%agent_id, "Registered agent");
    Ok(Json(json!({ "browserId": agent_id })))
}
