//! Demo agent.
//!
//! Run with: cargo run -p relay-agent
//!
//! Environment:
//! - `RELAY_API_BASE_URL` (default `http://localhost:3000`)
//! - `RELAY_SESSION_COOKIE` cookie sent with the session lookup, if any
//! - `RUST_LOG` log filter (default `info`)

use std::path::PathBuf;

use agent_relay_connector::{AgentConnector, ConnectorConfig, ConnectorEvent, FnTool, ToolTable};
use agent_relay_core::{ToolError, ToolResult};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = std::env::var("RELAY_API_BASE_URL")
        .map_or_else(|_| ConnectorConfig::default(), ConnectorConfig::new);
    let cookie = std::env::var("RELAY_SESSION_COOKIE").ok();

    let connector = AgentConnector::with_http_auth(config, cookie, tools())?;
    let mut events = Box::pin(connector.events());

    if !connector.connect().await {
        tracing::warn!("Initial connection failed");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(ConnectorEvent::ReconnectExhausted) | None => break,
                Some(ConnectorEvent::Message(msg)) => tracing::debug!(kind = msg.kind(), "Relay message"),
                Some(event) => tracing::info!(?event, "Connector event"),
            },
        }
    }

    connector.disconnect().await;
    Ok(())
}

fn tools() -> ToolTable {
    ToolTable::new()
        .with_tool(
            "testTool",
            FnTool(|input: Value| async move {
                let message = input["message"].as_str().unwrap_or("Hello from agent");
                Ok::<_, ToolError>(ToolResult::text(format!("Test tool executed: {message}")).into_value())
            }),
        )
        .with_tool("listDirectory", FnTool(list_directory))
        .with_tool(
            "agentInfo",
            FnTool(|_: Value| async {
                Ok::<_, ToolError>(json!({
                    "content": [{
                        "type": "text",
                        "text": format!("{} {} ({})", std::env::consts::OS, std::env::consts::ARCH, env!("CARGO_PKG_VERSION")),
                    }]
                }))
            }),
        )
}

async fn list_directory(input: Value) -> Result<Value, ToolError> {
    let path = input["path"]
        .as_str()
        .map_or_else(|| PathBuf::from("."), PathBuf::from);

    let mut entries = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| ToolError::Failed(format!("{}: {e}", path.display())))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ToolError::Failed(e.to_string()))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    Ok(ToolResult::text(names.join("\n")).into_value())
}
