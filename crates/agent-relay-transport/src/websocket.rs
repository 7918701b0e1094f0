//! WebSocket pump between an accepted agent socket and its session.

use std::sync::Arc;

use agent_relay_core::Outgoing;
use agent_relay_session::{Accepted, SessionRegistry};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};

/// Accept `socket` as the connection of `agent_id` and serve it until it
/// closes.
///
/// A writer task drains the connection's outgoing queue into the socket; the
/// current task feeds inbound frames to the session. When the socket ends the
/// registry is told, which fails the session's pending requests if this was
/// still its current connection.
pub async fn serve_connection(socket: WebSocket, registry: Arc<SessionRegistry>, agent_id: String) {
    let (session, Accepted { handle, mut outgoing }) = registry.accept(&agent_id).await;
    let connection_id = handle.id();
    // Only the session keeps a sender, so the writer stops once it lets go.
    drop(handle);

    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            match frame {
                Outgoing::Message(msg) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(j) => j,
                        Err(e) => {
                            tracing::error!("Failed to serialize message: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut reason = String::from("connection lost");
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_inbound(connection_id, text.as_str()),
            Ok(Message::Binary(data)) => {
                session.handle_inbound(connection_id, &String::from_utf8_lossy(&data));
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    reason = format!("{} {}", frame.code, frame.reason.as_str());
                }
                break;
            }
            // Protocol-level ping/pong is answered by the socket itself.
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%agent_id, %connection_id, "WebSocket error: {e}");
                reason = e.to_string();
                break;
            }
        }
    }

    registry
        .connection_closed(&session, connection_id, &reason)
        .await;
    send_task.abort();

    tracing::info!(%agent_id, %connection_id, "WebSocket disconnected");
}
