//! Per-agent session: one live connection, many in-flight requests.
//!
//! Connection sub-state:
//! `Disconnected -> accept -> Connected -> accept -> Connected (old handle closed first)`,
//! `Connected -> close of the current handle -> Disconnected`.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use agent_relay_core::{
    AgentId, AgentMessage, Outgoing, RelayError, RelayMessage,
    protocol::CLOSE_SUPERSEDED,
};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{pending::PendingTable, storage::ConnectionAttachment};

/// Outgoing frame queue of a connection.
pub type OutgoingRx = mpsc::UnboundedReceiver<Outgoing<RelayMessage>>;

/// Handle to the single live connection of a session.
///
/// Frames pushed here are written to the socket by the transport's writer
/// task. The handle is open until that task drops its receiver.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    attachment: ConnectionAttachment,
    tx: mpsc::UnboundedSender<Outgoing<RelayMessage>>,
}

impl ConnectionHandle {
    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.attachment.connection_id
    }

    /// Metadata recorded at accept time.
    #[must_use]
    pub const fn attachment(&self) -> &ConnectionAttachment {
        &self.attachment
    }

    /// Whether the writer side is still attached.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a message. Returns `false` if the connection is gone.
    pub fn send(&self, msg: RelayMessage) -> bool {
        self.tx.send(Outgoing::Message(msg)).is_ok()
    }

    /// Queue a close frame. Returns `false` if the connection is gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Outgoing::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// A newly installed connection and the queue its writer must drain.
#[derive(Debug)]
pub struct Accepted {
    pub handle: ConnectionHandle,
    pub outgoing: OutgoingRx,
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Relay state for one agent identity.
pub struct Session {
    agent_id: AgentId,
    request_timeout: Duration,
    connection: Mutex<Option<ConnectionHandle>>,
    pending: Arc<PendingTable>,
}

impl Session {
    /// Create a disconnected session.
    #[must_use]
    pub fn new(agent_id: impl Into<AgentId>, request_timeout: Duration) -> Self {
        Self {
            agent_id: agent_id.into(),
            request_timeout,
            connection: Mutex::new(None),
            pending: PendingTable::new(),
        }
    }

    /// Agent this session relays to.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a new connection for this agent.
    ///
    /// An open connection is closed with [`CLOSE_SUPERSEDED`] and its pending
    /// requests rejected with [`RelayError::AgentDisconnected`] before the new
    /// one becomes current.
    pub fn accept(&self) -> Accepted {
        let accepted = self.install(ConnectionAttachment::new(self.agent_id.clone()));
        accepted
            .handle
            .send(RelayMessage::hello("Connected to relay"));
        accepted
    }

    /// Reinstall a connection from its persisted attachment after the process
    /// was resumed, without re-running the accept handshake.
    ///
    /// The pending table is not restored; requests in flight before the
    /// suspension are lost.
    pub fn rehydrate(&self, attachment: ConnectionAttachment) -> Accepted {
        tracing::info!(
            agent_id = %self.agent_id,
            connection_id = %attachment.connection_id,
            accepted_at = attachment.accepted_at,
            "Rehydrated connection from attachment"
        );
        self.install(attachment)
    }

    fn install(&self, attachment: ConnectionAttachment) -> Accepted {
        let (tx, outgoing) = mpsc::unbounded_channel();
        let handle = ConnectionHandle { attachment, tx };

        let mut current = self.lock_connection();
        if let Some(old) = current.take() {
            old.close(CLOSE_SUPERSEDED, "Replaced by new connection");
            let rejected = self.pending.reject_all(&RelayError::AgentDisconnected);
            tracing::info!(
                agent_id = %self.agent_id,
                old_connection_id = %old.id(),
                new_connection_id = %handle.id(),
                rejected,
                "Superseded existing connection"
            );
        } else {
            tracing::info!(
                agent_id = %self.agent_id,
                connection_id = %handle.id(),
                "Accepted connection"
            );
        }
        *current = Some(handle.clone());

        Accepted { handle, outgoing }
    }

    /// Run `tool` on the agent and wait for its result.
    ///
    /// # Errors
    /// - [`RelayError::NoConnection`] immediately if no connection is open.
    /// - [`RelayError::Timeout`] if no response arrives before the deadline.
    /// - [`RelayError::AgentDisconnected`] if the connection drops first.
    /// - [`RelayError::AgentError`] if the agent reports a failure.
    pub async fn invoke(&self, tool: &str, input: Value) -> Result<Value, RelayError> {
        // Register and send under the connection lock so a concurrent close
        // cannot slip between the two and leave the entry orphaned.
        let (request_id, rx) = {
            let current = self.lock_connection();
            let handle = current
                .as_ref()
                .filter(|h| h.is_open())
                .ok_or(RelayError::NoConnection)?;

            let (request_id, rx) = self.pending.register(self.request_timeout);
            let msg = RelayMessage::ToolExecution {
                request_id: request_id.clone(),
                tool: tool.to_string(),
                input,
            };
            if !handle.send(msg) {
                self.pending
                    .resolve(&request_id, Err(RelayError::AgentDisconnected));
                return Err(RelayError::AgentDisconnected);
            }
            (request_id, rx)
        };

        tracing::debug!(agent_id = %self.agent_id, %request_id, tool, "Dispatched tool execution");

        rx.await.unwrap_or(Err(RelayError::AgentDisconnected))
    }

    /// Handle a raw frame received on `connection_id`.
    ///
    /// Frames from a connection that is no longer current are ignored.
    /// Malformed frames are answered with an `error` message; the session is
    /// unaffected.
    pub fn handle_inbound(&self, connection_id: Uuid, raw: &str) {
        let Some(handle) = self.current_if(connection_id) else {
            tracing::debug!(agent_id = %self.agent_id, %connection_id, "Ignoring frame from stale connection");
            return;
        };

        let msg = match serde_json::from_str::<AgentMessage>(raw) {
            Ok(msg) => msg,
            Err(e) => {
                let error = RelayError::MalformedMessage(e.to_string());
                tracing::warn!(agent_id = %self.agent_id, "{error}");
                handle.send(RelayMessage::error(format!("Invalid message: {e}")));
                return;
            }
        };

        match msg {
            AgentMessage::ToolResponse {
                request_id,
                result,
                error,
            } => {
                let outcome = match error {
                    Some(failure) => Err(RelayError::AgentError(failure.message)),
                    None => Ok(result),
                };
                if self.pending.resolve(&request_id, outcome) {
                    tracing::debug!(agent_id = %self.agent_id, %request_id, "Resolved tool execution");
                } else {
                    // Timed out or already settled; expected race.
                    tracing::debug!(agent_id = %self.agent_id, %request_id, "Dropping response for unknown request");
                }
            }
            AgentMessage::Ping { timestamp } => {
                handle.send(RelayMessage::Pong { timestamp });
            }
            AgentMessage::Pong { .. } => {}
        }
    }

    /// Handle the close of `connection_id`.
    ///
    /// Only the current connection counts: pending requests are rejected with
    /// [`RelayError::AgentDisconnected`] and the session becomes disconnected.
    /// Returns `false` (and does nothing) for any other connection.
    pub fn handle_closed(&self, connection_id: Uuid, reason: &str) -> bool {
        let mut current = self.lock_connection();
        if current.as_ref().map(ConnectionHandle::id) != Some(connection_id) {
            return false;
        }
        current.take();
        let rejected = self.pending.reject_all(&RelayError::AgentDisconnected);
        drop(current);

        tracing::info!(
            agent_id = %self.agent_id,
            %connection_id,
            reason,
            rejected,
            "Agent connection closed"
        );
        true
    }

    fn current_if(&self, connection_id: Uuid) -> Option<ConnectionHandle> {
        self.lock_connection()
            .as_ref()
            .filter(|h| h.id() == connection_id)
            .cloned()
    }

    /// Current connection state.
    ///
    /// A handle whose writer has gone away counts as disconnected, so this
    /// agrees with what [`Session::invoke`] would do.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.lock_connection().as_ref().is_some_and(ConnectionHandle::is_open) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Attachment of the current open connection, if any.
    #[must_use]
    pub fn attachment(&self) -> Option<ConnectionAttachment> {
        self.lock_connection()
            .as_ref()
            .filter(|h| h.is_open())
            .map(|h| h.attachment().clone())
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(30);

    async fn next_execution(outgoing: &mut OutgoingRx) -> (String, String, Value) {
        loop {
            match outgoing.recv().await.expect("connection queue closed") {
                Outgoing::Message(RelayMessage::ToolExecution {
                    request_id,
                    tool,
                    input,
                }) => return (request_id, tool, input),
                Outgoing::Message(_) => continue,
                Outgoing::Close { code, .. } => panic!("unexpected close {code}"),
            }
        }
    }

    fn response(request_id: &str, result: &Value) -> String {
        json!({"type": "tool-response", "requestId": request_id, "result": result}).to_string()
    }

    #[tokio::test]
    async fn test_invoke_without_connection_fails_fast() {
        let session = Session::new("agent-1", TIMEOUT);
        let result = session.invoke("listTabs", json!({})).await;
        assert_eq!(result, Err(RelayError::NoConnection));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_accept_greets_agent() {
        let session = Session::new("agent-1", TIMEOUT);
        let mut accepted = session.accept();
        match accepted.outgoing.recv().await {
            Some(Outgoing::Message(RelayMessage::Hello { .. })) => {}
            other => panic!("expected hello, got {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(
            session.attachment().map(|a| a.connection_id),
            Some(accepted.handle.id())
        );
    }

    #[tokio::test]
    async fn test_round_trip() {
        let session = Arc::new(Session::new("agent-1", TIMEOUT));
        let Accepted {
            handle,
            mut outgoing,
        } = session.accept();

        let caller = Arc::clone(&session);
        let call = tokio::spawn(async move { caller.invoke("testTool", json!({})).await });

        let (request_id, tool, input) = next_execution(&mut outgoing).await;
        assert_eq!(tool, "testTool");
        assert_eq!(input, json!({}));

        let expected = json!({"content": [{"type": "text", "text": "ok"}]});
        session.handle_inbound(handle.id(), &response(&request_id, &expected));

        assert_eq!(call.await.unwrap(), Ok(expected));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_invocations_resolve_out_of_order() {
        let session = Arc::new(Session::new("agent-1", TIMEOUT));
        let Accepted {
            handle,
            mut outgoing,
        } = session.accept();

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let caller = Arc::clone(&session);
                tokio::spawn(async move { caller.invoke("echo", json!({ "n": i })).await })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(next_execution(&mut outgoing).await);
        }
        let ids: std::collections::HashSet<_> = requests.iter().map(|r| r.0.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(session.pending_count(), 3);

        // Answer in reverse order, echoing each input.
        for (request_id, _, input) in requests.iter().rev() {
            session.handle_inbound(handle.id(), &response(request_id, input));
        }

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap(), Ok(json!({ "n": i })));
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_all_pending() {
        let session = Arc::new(Session::new("agent-1", TIMEOUT));
        let Accepted {
            handle,
            mut outgoing,
        } = session.accept();

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let caller = Arc::clone(&session);
                tokio::spawn(async move { caller.invoke("listTabs", json!({})).await })
            })
            .collect();
        for _ in 0..4 {
            next_execution(&mut outgoing).await;
        }

        assert!(session.handle_closed(handle.id(), "going away"));
        for call in calls {
            assert_eq!(call.await.unwrap(), Err(RelayError::AgentDisconnected));
        }
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            session.invoke("listTabs", json!({})).await,
            Err(RelayError::NoConnection)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_ignored() {
        let session = Arc::new(Session::new("agent-1", TIMEOUT));
        let Accepted {
            handle,
            mut outgoing,
        } = session.accept();

        let result = session.invoke("captureScreenshot", json!({})).await;
        assert_eq!(result, Err(RelayError::Timeout));
        assert_eq!(session.pending_count(), 0);

        let (request_id, _, _) = next_execution(&mut outgoing).await;
        session.handle_inbound(handle.id(), &response(&request_id, &json!({"late": true})));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_connection() {
        let session = Arc::new(Session::new("agent-1", TIMEOUT));
        let Accepted {
            handle: first,
            outgoing: mut first_out,
        } = session.accept();

        let caller = Arc::clone(&session);
        let in_flight = tokio::spawn(async move { caller.invoke("listTabs", json!({})).await });
        next_execution(&mut first_out).await;

        let second = session.accept();

        // The old handle was told to close before the new one took over.
        match first_out.recv().await {
            Some(Outgoing::Close { code, .. }) => assert_eq!(code, CLOSE_SUPERSEDED),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(in_flight.await.unwrap(), Err(RelayError::AgentDisconnected));
        assert_ne!(first.id(), second.handle.id());

        // The superseded socket closing later does not tear down the new one.
        assert!(!session.handle_closed(first.id(), "superseded"));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(
            session.attachment().map(|a| a.connection_id),
            Some(second.handle.id())
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session_alive() {
        let session = Arc::new(Session::new("agent-1", TIMEOUT));
        let Accepted {
            handle,
            mut outgoing,
        } = session.accept();

        session.handle_inbound(handle.id(), "not json at all {");
        session.handle_inbound(handle.id(), r#"{"type":"launch-missiles"}"#);

        let mut errors = 0;
        while errors < 2 {
            if let Some(Outgoing::Message(RelayMessage::Error { message })) = outgoing.recv().await {
                assert!(message.starts_with("Invalid message"));
                errors += 1;
            }
        }

        let caller = Arc::clone(&session);
        let call = tokio::spawn(async move { caller.invoke("testTool", json!({})).await });
        let (request_id, _, _) = next_execution(&mut outgoing).await;
        session.handle_inbound(handle.id(), &response(&request_id, &json!("ok")));
        assert_eq!(call.await.unwrap(), Ok(json!("ok")));
    }

    #[tokio::test]
    async fn test_agent_error_and_keepalive() {
        let session = Arc::new(Session::new("agent-1", TIMEOUT));
        let Accepted {
            handle,
            mut outgoing,
        } = session.accept();

        session.handle_inbound(handle.id(), r#"{"type":"ping","timestamp":42}"#);
        loop {
            if let Some(Outgoing::Message(RelayMessage::Pong { timestamp })) = outgoing.recv().await {
                assert_eq!(timestamp, Some(42));
                break;
            }
        }

        let caller = Arc::clone(&session);
        let call = tokio::spawn(async move { caller.invoke("runJavascript", json!({"code": "1"})).await });
        let (request_id, _, _) = next_execution(&mut outgoing).await;
        let raw = json!({
            "type": "tool-response",
            "requestId": request_id,
            "error": {"message": "tab crashed"}
        })
        .to_string();
        session.handle_inbound(handle.id(), &raw);
        assert_eq!(
            call.await.unwrap(),
            Err(RelayError::AgentError("tab crashed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_writer_gone_counts_as_no_connection() {
        let session = Session::new("agent-1", TIMEOUT);
        let accepted = session.accept();
        assert_eq!(session.state(), ConnectionState::Connected);
        drop(accepted.outgoing);

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.attachment(), None);
        assert_eq!(
            session.invoke("listTabs", json!({})).await,
            Err(RelayError::NoConnection)
        );
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rehydrate_restores_attachment_only() {
        let session = Session::new("agent-1", TIMEOUT);
        let attachment = ConnectionAttachment::new("agent-1");
        let accepted = session.rehydrate(attachment.clone());

        assert_eq!(accepted.handle.id(), attachment.connection_id);
        assert_eq!(session.attachment(), Some(attachment));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.state(), ConnectionState::Connected);
    }
}
