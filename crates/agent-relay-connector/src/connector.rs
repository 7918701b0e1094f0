//! Outbound connection from an agent to the relay.
//!
//! One supervisor task owns the connection lifecycle:
//! `serve -> (closed) -> reconnect attempt 1..=max -> serve -> ...`.
//! A deliberate [`AgentConnector::disconnect`] stops it at whichever point
//! it is in; exhausting the attempts stops it with
//! [`ConnectorEvent::ReconnectExhausted`].

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use agent_relay_core::{AgentMessage, RelayMessage, protocol::CLOSE_NORMAL};
use futures::{SinkExt, Stream, StreamExt, stream::SplitStream};
use tokio::{
    net::TcpStream,
    sync::{Notify, broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message, Utf8Bytes,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::{
    config::ConnectorConfig,
    credentials::{CredentialProvider, HttpAuthClient, Registrar},
    dispatch::ToolTable,
    error::ConnectorError,
    identity::{FileIdentityStore, IdentityStore, resolve_identity},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 64;

/// Reported when the socket ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

const DISCONNECT_REASON: &str = "Client disconnecting";

/// How long `disconnect` waits for the close handshake.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle and traffic notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Connected { agent_id: String },
    Disconnected { code: u16, reason: String },
    /// A relay message that passed the allow-list.
    Message(RelayMessage),
    Error(String),
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted,
}

struct Inner {
    config: ConnectorConfig,
    credentials: Arc<dyn CredentialProvider>,
    registrar: Arc<dyn Registrar>,
    identity: Arc<dyn IdentityStore>,
    tools: ToolTable,
    agent_id: Mutex<Option<String>>,
    /// Writer queue of the live connection; `Some` exactly while connected.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    intentional_close: AtomicBool,
    events: broadcast::Sender<ConnectorEvent>,
}

/// A connection that completed its handshake.
struct Live {
    stream: SplitStream<WsStream>,
    writer: JoinHandle<()>,
}

/// A running supervisor task and the signal that cuts its reconnect wait
/// short.
///
/// The signal is per task so a wakeup left unconsumed by one supervisor
/// cannot cancel the next one's wait.
struct Supervisor {
    task: JoinHandle<()>,
    cancel: Arc<Notify>,
}

/// Agent-side connector.
pub struct AgentConnector {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl AgentConnector {
    /// Create a disconnected connector.
    #[must_use]
    pub fn new(
        config: ConnectorConfig,
        credentials: Arc<dyn CredentialProvider>,
        registrar: Arc<dyn Registrar>,
        identity: Arc<dyn IdentityStore>,
        tools: ToolTable,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                registrar,
                identity,
                tools,
                agent_id: Mutex::new(None),
                outgoing: Mutex::new(None),
                intentional_close: AtomicBool::new(false),
                events,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Connector that authenticates against the relay backend over HTTP and
    /// keeps its identity in the platform config directory.
    ///
    /// # Errors
    /// Returns error if the platform has no config directory.
    pub fn with_http_auth(
        config: ConnectorConfig,
        session_cookie: Option<String>,
        tools: ToolTable,
    ) -> Result<Self, ConnectorError> {
        let mut auth = HttpAuthClient::new(&config);
        if let Some(cookie) = session_cookie {
            auth = auth.with_session_cookie(cookie);
        }
        let auth = Arc::new(auth);
        let identity = Arc::new(FileIdentityStore::default_location()?);
        Ok(Self::new(config, auth.clone(), auth, identity, tools))
    }

    /// Open the connection.
    ///
    /// Returns `true` once the handshake succeeded (or a connection is
    /// already open). Missing credentials or a failed registration return
    /// `false` with nothing scheduled; a failed handshake returns `false`
    /// and schedules reconnection.
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        self.stop_supervisor();
        self.inner.intentional_close.store(false, Ordering::SeqCst);

        match self.inner.establish().await {
            Ok(ws) => {
                let live = self.inner.attach(ws);
                self.start_supervisor(Some(live));
                true
            }
            Err(e) => {
                tracing::warn!("Failed to connect to relay: {e}");
                let handshake = e.is_handshake();
                self.inner.emit(ConnectorEvent::Error(e.to_string()));
                if handshake {
                    self.start_supervisor(None);
                }
                false
            }
        }
    }

    /// Close the connection on purpose and cancel any scheduled reconnect.
    pub async fn disconnect(&self) {
        self.inner.intentional_close.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.lock_supervisor().as_ref() {
            // Stores a permit if the task is not waiting yet.
            supervisor.cancel.notify_one();
        }
        if let Some(tx) = self.inner.lock_outgoing().as_ref() {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static(DISCONNECT_REASON),
            })));
        }

        let supervisor = self.lock_supervisor().take();
        if let Some(Supervisor { mut task, .. }) = supervisor {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                tracing::warn!("Relay did not complete the close handshake; dropping connection");
                task.abort();
                self.inner.lock_outgoing().take();
            }
        }
    }

    /// Whether a connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock_outgoing().is_some()
    }

    /// Agent id, once resolved by a connection attempt.
    #[must_use]
    pub fn agent_id(&self) -> Option<String> {
        self.inner
            .agent_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send a message to the relay. Returns `false` when not connected.
    pub fn send(&self, msg: &AgentMessage) -> bool {
        self.inner.send(msg)
    }

    /// Subscribe to connector events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.inner.events.subscribe()
    }

    /// Connector events as a stream. Events missed by a slow consumer are
    /// skipped.
    pub fn events(&self) -> impl Stream<Item = ConnectorEvent> + use<> {
        tokio_stream::StreamExt::filter_map(BroadcastStream::new(self.subscribe()), Result::ok)
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Option<Supervisor>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_supervisor(&self, live: Option<Live>) {
        let cancel = Arc::new(Notify::new());
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), Arc::clone(&cancel), live));
        *self.lock_supervisor() = Some(Supervisor { task, cancel });
    }

    fn stop_supervisor(&self) {
        if let Some(supervisor) = self.lock_supervisor().take() {
            supervisor.task.abort();
        }
    }
}

impl Drop for AgentConnector {
    fn drop(&mut self) {
        self.inner.intentional_close.store(true, Ordering::SeqCst);
        self.stop_supervisor();
        self.inner.lock_outgoing().take();
    }
}

impl Inner {
    fn lock_outgoing(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_intentional(&self) -> bool {
        self.intentional_close.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ConnectorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn send(&self, msg: &AgentMessage) -> bool {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                return false;
            }
        };
        self.lock_outgoing()
            .as_ref()
            .is_some_and(|tx| tx.send(Message::Text(json.into())).is_ok())
    }

    /// Resolve credentials and identity, then open the socket.
    async fn establish(&self) -> Result<WsStream, ConnectorError> {
        let token = self
            .credentials
            .session_token()
            .await?
            .ok_or(ConnectorError::NotAuthenticated)?;

        let cached = self
            .agent_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let agent_id = resolve_identity(cached, self.identity.as_ref(), self.registrar.as_ref(), &token).await?;
        *self.agent_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(agent_id.clone());

        let url = self.config.connect_url(&agent_id, &token)?;
        tracing::debug!(%agent_id, "Opening relay connection");
        let (ws, _response) = connect_async(url.as_str()).await?;
        Ok(ws)
    }

    /// Install `ws` as the live connection: spawn its writer and keepalive.
    fn attach(self: &Arc<Self>, ws: WsStream) -> Live {
        let (mut sink, stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let period = self.config.keepalive_interval.max(Duration::from_millis(1));
        let writer = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = keepalive.tick() => match serde_json::to_string(&AgentMessage::ping()) {
                        Ok(json) => Message::Text(json.into()),
                        Err(_) => continue,
                    },
                };
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!("WebSocket write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        *self.lock_outgoing() = Some(tx);

        let agent_id = self
            .agent_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        tracing::info!(%agent_id, "Connected to relay");
        self.emit(ConnectorEvent::Connected { agent_id });

        Live { stream, writer }
    }

    /// Read from the live connection until it ends. Returns the close code
    /// and reason.
    async fn serve(self: &Arc<Self>, live: Live) -> (u16, String) {
        let Live { mut stream, writer } = live;
        let mut closed: Option<(u16, String)> = None;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_text(text.as_str()),
                Ok(Message::Binary(data)) => self.handle_text(&String::from_utf8_lossy(&data)),
                Ok(Message::Close(frame)) => {
                    // Keep reading so the close reply gets flushed.
                    let (code, reason) = frame.map_or_else(
                        || (CLOSE_NORMAL, String::new()),
                        |f| (u16::from(f.code), f.reason.as_str().to_string()),
                    );
                    closed = Some((code, reason));
                }
                // Protocol-level ping/pong is answered by tungstenite.
                Ok(_) => {}
                Err(e) => {
                    if closed.is_none() && !self.is_intentional() {
                        tracing::warn!("WebSocket error: {e}");
                        self.emit(ConnectorEvent::Error(e.to_string()));
                    }
                    break;
                }
            }
        }

        self.lock_outgoing().take();
        writer.abort();

        if self.is_intentional() {
            return (CLOSE_NORMAL, DISCONNECT_REASON.to_string());
        }
        closed.unwrap_or_else(|| (CLOSE_ABNORMAL, "Connection lost".to_string()))
    }

    /// Filter an inbound frame and act on it.
    fn handle_text(self: &Arc<Self>, raw: &str) {
        let msg = match serde_json::from_str::<RelayMessage>(raw) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Discarding message outside the allowed set: {e}");
                return;
            }
        };

        match &msg {
            RelayMessage::ToolExecution {
                request_id,
                tool,
                input,
            } => self.spawn_execution(request_id.clone(), tool.clone(), input.clone()),
            RelayMessage::Hello { message, .. } => tracing::info!("Relay: {message}"),
            RelayMessage::Error { message } => tracing::warn!("Relay reported an error: {message}"),
            RelayMessage::Echo { .. } | RelayMessage::Pong { .. } => {}
        }
        self.emit(ConnectorEvent::Message(msg));
    }

    fn spawn_execution(self: &Arc<Self>, request_id: String, tool: String, input: serde_json::Value) {
        tracing::debug!(%request_id, %tool, "Executing tool");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.tools.execute(&tool, input).await;
            let response = AgentMessage::tool_response(request_id.clone(), result);
            if !inner.send(&response) {
                tracing::warn!(%request_id, %tool, "Connection closed before the tool response was sent");
            }
        });
    }
}

async fn supervise(inner: Arc<Inner>, cancel: Arc<Notify>, mut live: Option<Live>) {
    let mut attempt: u32 = 0;
    loop {
        if let Some(connection) = live.take() {
            attempt = 0;
            let (code, reason) = inner.serve(connection).await;
            tracing::info!(code, %reason, "Disconnected from relay");
            inner.emit(ConnectorEvent::Disconnected { code, reason });
        }
        if inner.is_intentional() {
            return;
        }

        attempt += 1;
        if attempt > inner.config.max_reconnect_attempts {
            tracing::warn!(attempts = attempt - 1, "Giving up reconnecting to relay");
            inner.emit(ConnectorEvent::ReconnectExhausted);
            return;
        }
        let delay = inner.config.reconnect_delay(attempt);
        tracing::info!(attempt, ?delay, "Scheduling reconnect");
        inner.emit(ConnectorEvent::ReconnectScheduled { attempt, delay });

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.notified() => {}
        }
        if inner.is_intentional() {
            return;
        }

        match inner.establish().await {
            Ok(ws) if inner.is_intentional() => drop(ws),
            Ok(ws) => live = Some(inner.attach(ws)),
            Err(e) => {
                tracing::warn!(attempt, "Reconnect failed: {e}");
                inner.emit(ConnectorEvent::Error(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{credentials::StaticCredentials, identity::MemoryIdentityStore};

    struct NoRegistrar;

    #[async_trait::async_trait]
    impl Registrar for NoRegistrar {
        async fn register(&self, _token: &str) -> Result<String, ConnectorError> {
            Err(ConnectorError::Registration("disabled".to_string()))
        }
    }

    fn connector(credentials: StaticCredentials, identity: MemoryIdentityStore) -> AgentConnector {
        AgentConnector::new(
            ConnectorConfig::new("http://127.0.0.1:9"),
            Arc::new(credentials),
            Arc::new(NoRegistrar),
            Arc::new(identity),
            ToolTable::new(),
        )
    }

    #[tokio::test]
    async fn test_connect_without_token_does_not_retry() {
        let connector = connector(StaticCredentials::default(), MemoryIdentityStore::with_id("a"));
        let mut events = connector.subscribe();

        assert!(!connector.connect().await);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectorEvent::Error("Not authenticated".to_string())
        );
        assert!(events.try_recv().is_err());
        assert!(connector.lock_supervisor().is_none());
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_registration_failure_does_not_retry() {
        let connector = connector(StaticCredentials::new("tok"), MemoryIdentityStore::new());
        assert!(!connector.connect().await);
        assert!(connector.lock_supervisor().is_none());
        assert_eq!(connector.agent_id(), None);
    }

    #[tokio::test]
    async fn test_disconnect_right_after_failed_connect() {
        let mut config = ConnectorConfig::new("http://127.0.0.1:9");
        config.reconnect_interval = Duration::from_secs(60);
        let connector = AgentConnector::new(
            config,
            Arc::new(StaticCredentials::new("tok")),
            Arc::new(NoRegistrar),
            Arc::new(MemoryIdentityStore::with_id("a")),
            ToolTable::new(),
        );

        assert!(!connector.connect().await);
        assert!(connector.lock_supervisor().is_some());

        // The supervisor may not be waiting yet; the wakeup must not be lost.
        tokio::time::timeout(Duration::from_secs(1), connector.disconnect())
            .await
            .expect("disconnect waited out the reconnect delay");
        assert!(connector.lock_supervisor().is_none());
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let connector = connector(StaticCredentials::new("tok"), MemoryIdentityStore::with_id("a"));
        assert!(!connector.send(&AgentMessage::ping()));
    }
}
