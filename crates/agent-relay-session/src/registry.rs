//! Registry of sessions, one per agent identity.

use std::{collections::HashMap, sync::Arc};

use agent_relay_core::{AgentId, RelayError};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    session::{Accepted, ConnectionState, Session},
    storage::{AttachmentStore, ConnectionAttachment, StorageError},
};

/// Registry of agent sessions.
///
/// Sessions are created on first accept and live as long as the registry;
/// the registry hands out `Arc<Session>` so connection tasks keep the session
/// they were accepted into.
pub struct SessionRegistry {
    config: RelayConfig,
    store: Arc<dyn AttachmentStore>,
    sessions: RwLock<HashMap<AgentId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create a new registry.
    #[must_use]
    pub fn new(config: RelayConfig, store: Arc<dyn AttachmentStore>) -> Self {
        Self {
            config,
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Relay configuration.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Session for `agent_id`, created if it does not exist yet.
    pub async fn session(&self, agent_id: &str) -> Arc<Session> {
        if let Some(session) = self.get(agent_id).await {
            return session;
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(agent_id.to_string()).or_insert_with(|| {
            tracing::debug!(agent_id, "Creating session");
            Arc::new(Session::new(agent_id, self.config.request_timeout))
        }))
    }

    /// Existing session for `agent_id`.
    pub async fn get(&self, agent_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(agent_id).map(Arc::clone)
    }

    /// Accept a connection for `agent_id` and persist its attachment.
    pub async fn accept(&self, agent_id: &str) -> (Arc<Session>, Accepted) {
        let session = self.session(agent_id).await;
        let accepted = session.accept();
        self.persist(accepted.handle.attachment()).await;
        (session, accepted)
    }

    /// Reinstall a connection after the process was resumed.
    pub async fn rehydrate(&self, attachment: ConnectionAttachment) -> (Arc<Session>, Accepted) {
        let session = self.session(&attachment.agent_id).await;
        let accepted = session.rehydrate(attachment);
        self.persist(accepted.handle.attachment()).await;
        (session, accepted)
    }

    /// Rehydrate every persisted attachment, e.g. when a suspended process
    /// resumes with its sockets still open.
    ///
    /// The caller must attach a writer to each returned `outgoing` queue.
    /// Dropping a queue closes its handle and the session reports
    /// disconnected.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn resume(&self) -> Result<Vec<(Arc<Session>, Accepted)>, StorageError> {
        let attachments = self.store.load_all().await?;
        let mut resumed = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            resumed.push(self.rehydrate(attachment).await);
        }
        tracing::info!(count = resumed.len(), "Resumed persisted connections");
        Ok(resumed)
    }

    async fn persist(&self, attachment: &ConnectionAttachment) {
        if let Err(e) = self.store.save(attachment).await {
            // Attachments only serve diagnostics and rehydration.
            tracing::warn!(agent_id = %attachment.agent_id, "Failed to persist attachment: {e}");
        }
    }

    /// Report that `connection_id` of `session` closed.
    ///
    /// Returns `true` if it was the session's current connection.
    pub async fn connection_closed(&self, session: &Session, connection_id: Uuid, reason: &str) -> bool {
        if !session.handle_closed(connection_id, reason) {
            return false;
        }
        if let Err(e) = self.store.remove(session.agent_id(), connection_id).await {
            tracing::warn!(agent_id = session.agent_id(), "Failed to remove attachment: {e}");
        }
        true
    }

    /// Run `tool` on the agent's current connection.
    ///
    /// # Errors
    /// See [`Session::invoke`]. An agent that never connected yields
    /// [`RelayError::NoConnection`] without creating a session.
    pub async fn invoke(&self, agent_id: &str, tool: &str, input: Value) -> Result<Value, RelayError> {
        let session = self.get(agent_id).await.ok_or(RelayError::NoConnection)?;
        session.invoke(tool, input).await
    }

    /// Agents with a live connection.
    pub async fn connected_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.state() == ConnectionState::Connected)
            .map(|s| s.agent_id().to_string())
            .collect();
        agents.sort();
        agents
    }

    /// Number of sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session exists yet.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Attachments persisted by a previous run of the process.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn persisted_attachments(&self) -> Result<Vec<ConnectionAttachment>, StorageError> {
        self.store.load_all().await
    }
}
