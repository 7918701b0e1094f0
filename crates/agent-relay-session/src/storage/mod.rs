//! Durable connection metadata and registration stand-ins.
//!
//! The pending-request table is never persisted. The only state that outlives
//! a process suspension is the per-connection attachment.

use async_trait::async_trait;
use agent_relay_core::{AgentId, protocol::now_millis};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryAttachmentStore, MemoryDirectory};

/// Metadata attached to an accepted connection.
///
/// Enough to reconstitute the connection handle after the hosting process is
/// resumed; used for diagnostics, never for correctness of pending requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttachment {
    /// Identifier of the connection this attachment describes.
    pub connection_id: Uuid,
    /// Agent the connection belongs to.
    pub agent_id: AgentId,
    /// Acceptance time (Unix epoch milliseconds).
    pub accepted_at: i64,
}

impl ConnectionAttachment {
    /// Attachment for a connection accepted now.
    #[must_use]
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            accepted_at: now_millis(),
        }
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for attachment storage backends.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Record the attachment of a newly accepted connection, replacing any
    /// previous one for the same agent.
    async fn save(&self, attachment: &ConnectionAttachment) -> Result<(), StorageError>;

    /// Attachment currently recorded for an agent.
    async fn load(&self, agent_id: &str) -> Result<Option<ConnectionAttachment>, StorageError>;

    /// Every recorded attachment.
    async fn load_all(&self) -> Result<Vec<ConnectionAttachment>, StorageError>;

    /// Forget the attachment of `agent_id` if it still describes `connection_id`.
    async fn remove(&self, agent_id: &str, connection_id: Uuid) -> Result<(), StorageError>;
}
