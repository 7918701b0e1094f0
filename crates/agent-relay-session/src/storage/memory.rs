//! In-memory attachment storage and agent directory.

use std::{collections::HashMap, sync::RwLock};

use agent_relay_core::{
    AgentDirectory, AgentId, Authenticator, OwnerId,
    traits::DirectoryError,
};
use async_trait::async_trait;
use uuid::Uuid;

use super::{AttachmentStore, ConnectionAttachment, StorageError};

/// In-memory attachment store.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    attachments: RwLock<HashMap<AgentId, ConnectionAttachment>>,
}

impl MemoryAttachmentStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn save(&self, attachment: &ConnectionAttachment) -> Result<(), StorageError> {
        self.attachments
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(attachment.agent_id.clone(), attachment.clone());
        Ok(())
    }

    async fn load(&self, agent_id: &str) -> Result<Option<ConnectionAttachment>, StorageError> {
        Ok(self
            .attachments
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(agent_id)
            .cloned())
    }

    async fn load_all(&self) -> Result<Vec<ConnectionAttachment>, StorageError> {
        let attachments = self
            .attachments
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<ConnectionAttachment> = attachments.values().cloned().collect();
        result.sort_by(|a, b| b.accepted_at.cmp(&a.accepted_at));
        Ok(result)
    }

    async fn remove(&self, agent_id: &str, connection_id: Uuid) -> Result<(), StorageError> {
        let mut attachments = self
            .attachments
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if attachments
            .get(agent_id)
            .is_some_and(|a| a.connection_id == connection_id)
        {
            attachments.remove(agent_id);
        }
        Ok(())
    }
}

/// In-memory registration records and bearer tokens.
///
/// Stands in for the real user store in demos and tests.
#[derive(Default)]
pub struct MemoryDirectory {
    agents: RwLock<HashMap<AgentId, OwnerId>>,
    tokens: RwLock<HashMap<String, OwnerId>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new agent for `owner` and return its id.
    ///
    /// # Errors
    /// Returns error if the directory lock is poisoned.
    pub fn register_agent(&self, owner: impl Into<OwnerId>) -> Result<AgentId, DirectoryError> {
        let agent_id = Uuid::new_v4().simple().to_string();
        self.insert_agent(agent_id.clone(), owner)?;
        Ok(agent_id)
    }

    /// Record that `agent_id` belongs to `owner`.
    ///
    /// # Errors
    /// Returns error if the directory lock is poisoned.
    pub fn insert_agent(
        &self,
        agent_id: impl Into<AgentId>,
        owner: impl Into<OwnerId>,
    ) -> Result<(), DirectoryError> {
        self.agents
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .insert(agent_id.into(), owner.into());
        Ok(())
    }

    /// Issue `token` to `owner`.
    ///
    /// # Errors
    /// Returns error if the directory lock is poisoned.
    pub fn insert_token(
        &self,
        token: impl Into<String>,
        owner: impl Into<OwnerId>,
    ) -> Result<(), DirectoryError> {
        self.tokens
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .insert(token.into(), owner.into());
        Ok(())
    }
}

#[async_trait]
impl AgentDirectory for MemoryDirectory {
    async fn owner_of(&self, agent_id: &str) -> Result<Option<OwnerId>, DirectoryError> {
        Ok(self
            .agents
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .get(agent_id)
            .cloned())
    }
}

#[async_trait]
impl Authenticator for MemoryDirectory {
    async fn authenticate(&self, token: &str) -> Result<Option<OwnerId>, DirectoryError> {
        Ok(self
            .tokens
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .get(token)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_ignores_superseded_connection() {
        let store = MemoryAttachmentStore::new();
        let first = ConnectionAttachment::new("agent-1");
        let second = ConnectionAttachment::new("agent-1");

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        // The old connection closing must not erase the newer record.
        store.remove("agent-1", first.connection_id).await.unwrap();
        assert_eq!(store.load("agent-1").await.unwrap(), Some(second.clone()));

        store.remove("agent-1", second.connection_id).await.unwrap();
        assert!(store.load("agent-1").await.unwrap().is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_lookups() {
        let directory = MemoryDirectory::new();
        let agent_id = directory.register_agent("user-1").unwrap();
        directory.insert_token("secret", "user-1").unwrap();

        assert_eq!(
            directory.owner_of(&agent_id).await.unwrap().as_deref(),
            Some("user-1")
        );
        assert!(directory.owner_of("missing").await.unwrap().is_none());
        assert_eq!(
            directory.authenticate("secret").await.unwrap().as_deref(),
            Some("user-1")
        );
        assert!(directory.authenticate("wrong").await.unwrap().is_none());
    }
}
