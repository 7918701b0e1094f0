//! Persistence of the agent's relay identity.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{credentials::Registrar, error::ConnectorError};

/// Durable storage for the agent id issued at registration.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>, ConnectorError>;
    async fn save(&self, agent_id: &str) -> Result<(), ConnectorError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    browser_id: String,
}

/// Identity stored as JSON on disk.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the platform config directory
    /// (`~/.config/agent-relay/identity.json` on Linux).
    ///
    /// # Errors
    /// Returns error if the platform has no config directory.
    pub fn default_location() -> Result<Self, ConnectorError> {
        let dir = dirs::config_dir()
            .ok_or_else(|| ConnectorError::Identity("no config directory".to_string()))?;
        Ok(Self::new(dir.join("agent-relay").join("identity.json")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn load(&self) -> Result<Option<String>, ConnectorError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: IdentityFile = serde_json::from_slice(&bytes)?;
        Ok(Some(file.browser_id))
    }

    async fn save(&self, agent_id: &str) -> Result<(), ConnectorError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&IdentityFile {
            browser_id: agent_id.to_string(),
        })?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// In-memory identity store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    agent_id: Mutex<Option<String>>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that already holds `agent_id`.
    #[must_use]
    pub fn with_id(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Mutex::new(Some(agent_id.into())),
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load(&self) -> Result<Option<String>, ConnectorError> {
        Ok(self
            .agent_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, agent_id: &str) -> Result<(), ConnectorError> {
        *self.agent_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(agent_id.to_string());
        Ok(())
    }
}

/// Resolve the agent id: the cached value, else the stored one, else a fresh
/// registration that is then stored.
pub(crate) async fn resolve_identity(
    cached: Option<String>,
    store: &dyn IdentityStore,
    registrar: &dyn Registrar,
    token: &str,
) -> Result<String, ConnectorError> {
    if let Some(id) = cached {
        return Ok(id);
    }
    if let Some(id) = store.load().await? {
        tracing::debug!(agent_id = %id, "Loaded stored agent identity");
        return Ok(id);
    }
    let id = registrar.register(token).await?;
    store.save(&id).await?;
    Ok(id)
}
