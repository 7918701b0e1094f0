//! Collaborator traits: who owns an agent, who the caller is, and how a tool runs.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Agent identifier, chosen at registration time.
pub type AgentId = String;

/// Identifier of the principal that owns agents.
pub type OwnerId = String;

/// Directory lookup error.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory error: {0}")]
    Internal(String),
}

/// Registration records for agents.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Owner of the agent, or `None` if the agent is not registered.
    async fn owner_of(&self, agent_id: &str) -> Result<Option<OwnerId>, DirectoryError>;
}

/// Maps a bearer token to the principal it belongs to.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Principal for `token`, or `None` if the token is not valid.
    async fn authenticate(&self, token: &str) -> Result<Option<OwnerId>, DirectoryError>;
}

/// Tool execution error.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
}

/// One locally executable tool on the agent side.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with the given input and return its result payload.
    async fn call(&self, input: Value) -> Result<Value, ToolError>;
}
