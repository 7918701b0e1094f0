//! Core types for relaying tool invocations to connected agents.
//!
//! This crate provides the shared building blocks:
//! - `RelayMessage` / `AgentMessage` - Wire envelopes for each direction
//! - `RelayError` - Error taxonomy with HTTP status mapping
//! - Collaborator traits (`AgentDirectory`, `Authenticator`, `ToolHandler`)

pub mod error;
pub mod protocol;
pub mod traits;

pub use error::RelayError;
pub use protocol::{AgentMessage, Outgoing, RelayMessage, RequestId, ToolResult};
pub use traits::{AgentDirectory, AgentId, Authenticator, DirectoryError, OwnerId, ToolError, ToolHandler};
