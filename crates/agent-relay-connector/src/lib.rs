//! Agent-side connector for the relay.
//!
//! Provides:
//! - `AgentConnector` - Outbound WebSocket with reconnection and keepalive
//! - `ToolTable` - Local tools run on behalf of relay callers
//! - Credential, registration and identity persistence seams

pub mod config;
pub mod connector;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod identity;

pub use config::ConnectorConfig;
pub use connector::{AgentConnector, ConnectorEvent};
pub use credentials::{CredentialProvider, HttpAuthClient, Registrar, StaticCredentials};
pub use dispatch::{FnTool, ToolTable};
pub use error::ConnectorError;
pub use identity::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
