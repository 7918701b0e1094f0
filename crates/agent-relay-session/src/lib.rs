//! Session relay: per-agent connection ownership and request correlation.
//!
//! Provides:
//! - `Session` - One live connection per agent, many in-flight requests
//! - `PendingTable` - Correlation ids, deadlines and exactly-once settlement
//! - `SessionRegistry` - Sessions keyed by agent identity
//! - Attachment storage (memory)

pub mod config;
pub mod pending;
pub mod registry;
pub mod session;
pub mod storage;

pub use config::RelayConfig;
pub use pending::PendingTable;
pub use registry::SessionRegistry;
pub use session::{Accepted, ConnectionHandle, ConnectionState, Session};
pub use storage::{AttachmentStore, ConnectionAttachment};
