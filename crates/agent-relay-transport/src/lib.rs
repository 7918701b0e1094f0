//! HTTP and WebSocket surface of the agent relay.
//!
//! Provides:
//! - Agent connect endpoint (WebSocket upgrade with ownership checks)
//! - Caller invoke and status endpoints
//! - The socket pump tying an accepted connection to its session

pub mod http;
pub mod websocket;

pub use http::{ApiError, RelayState, create_router};
pub use websocket::serve_connection;
