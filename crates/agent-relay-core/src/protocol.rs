//! Wire protocol between the relay and a connected agent.
//!
//! Every frame is a JSON object tagged by its `type` field. Each direction has
//! its own closed set of variants, so a frame carrying any other tag simply
//! fails to parse on the receiving side.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id carried by `tool-execution` / `tool-response` pairs.
pub type RequestId = String;

/// Normal closure, used when the agent disconnects on purpose.
pub const CLOSE_NORMAL: u16 = 1000;

/// Reserved close code for a connection replaced by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Message from relay to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Ask the agent to run a tool.
    ToolExecution {
        request_id: RequestId,
        tool: String,
        #[serde(default)]
        input: Value,
    },
    /// Greeting sent once a connection is accepted.
    Hello { message: String, timestamp: i64 },
    /// Diagnostic echo of something the agent sent.
    Echo {
        #[serde(default)]
        original_message: Value,
        timestamp: i64,
    },
    /// Protocol error report.
    Error { message: String },
    /// Keepalive answer.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl RelayMessage {
    /// Build a `hello` greeting stamped with the current time.
    #[must_use]
    pub fn hello(message: impl Into<String>) -> Self {
        Self::Hello {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// Build an `error` report.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Wire tag of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ToolExecution { .. } => "tool-execution",
            Self::Hello { .. } => "hello",
            Self::Echo { .. } => "echo",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Message from agent to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    /// Outcome of a `tool-execution`, tagged with the same request id.
    ToolResponse {
        request_id: RequestId,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AgentFailure>,
    },
    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// Keepalive answer.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl AgentMessage {
    /// Build a successful `tool-response`.
    #[must_use]
    pub fn tool_response(request_id: impl Into<RequestId>, result: Value) -> Self {
        Self::ToolResponse {
            request_id: request_id.into(),
            result,
            error: None,
        }
    }

    /// Build a `ping` stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Some(now_millis()),
        }
    }
}

/// Failure the agent could not express as a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub message: String,
}

/// Result payload of a tool call: a list of content blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    /// Single text block result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Single text block result flagged as an error.
    #[must_use]
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Convert into a JSON value for a `tool-response`.
    #[must_use]
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
}

/// Frame queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing<M> {
    /// Serialize and send.
    Message(M),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: String },
}

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
