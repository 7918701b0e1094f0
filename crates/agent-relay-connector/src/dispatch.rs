//! Local tool table and execution.

use std::{collections::HashMap, future::Future, sync::Arc};

use agent_relay_core::{ToolError, ToolHandler, ToolResult};
use async_trait::async_trait;
use serde_json::Value;

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        (self.0)(input).await
    }
}

/// Tools this agent can run, by name.
#[derive(Clone, Default)]
pub struct ToolTable {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a tool.
    #[must_use]
    pub fn with_tool(mut self, name: impl Into<String>, handler: impl ToolHandler + 'static) -> Self {
        self.insert(name, handler);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: impl ToolHandler + 'static) {
        self.tools.insert(name.into(), Arc::new(handler));
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Run `tool` and produce the `result` of its `tool-response`.
    ///
    /// Never fails: unknown tools, handler errors and handler panics all
    /// come back as an `isError` result.
    pub async fn execute(&self, tool: &str, input: Value) -> Value {
        let Some(handler) = self.tools.get(tool).cloned() else {
            tracing::warn!(tool, "Unknown tool requested");
            return ToolResult::error_text(format!("Unknown tool: {tool}. Tool not implemented yet."))
                .into_value();
        };

        // Run on its own task so a panicking handler only fails this call.
        match tokio::spawn(async move { handler.call(input).await }).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(tool, "Tool failed: {e}");
                ToolResult::error_text(format!("Error executing tool: {e}")).into_value()
            }
            Err(e) => {
                tracing::error!(tool, "Tool task aborted: {e}");
                ToolResult::error_text(format!("Error executing tool: {tool} panicked")).into_value()
            }
        }
    }
}

impl std::fmt::Debug for ToolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolTable").field("tools", &self.names()).finish()
    }
}
