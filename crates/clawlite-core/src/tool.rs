use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of a tool callable by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Unique name, e.g. "exec", "read_file", "run_skill".
    pub name: String,
    /// One-line description for the model.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// A request from the model to call a tool.
///
/// This is the single tool-call contract: assistant output that carries
/// `tool_calls` continues the loop, anything else is final text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The result of executing a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// The tool-execution contract the engine drives its loop through.
/// Implemented by the runtime's tool registry.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// List all tools this executor provides.
    fn tools(&self) -> Vec<Tool>;

    /// Execute a single tool call. Failures come back as error-flagged
    /// results, never as panics or transport errors — the model sees them
    /// and can choose another path.
    async fn execute(&self, call: &ToolCall, session_id: &crate::SessionId) -> ToolResult;
}
