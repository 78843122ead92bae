use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single message in a session log.
///
/// Persisted append-only as one JSON object per line. Tool invocations and
/// their results ride on the same record type: an assistant message carries
/// the `tool_calls` it requested, a tool message carries `tool_name` and
/// `tool_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Id of the tool call this record answers (tool-role records only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_name: None,
            tool_call_id: None,
            tool_args: None,
            tool_result: None,
            tool_calls: vec![],
            created_at: Utc::now(),
            tokens: None,
            cost: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// A tool-result record, appended after dispatching a tool call.
    pub fn tool(name: impl Into<String>, args: serde_json::Value, result: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, "");
        msg.tool_name = Some(name.into());
        msg.tool_args = Some(args);
        msg.tool_result = Some(result.into());
        msg
    }

    /// A tool-result record correlated to the originating call.
    pub fn tool_for(call: &ToolCall, result: impl Into<String>) -> Self {
        let mut msg = Self::tool(call.name.clone(), call.arguments.clone(), result);
        msg.tool_call_id = Some(call.id.clone());
        msg
    }

    /// Estimate token count for this message (~4 chars per token).
    pub fn estimate_tokens(&self) -> usize {
        let mut chars = 16; // role overhead
        chars += self.text.len();
        if let Some(ref r) = self.tool_result {
            chars += r.len();
        }
        for tc in &self.tool_calls {
            chars += tc.name.len();
            chars += tc.arguments.to_string().len();
        }
        (chars / 4).max(1)
    }
}
