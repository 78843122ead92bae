use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use clawlite_core::{ChatMessage, Result, Tool, ToolCall};

/// A request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model name without the vendor prefix (resolved by the router).
    pub model: String,
    /// Conversation history, flat session-log records.
    pub messages: Vec<ChatMessage>,
    /// Tools offered to the model.
    pub tools: Vec<Tool>,
    /// System block (assembled by the prompt builder).
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    /// Structured tool calls; non-empty continues the engine loop.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    ContentFilter,
}

/// A chunk of a streaming response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCall(ToolCall),
    Usage(Usage),
    Done(StopReason),
    Error(String),
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Estimated cost in USD, computed by the provider adapter.
    pub estimated_cost_usd: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.estimated_cost_usd += other.estimated_cost_usd;
    }
}

/// Trait implemented by each LLM vendor adapter.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Vendor name matched against the `vendor/model` prefix.
    fn name(&self) -> &str;

    /// Models this provider is known to serve.
    fn models(&self) -> Vec<String>;

    /// Send a non-streaming request.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Send a streaming request. Returns a receiver for chunks.
    async fn stream(&self, request: &ChatRequest)
        -> Result<tokio::sync::mpsc::Receiver<StreamChunk>>;

    /// Cheap reachability/credential check.
    async fn health_check(&self) -> Result<()>;
}
