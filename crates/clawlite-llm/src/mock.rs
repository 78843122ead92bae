//! Mock provider for deterministic testing. Returns pre-configured
//! responses without making any HTTP calls.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use clawlite_core::{ClawLiteError, Result, ToolCall};

use crate::provider::*;

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// If set, the provider returns this error kind instead.
    pub error: Option<MockError>,
    /// Artificial latency before responding.
    pub delay: Duration,
}

#[derive(Clone, Copy, Debug)]
pub enum MockError {
    Timeout,
    RateLimited,
    SendFailed,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                estimated_cost_usd: 0.001,
            },
            error: None,
            delay: Duration::ZERO,
        }
    }
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A mock provider that pops queued responses in order. When the queue runs
/// dry it answers with a fixed notice instead of blocking the test.
pub struct MockProvider {
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// Requests received, for assertions.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
    name: String,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
            name: name.into(),
        }
    }

    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().unwrap().push(MockResponse::text(text));
        self
    }

    pub fn with_tool_call(self, name: &str, args: serde_json::Value) -> Self {
        self.responses.lock().unwrap().push(MockResponse {
            tool_calls: vec![ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: name.to_string(),
                arguments: args,
            }],
            stop_reason: StopReason::ToolUse,
            ..Default::default()
        });
        self
    }

    pub fn with_error(self, error: MockError) -> Self {
        self.responses.lock().unwrap().push(MockResponse {
            error: Some(error),
            ..Default::default()
        });
        self
    }

    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().unwrap().push(resp);
        self
    }

    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<ChatRequest>>> {
        Arc::clone(&self.requests)
    }

    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            MockResponse::text("(mock: no more queued responses)")
        } else {
            responses.remove(0)
        }
    }
}

fn mock_error(kind: MockError) -> ClawLiteError {
    match kind {
        MockError::Timeout => ClawLiteError::ProviderTimeout { timeout_secs: 1 },
        MockError::RateLimited => ClawLiteError::ProviderRateLimited { retry_after_secs: 0 },
        MockError::SendFailed => ClawLiteError::ProviderSendFailed("mock failure".into()),
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<String> {
        vec!["test-model".to_string()]
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();
        if !mock.delay.is_zero() {
            tokio::time::sleep(mock.delay).await;
        }
        if let Some(error) = mock.error {
            return Err(mock_error(error));
        }
        Ok(ChatResponse {
            text: mock.text,
            tool_calls: mock.tool_calls,
            usage: mock.usage,
            stop_reason: mock.stop_reason,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();
        if !mock.delay.is_zero() {
            tokio::time::sleep(mock.delay).await;
        }
        if let Some(error) = mock.error {
            return Err(mock_error(error));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if !mock.text.is_empty() {
                for word in mock.text.split_inclusive(' ') {
                    let _ = tx.send(StreamChunk::TextDelta(word.to_string())).await;
                }
            }
            for tc in mock.tool_calls {
                let _ = tx.send(StreamChunk::ToolCall(tc)).await;
            }
            let _ = tx.send(StreamChunk::Usage(mock.usage)).await;
            let _ = tx.send(StreamChunk::Done(mock.stop_reason)).await;
        });
        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
