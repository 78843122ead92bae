use async_trait::async_trait;
use tracing::debug;

use clawlite_core::{ClawLiteError, Result, Role, ToolCall};

use crate::provider::*;

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.anthropic.com/v1".into(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        for msg in &request.messages {
            match msg.role {
                Role::System => continue, // carried in the top-level system field
                Role::User => {
                    messages.push(serde_json::json!({ "role": "user", "content": msg.text }));
                }
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        messages
                            .push(serde_json::json!({ "role": "assistant", "content": msg.text }));
                    } else {
                        let mut blocks: Vec<serde_json::Value> = Vec::new();
                        if !msg.text.is_empty() {
                            blocks.push(serde_json::json!({ "type": "text", "text": msg.text }));
                        }
                        for tc in &msg.tool_calls {
                            blocks.push(serde_json::json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            }));
                        }
                        messages
                            .push(serde_json::json!({ "role": "assistant", "content": blocks }));
                    }
                }
                Role::Tool => {
                    // Tool results go back as user messages with tool_result blocks
                    messages.push(serde_json::json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                            "content": msg.tool_result.clone().unwrap_or_default(),
                        }],
                    }));
                }
            }
        }

        let mut body = serde_json::json!({
            "model": &request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(ref system) = request.system {
            body["system"] = serde_json::json!(system);
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        body
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> Vec<String> {
        vec![
            "claude-opus-4-6".into(),
            "claude-sonnet-4-5".into(),
            "claude-haiku-3-5".into(),
        ]
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(request);
        debug!(model = %request.model, "sending Anthropic request");

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClawLiteError::ProviderTimeout { timeout_secs: 0 }
                } else {
                    ClawLiteError::ProviderSendFailed(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ClawLiteError::ProviderRateLimited { retry_after_secs: 30 },
                401 | 403 => ClawLiteError::AuthInvalid("anthropic".into()),
                _ => ClawLiteError::ProviderSendFailed(format!("HTTP {status}: {text}")),
            });
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ClawLiteError::ProviderSendFailed(e.to_string()))?;

        let text = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        (b["type"] == "text").then(|| b["text"].as_str().unwrap_or("").to_string())
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let tool_calls: Vec<ToolCall> = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        (b["type"] == "tool_use").then(|| ToolCall {
                            id: b["id"].as_str().unwrap_or("").to_string(),
                            name: b["name"].as_str().unwrap_or("").to_string(),
                            arguments: b["input"].clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let has_tool_calls = !tool_calls.is_empty();
        let stop_reason = match data["stop_reason"].as_str() {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ if has_tool_calls => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };

        let usage_data = &data["usage"];
        let input_tokens = usage_data["input_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = usage_data["output_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(ChatResponse {
            text,
            tool_calls,
            usage: Usage {
                input_tokens,
                output_tokens,
                estimated_cost_usd: estimate_cost(&request.model, input_tokens, output_tokens),
            },
            stop_reason,
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let mut body = self.build_body(request);
        body["stream"] = serde_json::json!(true);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let model = request.model.clone();

        tokio::spawn(async move {
            let resp = client
                .post(format!("{base_url}/messages"))
                .header("x-api-key", &api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(resp) if resp.status().is_success() => {
                    use futures::StreamExt;
                    let mut stream = resp.bytes_stream();
                    let mut buffer = String::new();
                    let mut current_tool_id = String::new();
                    let mut current_tool_name = String::new();
                    let mut current_tool_input = String::new();
                    let mut in_tool_input = false;
                    let mut input_tokens = 0u32;
                    let mut output_tokens = 0u32;
                    let mut stop_reason = StopReason::EndTurn;
                    let mut has_tool_calls = false;

                    while let Some(chunk_result) = stream.next().await {
                        let bytes = match chunk_result {
                            Ok(b) => b,
                            Err(e) => {
                                let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                                return;
                            }
                        };
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(newline_pos) = buffer.find('\n') {
                            let line = buffer[..newline_pos].trim().to_string();
                            buffer = buffer[newline_pos + 1..].to_string();
                            if line.is_empty() || line.starts_with(':') {
                                continue;
                            }
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                                continue;
                            };

                            match event["type"].as_str() {
                                Some("message_start") => {
                                    if let Some(it) =
                                        event["message"]["usage"]["input_tokens"].as_u64()
                                    {
                                        input_tokens = it as u32;
                                    }
                                }
                                Some("content_block_start") => {
                                    let cb = &event["content_block"];
                                    if cb["type"].as_str() == Some("tool_use") {
                                        current_tool_id =
                                            cb["id"].as_str().unwrap_or("").to_string();
                                        current_tool_name =
                                            cb["name"].as_str().unwrap_or("").to_string();
                                        current_tool_input.clear();
                                        in_tool_input = true;
                                    }
                                }
                                Some("content_block_delta") => {
                                    let delta = &event["delta"];
                                    match delta["type"].as_str() {
                                        Some("text_delta") => {
                                            if let Some(text) = delta["text"].as_str() {
                                                let _ = tx
                                                    .send(StreamChunk::TextDelta(text.to_string()))
                                                    .await;
                                            }
                                        }
                                        Some("input_json_delta") => {
                                            if let Some(partial) = delta["partial_json"].as_str() {
                                                current_tool_input.push_str(partial);
                                            }
                                        }
                                        _ => {}
                                    }
                                }
                                Some("content_block_stop") => {
                                    if in_tool_input {
                                        let arguments =
                                            serde_json::from_str(&current_tool_input)
                                                .unwrap_or_default();
                                        let _ = tx
                                            .send(StreamChunk::ToolCall(ToolCall {
                                                id: current_tool_id.clone(),
                                                name: current_tool_name.clone(),
                                                arguments,
                                            }))
                                            .await;
                                        has_tool_calls = true;
                                        in_tool_input = false;
                                    }
                                }
                                Some("message_delta") => {
                                    if let Some(sr) = event["delta"]["stop_reason"].as_str() {
                                        stop_reason = match sr {
                                            "tool_use" => StopReason::ToolUse,
                                            "max_tokens" => StopReason::MaxTokens,
                                            _ => StopReason::EndTurn,
                                        };
                                    }
                                    if let Some(ot) = event["usage"]["output_tokens"].as_u64() {
                                        output_tokens = ot as u32;
                                    }
                                }
                                Some("message_stop") => {
                                    let _ = tx
                                        .send(StreamChunk::Usage(Usage {
                                            input_tokens,
                                            output_tokens,
                                            estimated_cost_usd: estimate_cost(
                                                &model,
                                                input_tokens,
                                                output_tokens,
                                            ),
                                        }))
                                        .await;
                                    let final_stop = if has_tool_calls {
                                        StopReason::ToolUse
                                    } else {
                                        stop_reason
                                    };
                                    let _ = tx.send(StreamChunk::Done(final_stop)).await;
                                    return;
                                }
                                Some("error") => {
                                    let msg = event["error"]["message"]
                                        .as_str()
                                        .unwrap_or("unknown error");
                                    let _ = tx.send(StreamChunk::Error(msg.to_string())).await;
                                    return;
                                }
                                _ => {}
                            }
                        }
                    }
                    let _ = tx.send(StreamChunk::Done(stop_reason)).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    let _ = tx
                        .send(StreamChunk::Error(format!("HTTP {status}: {text}")))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(ClawLiteError::AuthMissing("anthropic".into()));
        }
        Ok(())
    }
}

/// Estimate cost for Anthropic models (USD per 1M tokens).
fn estimate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    let (input_per_m, output_per_m) = match model {
        m if m.contains("opus") => (15.00, 75.00),
        m if m.contains("sonnet") => (3.00, 15.00),
        m if m.contains("haiku") => (0.80, 4.00),
        _ => (3.00, 15.00),
    };
    (input_tokens as f64 * input_per_m + output_tokens as f64 * output_per_m) / 1_000_000.0
}
