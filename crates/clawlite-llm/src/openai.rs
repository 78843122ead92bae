use async_trait::async_trait;
use tracing::info;

use clawlite_core::{ClawLiteError, Result, Role, ToolCall};

use crate::provider::*;

/// OpenAI-compatible chat-completions provider. Also covers proxy setups
/// (LiteLLM, vLLM, Together, …) via a custom base URL.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            provider_name: "openai".into(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    messages.push(serde_json::json!({ "role": "system", "content": msg.text }));
                }
                Role::User => {
                    messages.push(serde_json::json!({ "role": "user", "content": msg.text }));
                }
                Role::Assistant => {
                    if msg.tool_calls.is_empty() {
                        messages
                            .push(serde_json::json!({ "role": "assistant", "content": msg.text }));
                    } else {
                        let tc: Vec<serde_json::Value> = msg
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                serde_json::json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": serde_json::to_string(&tc.arguments)
                                            .unwrap_or_default(),
                                    }
                                })
                            })
                            .collect();
                        let content = if msg.text.is_empty() {
                            serde_json::Value::Null
                        } else {
                            serde_json::json!(msg.text)
                        };
                        messages.push(serde_json::json!({
                            "role": "assistant",
                            "content": content,
                            "tool_calls": tc,
                        }));
                    }
                }
                Role::Tool => {
                    messages.push(serde_json::json!({
                        "role": "tool",
                        "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.tool_result.clone().unwrap_or_default(),
                    }));
                }
            }
        }
        messages
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": &request.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": self.build_messages(request),
        });
        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        body
    }
}

fn status_error(status: reqwest::StatusCode, text: String) -> ClawLiteError {
    if status.as_u16() == 429 {
        ClawLiteError::ProviderRateLimited { retry_after_secs: 30 }
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        ClawLiteError::AuthInvalid("openai".into())
    } else {
        ClawLiteError::ProviderSendFailed(format!("HTTP {status}: {text}"))
    }
}

fn transport_error(e: reqwest::Error) -> ClawLiteError {
    if e.is_timeout() {
        ClawLiteError::ProviderTimeout { timeout_secs: 0 }
    } else {
        ClawLiteError::ProviderSendFailed(e.to_string())
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn models(&self) -> Vec<String> {
        vec!["gpt-4o".into(), "gpt-4o-mini".into(), "o3".into(), "o3-mini".into()]
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(request, false);
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ClawLiteError::ProviderSendFailed(e.to_string()))?;

        let choice = &data["choices"][0];
        let text = choice["message"]["content"].as_str().unwrap_or("").to_string();

        let tool_calls: Vec<ToolCall> = choice["message"]["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        Some(ToolCall {
                            id: c["id"].as_str()?.to_string(),
                            name: c["function"]["name"].as_str()?.to_string(),
                            arguments: serde_json::from_str(
                                c["function"]["arguments"].as_str().unwrap_or("{}"),
                            )
                            .unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let finish_reason = choice["finish_reason"].as_str().unwrap_or("");
        let usage_data = &data["usage"];
        let input_tokens = usage_data["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = usage_data["completion_tokens"].as_u64().unwrap_or(0) as u32;

        let has_tool_calls = !tool_calls.is_empty();
        Ok(ChatResponse {
            text,
            tool_calls,
            usage: Usage {
                input_tokens,
                output_tokens,
                estimated_cost_usd: estimate_cost(&request.model, input_tokens, output_tokens),
            },
            stop_reason: match finish_reason {
                "length" => StopReason::MaxTokens,
                "content_filter" => StopReason::ContentFilter,
                _ if has_tool_calls => StopReason::ToolUse,
                _ => StopReason::EndTurn,
            },
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let body = self.build_body(request, true);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();
        let model = request.model.clone();

        tokio::spawn(async move {
            let resp = client
                .post(format!("{base_url}/chat/completions"))
                .header("Authorization", format!("Bearer {api_key}"))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(resp) if resp.status().is_success() => {
                    use futures::StreamExt;
                    let mut stream = resp.bytes_stream();
                    let mut buffer = String::new();
                    // Tool call deltas: index -> (id, name, arguments_json)
                    let mut tool_calls: std::collections::HashMap<u64, (String, String, String)> =
                        std::collections::HashMap::new();
                    let mut input_tokens = 0u32;
                    let mut output_tokens = 0u32;
                    let mut finish_reason: Option<String> = None;

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
                            if data.trim() == "[DONE]" {
                                let mut ordered: Vec<_> = tool_calls.iter().collect();
                                ordered.sort_by_key(|(idx, _)| **idx);
                                for (_, (id, name, args)) in ordered {
                                    let arguments =
                                        serde_json::from_str(args).unwrap_or_default();
                                    let _ = tx
                                        .send(StreamChunk::ToolCall(ToolCall {
                                            id: id.clone(),
                                            name: name.clone(),
                                            arguments,
                                        }))
                                        .await;
                                }
                                let stop = match finish_reason.as_deref() {
                                    Some("length") => StopReason::MaxTokens,
                                    Some("content_filter") => StopReason::ContentFilter,
                                    _ if !tool_calls.is_empty() => StopReason::ToolUse,
                                    _ => StopReason::EndTurn,
                                };
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
                                let _ = tx.send(StreamChunk::Done(stop)).await;
                                return;
                            }
                            let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                                continue;
                            };
                            let delta = &event["choices"][0]["delta"];
                            if let Some(text) = delta["content"].as_str() {
                                if !text.is_empty() {
                                    let _ =
                                        tx.send(StreamChunk::TextDelta(text.to_string())).await;
                                }
                            }
                            if let Some(tcs) = delta["tool_calls"].as_array() {
                                for tc in tcs {
                                    let idx = tc["index"].as_u64().unwrap_or(0);
                                    let entry = tool_calls.entry(idx).or_default();
                                    if let Some(id) = tc["id"].as_str() {
                                        entry.0 = id.to_string();
                                    }
                                    if let Some(name) = tc["function"]["name"].as_str() {
                                        entry.1.push_str(name);
                                    }
                                    if let Some(args) = tc["function"]["arguments"].as_str() {
                                        entry.2.push_str(args);
                                    }
                                }
                            }
                            if let Some(fr) = event["choices"][0]["finish_reason"].as_str() {
                                finish_reason = Some(fr.to_string());
                            }
                            if let Some(usage) = event.get("usage") {
                                if let Some(pt) = usage["prompt_tokens"].as_u64() {
                                    input_tokens = pt as u32;
                                }
                                if let Some(ct) = usage["completion_tokens"].as_u64() {
                                    output_tokens = ct as u32;
                                }
                            }
                        }
                    }
                    let _ = tx.send(StreamChunk::Done(StopReason::EndTurn)).await;
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
        info!(provider = %self.provider_name, "checking API credentials");
        if self.api_key.is_empty() {
            return Err(ClawLiteError::AuthMissing(self.provider_name.clone()));
        }
        Ok(())
    }
}

/// Estimate cost for OpenAI models (USD per 1M tokens).
fn estimate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    let (input_per_m, output_per_m) = match model {
        m if m.starts_with("gpt-4o-mini") => (0.15, 0.60),
        m if m.starts_with("gpt-4o") => (2.50, 10.00),
        m if m.starts_with("o3-mini") => (1.10, 4.40),
        m if m.starts_with("o3") => (10.00, 40.00),
        _ => (2.50, 10.00),
    };
    (input_tokens as f64 * input_per_m + output_tokens as f64 * output_per_m) / 1_000_000.0
}
