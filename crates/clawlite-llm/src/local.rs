use async_trait::async_trait;
use tracing::info;

use clawlite_core::{ClawLiteError, Result, Role};

use crate::provider::*;

/// Local model provider — wraps an Ollama-compatible inference server.
/// Used for the offline fallback when every remote provider fails.
pub struct LocalProvider {
    client: reqwest::Client,
    base_url: String,
    model_name: String,
}

impl LocalProvider {
    pub fn new(base_url: String, model_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model_name,
        }
    }

    fn build_messages(request: &ChatRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for msg in &request.messages {
            let content = match msg.role {
                Role::Tool => msg.tool_result.clone().unwrap_or_default(),
                _ => msg.text.clone(),
            };
            messages.push(serde_json::json!({ "role": msg.role.as_str(), "content": content }));
        }
        messages
    }
}

#[async_trait]
impl ChatProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn models(&self) -> Vec<String> {
        vec![self.model_name.clone()]
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = serde_json::json!({
            "model": &request.model,
            "messages": Self::build_messages(request),
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClawLiteError::ProviderSendFailed(format!("local: {e}")))?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClawLiteError::ProviderSendFailed(format!(
                "local model error: {text}"
            )));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ClawLiteError::ProviderSendFailed(e.to_string()))?;

        Ok(ChatResponse {
            text: data["message"]["content"].as_str().unwrap_or("").to_string(),
            tool_calls: vec![],
            usage: Usage {
                input_tokens: data["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["eval_count"].as_u64().unwrap_or(0) as u32,
                estimated_cost_usd: 0.0, // local inference is free
            },
            stop_reason: StopReason::EndTurn,
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let body = serde_json::json!({
            "model": &request.model,
            "messages": Self::build_messages(request),
            "stream": true,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });
        let client = self.client.clone();
        let base_url = self.base_url.clone();

        tokio::spawn(async move {
            let resp = client
                .post(format!("{base_url}/api/chat"))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(resp) if resp.status().is_success() => {
                    use futures::StreamExt;
                    let mut stream = resp.bytes_stream();
                    let mut buffer = String::new();

                    while let Some(chunk_result) = stream.next().await {
                        let bytes = match chunk_result {
                            Ok(b) => b,
                            Err(e) => {
                                let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                                return;
                            }
                        };
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        // Ollama sends newline-delimited JSON
                        while let Some(newline_pos) = buffer.find('\n') {
                            let line = buffer[..newline_pos].trim().to_string();
                            buffer = buffer[newline_pos + 1..].to_string();
                            if line.is_empty() {
                                continue;
                            }
                            let Ok(event) = serde_json::from_str::<serde_json::Value>(&line)
                            else {
                                continue;
                            };
                            if let Some(content) = event["message"]["content"].as_str() {
                                if !content.is_empty() {
                                    let _ = tx
                                        .send(StreamChunk::TextDelta(content.to_string()))
                                        .await;
                                }
                            }
                            if event["done"].as_bool() == Some(true) {
                                let _ = tx
                                    .send(StreamChunk::Usage(Usage {
                                        input_tokens: event["prompt_eval_count"]
                                            .as_u64()
                                            .unwrap_or(0)
                                            as u32,
                                        output_tokens: event["eval_count"].as_u64().unwrap_or(0)
                                            as u32,
                                        estimated_cost_usd: 0.0,
                                    }))
                                    .await;
                                let _ = tx.send(StreamChunk::Done(StopReason::EndTurn)).await;
                                return;
                            }
                        }
                    }
                    let _ = tx.send(StreamChunk::Done(StopReason::EndTurn)).await;
                }
                Ok(resp) => {
                    let text = resp.text().await.unwrap_or_default();
                    let _ = tx.send(StreamChunk::Error(text)).await;
                }
                Err(e) => {
                    let _ = tx.send(StreamChunk::Error(format!("local: {e}"))).await;
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        info!(base_url = %self.base_url, "probing local model server");
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| ClawLiteError::ProviderSendFailed(format!("local unreachable: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClawLiteError::ProviderSendFailed(
                "local model server unhealthy".into(),
            ))
        }
    }
}
