use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use clawlite_core::{ClawLiteError, Result};

use crate::adapter::{ChannelConnector, ChannelEvent, IncomingEvent};
use crate::outbound::backoff_duration;

const MAX_BACKOFF_SECS: u64 = 60;
const MAX_CONFLICT_RETRIES: u32 = 5;

/// Telegram connector using Bot API long-polling.
pub struct TelegramConnector {
    account: String,
    token: String,
    client: reqwest::Client,
    poll_timeout_secs: u64,
    connected: Arc<AtomicBool>,
    shutdown_tx: parking_lot::Mutex<Option<watch::Sender<bool>>>,
}

impl TelegramConnector {
    pub fn new(account: impl Into<String>, token: impl Into<String>, poll_timeout_secs: u64) -> Self {
        // Server-side long-poll timeout plus headroom for network latency;
        // a stalled connection must not hang the loop indefinitely.
        let poll_timeout_secs = poll_timeout_secs.clamp(5, 50);
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(poll_timeout_secs + 15))
            .pool_idle_timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            account: account.into(),
            token: token.into(),
            client,
            poll_timeout_secs,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown_tx: parking_lot::Mutex::new(None),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }
}

#[async_trait]
impl ChannelConnector for TelegramConnector {
    fn channel_type(&self) -> &str {
        "telegram"
    }

    fn account(&self) -> &str {
        &self.account
    }

    async fn start(&self) -> Result<mpsc::Receiver<ChannelEvent>> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let client = self.client.clone();
        let base_url = format!("https://api.telegram.org/bot{}", self.token);
        let poll_timeout = self.poll_timeout_secs;
        let connected = Arc::clone(&self.connected);
        let account = self.account.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            connected.store(true, Ordering::SeqCst);
            let _ = event_tx.send(ChannelEvent::Connected).await;
            info!(account = %account, "telegram long-poll started");

            let mut consecutive_failures: u32 = 0;
            let mut consecutive_conflicts: u32 = 0;

            loop {
                if *shutdown_rx.borrow() {
                    debug!(account = %account, "telegram poll loop: shutdown requested");
                    break;
                }
                if event_tx.is_closed() {
                    debug!(account = %account, "telegram poll loop: receiver dropped");
                    break;
                }

                let url = format!("{base_url}/getUpdates?offset={offset}&timeout={poll_timeout}");

                tokio::select! {
                    biased; // prefer the shutdown signal

                    _ = shutdown_rx.changed() => break,

                    result = client.get(&url).send() => match result {
                        Ok(resp) => {
                            let status = resp.status();
                            let data: serde_json::Value = match resp.json().await {
                                Ok(d) => d,
                                Err(e) => {
                                    warn!(account = %account, error = %e, "telegram poll: bad JSON response");
                                    consecutive_failures += 1;
                                    tokio::time::sleep(backoff_duration(consecutive_failures, MAX_BACKOFF_SECS)).await;
                                    continue;
                                }
                            };

                            if data["ok"].as_bool() != Some(true) {
                                let code = data["error_code"].as_i64().unwrap_or(status.as_u16() as i64);
                                let desc = data["description"].as_str().unwrap_or("unknown error");

                                // 409: another consumer is polling this token
                                if code == 409 {
                                    consecutive_conflicts += 1;
                                    error!(
                                        account = %account,
                                        attempt = consecutive_conflicts,
                                        "telegram 409 conflict: another getUpdates consumer owns this token"
                                    );
                                    if consecutive_conflicts >= MAX_CONFLICT_RETRIES {
                                        let _ = event_tx
                                            .send(ChannelEvent::Disconnected(Some(
                                                "409 conflict: token in use elsewhere".into(),
                                            )))
                                            .await;
                                        break;
                                    }
                                    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                                    continue;
                                }

                                warn!(account = %account, code, description = %desc, "telegram API error");
                                consecutive_failures += 1;
                                consecutive_conflicts = 0;

                                if code == 429 {
                                    let retry_after =
                                        data["parameters"]["retry_after"].as_u64().unwrap_or(5);
                                    tokio::time::sleep(std::time::Duration::from_secs(retry_after)).await;
                                } else {
                                    tokio::time::sleep(backoff_duration(consecutive_failures, MAX_BACKOFF_SECS)).await;
                                }
                                continue;
                            }

                            if consecutive_failures > 0 || consecutive_conflicts > 0 {
                                info!(account = %account, "telegram poll recovered");
                            }
                            consecutive_failures = 0;
                            consecutive_conflicts = 0;

                            if let Some(updates) = data["result"].as_array() {
                                for update in updates {
                                    if let Some(uid) = update["update_id"].as_i64() {
                                        offset = uid + 1;
                                    }
                                    let Some(event) = parse_update(update) else {
                                        continue;
                                    };
                                    if event_tx.send(ChannelEvent::Message(event)).await.is_err() {
                                        connected.store(false, Ordering::SeqCst);
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            if e.is_timeout() {
                                // Expected when no updates arrive — loop around
                                debug!(account = %account, "telegram long-poll timed out (no updates)");
                            } else {
                                warn!(account = %account, error = %e, "telegram poll network error");
                                consecutive_failures += 1;
                                tokio::time::sleep(backoff_duration(consecutive_failures, MAX_BACKOFF_SECS)).await;
                            }
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            info!(account = %account, "telegram long-poll stopped");
        });

        Ok(event_rx)
    }

    async fn send(&self, chat_id: &str, thread_id: Option<&str>, text: &str) -> Result<()> {
        // Markdown first, plain text retry when Telegram rejects the markup
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(thread) = thread_id {
            if let Ok(id) = thread.parse::<i64>() {
                body["message_thread_id"] = serde_json::json!(id);
            }
        }

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClawLiteError::ChannelUnavailable {
                channel: "telegram".into(),
                reason: e.to_string(),
            })?;
        if resp.status().is_success() {
            return Ok(());
        }

        debug!("telegram markdown send rejected, retrying as plain text");
        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClawLiteError::ChannelUnavailable {
                channel: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClawLiteError::ChannelUnavailable {
                channel: "telegram".into(),
                reason: format!("sendMessage failed: {text}"),
            });
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Turn a Telegram update into an [`IncomingEvent`]. Non-message updates
/// are skipped.
fn parse_update(update: &serde_json::Value) -> Option<IncomingEvent> {
    let msg = update.get("message")?;
    let chat_id = msg["chat"]["id"].as_i64()?.to_string();
    let thread_id = msg["message_thread_id"].as_i64().map(|id| id.to_string());
    Some(IncomingEvent {
        id: msg["message_id"].as_i64().unwrap_or_default().to_string(),
        sender_id: msg["from"]["id"].as_i64().unwrap_or_default().to_string(),
        sender_name: msg["from"]["first_name"].as_str().map(String::from),
        chat_id,
        thread_id,
        text: msg["text"].as_str().map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_message() {
        let update = serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 7,
                "from": { "id": 123, "first_name": "Ada" },
                "chat": { "id": 42 },
                "text": "hello"
            }
        });
        let event = parse_update(&update).unwrap();
        assert_eq!(event.sender_id, "123");
        assert_eq!(event.chat_id, "42");
        assert_eq!(event.thread_id, None);
        assert_eq!(event.text.as_deref(), Some("hello"));
    }

    #[test]
    fn parse_threaded_message() {
        let update = serde_json::json!({
            "update_id": 11,
            "message": {
                "message_id": 8,
                "message_thread_id": 99,
                "from": { "id": 123 },
                "chat": { "id": 42 },
                "text": "in a topic"
            }
        });
        let event = parse_update(&update).unwrap();
        assert_eq!(event.thread_id.as_deref(), Some("99"));
    }

    #[test]
    fn non_message_updates_are_skipped() {
        let update = serde_json::json!({ "update_id": 12, "edited_message": {} });
        assert!(parse_update(&update).is_none());
    }
}
