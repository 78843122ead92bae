use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::{ClawLiteError, Result};
use crate::session::SessionId;

/// Correlation token a channel needs to direct a reply back to its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyHandle {
    pub channel: String,
    pub account: String,
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// A message flowing from a channel into the engine.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub session_id: SessionId,
    pub sender_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub reply_handle: Option<ReplyHandle>,
}

impl InboundMessage {
    pub fn new(session_id: SessionId, sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id,
            sender_id: sender_id.into(),
            text: text.into(),
            received_at: Utc::now(),
            reply_handle: None,
        }
    }

    pub fn with_reply_handle(mut self, handle: ReplyHandle) -> Self {
        self.reply_handle = Some(handle);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    Text,
    Audio,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// A message flowing from the engine out to a channel.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub session_id: SessionId,
    pub reply_handle: Option<ReplyHandle>,
    pub text: String,
    pub kind: OutboundKind,
    pub priority: Priority,
    pub idempotency_key: String,
}

impl OutboundMessage {
    /// A plain text reply. The idempotency key is derived from the
    /// destination and content when the producer does not supply one.
    pub fn text(session_id: SessionId, reply_handle: Option<ReplyHandle>, text: impl Into<String>) -> Self {
        let text = text.into();
        let target = reply_handle
            .as_ref()
            .map(|h| h.chat_id.clone())
            .unwrap_or_else(|| session_id.as_str().to_string());
        let key = idempotency_key(session_id.channel(), &target, &text);
        Self {
            session_id,
            reply_handle,
            text,
            kind: OutboundKind::Text,
            priority: Priority::Normal,
            idempotency_key: key,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }
}

/// Stable in-process idempotency key for an outbound send.
pub fn idempotency_key(channel: &str, target: &str, text: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    channel.hash(&mut hasher);
    target.hash(&mut hasher);
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Queue depth snapshot for the status surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStats {
    pub inbound_depth: usize,
    pub outbound_depth: usize,
}

/// Typed inbound/outbound queues decoupling channels from the engine.
///
/// Publishing inbound is non-blocking up to the bounded capacity; past it
/// the caller (a channel poller) is suspended, which is the backpressure
/// contract. Inbound delivery is FIFO per session because a single bounded
/// queue preserves producer order; cross-session fairness (no session holds
/// more than one concurrent dispatch) is enforced by the runtime's
/// per-session workers, not here.
///
/// Outbound publishes carry an idempotency key; repeated publishes with the
/// same key inside the dedupe window are coalesced into a single delivery.
#[derive(Clone)]
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    recent_outbound: Arc<Mutex<HashMap<String, Instant>>>,
    dedupe_window: Duration,
    inbound_depth: Arc<AtomicUsize>,
    outbound_depth: Arc<AtomicUsize>,
}

/// Receiving half of the inbound queue. Consumed by the runtime dispatcher.
pub struct InboundReceiver {
    rx: mpsc::Receiver<InboundMessage>,
    depth: Arc<AtomicUsize>,
}

impl InboundReceiver {
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        let msg = self.rx.recv().await;
        if msg.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        msg
    }
}

/// Receiving half of the outbound queue. Consumed by the channel manager.
pub struct OutboundReceiver {
    rx: mpsc::Receiver<OutboundMessage>,
    depth: Arc<AtomicUsize>,
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        let msg = self.rx.recv().await;
        if msg.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        msg
    }
}

impl MessageBus {
    pub fn new(capacity: usize, dedupe_window: Duration) -> (Self, InboundReceiver, OutboundReceiver) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let inbound_depth = Arc::new(AtomicUsize::new(0));
        let outbound_depth = Arc::new(AtomicUsize::new(0));
        let bus = Self {
            inbound_tx,
            outbound_tx,
            recent_outbound: Arc::new(Mutex::new(HashMap::new())),
            dedupe_window,
            inbound_depth: Arc::clone(&inbound_depth),
            outbound_depth: Arc::clone(&outbound_depth),
        };
        (
            bus,
            InboundReceiver {
                rx: inbound_rx,
                depth: inbound_depth,
            },
            OutboundReceiver {
                rx: outbound_rx,
                depth: outbound_depth,
            },
        )
    }

    /// Publish an inbound message. Suspends the caller when the queue is at
    /// capacity; a dropped message is never silent.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound_depth.fetch_add(1, Ordering::SeqCst);
        self.inbound_tx.send(msg).await.map_err(|_| {
            self.inbound_depth.fetch_sub(1, Ordering::SeqCst);
            ClawLiteError::Session("inbound queue closed".into())
        })
    }

    /// Publish an outbound message. Returns `false` when the publish was
    /// coalesced with a recent one carrying the same idempotency key.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<bool> {
        {
            let mut recent = self.recent_outbound.lock().unwrap();
            let now = Instant::now();
            recent.retain(|_, seen| now.duration_since(*seen) <= self.dedupe_window);
            if recent.contains_key(&msg.idempotency_key) {
                tracing::debug!(key = %msg.idempotency_key, "outbound publish coalesced");
                return Ok(false);
            }
            recent.insert(msg.idempotency_key.clone(), now);
        }
        self.outbound_depth.fetch_add(1, Ordering::SeqCst);
        self.outbound_tx.send(msg).await.map_err(|_| {
            self.outbound_depth.fetch_sub(1, Ordering::SeqCst);
            ClawLiteError::Session("outbound queue closed".into())
        })?;
        Ok(true)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            inbound_depth: self.inbound_depth.load(Ordering::SeqCst),
            outbound_depth: self.outbound_depth.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn inbound_is_fifo() {
        let (bus, mut rx, _orx) = MessageBus::new(16, Duration::from_secs(300));
        for i in 0..5 {
            bus.publish_inbound(InboundMessage::new(sid("cli:demo"), "op", format!("m{i}")))
                .await
                .unwrap();
        }
        for i in 0..5 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.text, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn outbound_dedupes_within_window() {
        let (bus, _rx, mut orx) = MessageBus::new(16, Duration::from_secs(300));
        let msg = OutboundMessage::text(sid("cli:demo"), None, "hello");
        assert!(bus.publish_outbound(msg.clone()).await.unwrap());
        assert!(!bus.publish_outbound(msg.clone()).await.unwrap());
        assert!(!bus.publish_outbound(msg).await.unwrap());

        // Exactly one delivery
        assert!(orx.recv().await.is_some());
        assert_eq!(bus.stats().outbound_depth, 0);
    }

    #[tokio::test]
    async fn outbound_window_expiry_allows_resend() {
        let (bus, _rx, mut orx) = MessageBus::new(16, Duration::from_millis(10));
        let msg = OutboundMessage::text(sid("cli:demo"), None, "hello");
        assert!(bus.publish_outbound(msg.clone()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(bus.publish_outbound(msg).await.unwrap());
        assert!(orx.recv().await.is_some());
        assert!(orx.recv().await.is_some());
    }

    #[tokio::test]
    async fn depth_counters_track_queue() {
        let (bus, mut rx, _orx) = MessageBus::new(16, Duration::from_secs(300));
        bus.publish_inbound(InboundMessage::new(sid("cli:demo"), "op", "hi"))
            .await
            .unwrap();
        assert_eq!(bus.stats().inbound_depth, 1);
        rx.recv().await.unwrap();
        assert_eq!(bus.stats().inbound_depth, 0);
    }

    #[test]
    fn idempotency_key_is_stable() {
        let a = idempotency_key("telegram", "42", "hi");
        let b = idempotency_key("telegram", "42", "hi");
        let c = idempotency_key("telegram", "42", "yo");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
