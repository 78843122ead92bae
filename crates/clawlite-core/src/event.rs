use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events flowing through the runtime. Names follow the dotted form used in
/// logs: `channels.inbound.rejected`, `cron.fire.started`, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Channels ───────────────────────────────────────────────
    InboundReceived {
        session_id: String,
        channel: String,
    },
    InboundRejected {
        channel: String,
        sender_id: String,
        reason: String,
    },
    OutboundSent {
        channel: String,
        account: String,
        attempts: u32,
    },
    OutboundFailed {
        channel: String,
        code: String,
        fallback: String,
    },
    ChannelConnected {
        channel: String,
        account: String,
    },
    ChannelDisconnected {
        channel: String,
        account: String,
        reason: Option<String>,
    },

    // ── Engine ─────────────────────────────────────────────────
    RunStarted {
        session_id: String,
    },
    RunFinished {
        session_id: String,
        turns: u32,
    },
    RunCancelled {
        session_id: String,
    },
    SessionConsolidated {
        session_id: String,
    },

    // ── Scheduler ──────────────────────────────────────────────
    CronFireStarted {
        job_id: i64,
    },
    CronFireSkipped {
        job_id: i64,
    },
    CronFireFailed {
        job_id: i64,
        error: String,
    },
    HeartbeatDecision {
        action: String,
        reason: String,
    },

    // ── System ─────────────────────────────────────────────────
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Shutdown,
}

/// A broadcast-based event bus for runtime-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
