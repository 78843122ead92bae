use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use clawlite_config::WorkspaceLoader;
use clawlite_core::{
    Event, EventBus, MessageBus, OutboundMessage, ReplyHandle, SessionId,
};

use crate::scheduler::JobRunner;

const HEARTBEAT_SESSION: &str = "heartbeat:system";

/// Structured heartbeat decision. Anything the model returns that does not
/// parse into this shape is rejected and treated as a skip — no string
/// matching against free text.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatDecision {
    pub action: String,
    #[serde(default)]
    pub reason: String,
}

/// Extract a decision from assistant output, tolerating fenced JSON blocks.
pub fn parse_decision(raw: &str) -> Option<HeartbeatDecision> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    let text = text.trim_end_matches("```").trim();

    let candidate = if text.starts_with('{') {
        text.to_string()
    } else {
        // Last resort: first {...} span in the output
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        text[start..=end].to_string()
    };

    let decision: HeartbeatDecision = serde_json::from_str(&candidate).ok()?;
    match decision.action.as_str() {
        "skip" | "run" => Some(decision),
        _ => None,
    }
}

/// Tracks the most recent inbound activity per session, so proactive
/// messages land where the operator actually is.
pub struct ActivityTracker {
    inner: Mutex<HashMap<String, (DateTime<Utc>, Option<ReplyHandle>)>>,
}

impl ActivityTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
        })
    }

    pub fn record(&self, session_id: &SessionId, reply_handle: Option<ReplyHandle>) {
        self.inner
            .lock()
            .insert(session_id.to_string(), (Utc::now(), reply_handle));
    }

    /// The session with the most recent inbound activity.
    pub fn most_recent(&self) -> Option<(SessionId, Option<ReplyHandle>)> {
        let inner = self.inner.lock();
        inner
            .iter()
            .max_by_key(|(_, (at, _))| *at)
            .and_then(|(sid, (_, handle))| {
                SessionId::parse(sid).ok().map(|s| (s, handle.clone()))
            })
    }

    pub fn last_activity(&self, session_id: &SessionId) -> Option<DateTime<Utc>> {
        self.inner.lock().get(session_id.as_str()).map(|(at, _)| *at)
    }

    /// Remove and return sessions idle for longer than `idle`.
    pub fn drain_idle(&self, idle: Duration) -> Vec<SessionId> {
        let cutoff = Utc::now() - chrono::Duration::from_std(idle).unwrap_or_default();
        let mut inner = self.inner.lock();
        let idle_ids: Vec<String> = inner
            .iter()
            .filter(|(_, (at, _))| *at < cutoff)
            .map(|(sid, _)| sid.clone())
            .collect();
        idle_ids
            .into_iter()
            .filter_map(|sid| {
                inner.remove(&sid);
                SessionId::parse(&sid).ok()
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Periodic, model-driven decision point. Two phases per tick: decide
/// (structured skip/run), then act (one proactive message at most).
pub struct HeartbeatService {
    interval: Duration,
    runner: Arc<dyn JobRunner>,
    bus: MessageBus,
    events: EventBus,
    activity: Arc<ActivityTracker>,
    workspace: Arc<WorkspaceLoader>,
}

/// True when the heartbeat file carries only blanks and '#' comments.
fn is_effectively_empty(content: &str) -> bool {
    content
        .lines()
        .all(|line| line.trim().is_empty() || line.trim().starts_with('#'))
}

impl HeartbeatService {
    pub fn new(
        interval: Duration,
        runner: Arc<dyn JobRunner>,
        bus: MessageBus,
        events: EventBus,
        activity: Arc<ActivityTracker>,
        workspace: Arc<WorkspaceLoader>,
    ) -> Arc<Self> {
        Arc::new(Self {
            interval: interval.max(Duration::from_secs(5)),
            runner,
            bus,
            events,
            activity,
            workspace,
        })
    }

    fn decide_prompt(content: &str) -> String {
        format!(
            "You are the heartbeat planner. Reply with ONLY this JSON shape:\n\
             {{\"action\":\"skip|run\",\"reason\":\"why\"}}\n\n\
             Rules:\n\
             - action=skip when there is nothing actionable right now;\n\
             - action=run only when an immediate proactive step exists.\n\n\
             [HEARTBEAT.md]\n{content}"
        )
    }

    /// One heartbeat cycle. Emits at most one proactive message.
    pub async fn tick(&self) {
        let Some(content) = self.workspace.read_one("HEARTBEAT.md") else {
            debug!("heartbeat: no HEARTBEAT.md, staying silent");
            return;
        };
        if is_effectively_empty(&content) {
            debug!("heartbeat: HEARTBEAT.md empty, staying silent");
            return;
        }

        let session = SessionId::parse(HEARTBEAT_SESSION).expect("static id");

        // Phase 1: decide
        let raw = match self
            .runner
            .run_job(&session, &Self::decide_prompt(&content))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "heartbeat decide phase failed");
                return;
            }
        };
        let decision = match parse_decision(&raw) {
            Some(d) => d,
            None => {
                warn!("heartbeat.decision.invalid: malformed decision output, treating as skip");
                self.events.publish(Event::HeartbeatDecision {
                    action: "skip".into(),
                    reason: "malformed decision".into(),
                });
                return;
            }
        };
        self.events.publish(Event::HeartbeatDecision {
            action: decision.action.clone(),
            reason: decision.reason.clone(),
        });

        if decision.action == "skip" {
            debug!(reason = %decision.reason, "heartbeat: skip");
            return;
        }

        // Phase 2: act — a follow-up run produces the proactive message
        let act_prompt = if decision.reason.is_empty() {
            content
        } else {
            decision.reason.clone()
        };
        let text = match self.runner.run_job(&session, &act_prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "heartbeat act phase failed");
                return;
            }
        };
        if text.trim().is_empty() {
            return;
        }

        // Dispatch to wherever the operator was last seen
        let Some((target_session, reply_handle)) = self.activity.most_recent() else {
            info!("heartbeat: proactive message produced but no active session to deliver to");
            return;
        };
        let msg = OutboundMessage::text(target_session, reply_handle, text);
        if let Err(e) = self.bus.publish_outbound(msg).await {
            warn!(error = %e, "heartbeat proactive publish failed");
        }
    }

    /// Run the heartbeat loop. Failures never kill the loop.
    pub async fn run(self: Arc<Self>) {
        info!(interval_s = self.interval.as_secs(), "heartbeat loop started");
        loop {
            tokio::time::sleep(self.interval).await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_decisions() {
        let d = parse_decision(r#"{"action":"skip","reason":"nothing due"}"#).unwrap();
        assert_eq!(d.action, "skip");

        let d = parse_decision("```json\n{\"action\":\"run\",\"reason\":\"report\"}\n```").unwrap();
        assert_eq!(d.action, "run");
        assert_eq!(d.reason, "report");

        // Embedded JSON in prose
        let d = parse_decision("Sure! {\"action\":\"skip\"} hope that helps").unwrap();
        assert_eq!(d.action, "skip");
    }

    #[test]
    fn malformed_decisions_are_rejected() {
        assert!(parse_decision("HEARTBEAT_OK").is_none());
        assert!(parse_decision("{\"action\":\"maybe\"}").is_none());
        assert!(parse_decision("not json at all").is_none());
        assert!(parse_decision("{\"reason\":\"no action\"}").is_none());
    }

    #[test]
    fn empty_heartbeat_file_detection() {
        assert!(is_effectively_empty(""));
        assert!(is_effectively_empty("# just a comment\n\n   \n# another"));
        assert!(!is_effectively_empty("# comment\ncheck the backups"));
    }

    #[test]
    fn activity_tracker_most_recent_wins() {
        let tracker = ActivityTracker::new();
        tracker.record(&SessionId::parse("telegram:1").unwrap(), None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        tracker.record(&SessionId::parse("telegram:2").unwrap(), None);

        let (recent, _) = tracker.most_recent().unwrap();
        assert_eq!(recent.as_str(), "telegram:2");
    }

    #[test]
    fn drain_idle_removes_only_stale_sessions() {
        let tracker = ActivityTracker::new();
        tracker.record(&SessionId::parse("telegram:1").unwrap(), None);
        // Nothing is older than an hour
        assert!(tracker.drain_idle(Duration::from_secs(3600)).is_empty());
        // Everything is older than zero seconds
        std::thread::sleep(std::time::Duration::from_millis(5));
        let drained = tracker.drain_idle(Duration::ZERO);
        assert_eq!(drained.len(), 1);
        assert_eq!(tracker.session_count(), 0);
    }
}
