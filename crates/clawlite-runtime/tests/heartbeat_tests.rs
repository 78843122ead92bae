use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use clawlite_config::WorkspaceLoader;
use clawlite_core::{EventBus, MessageBus, Result, SessionId};
use clawlite_runtime::{ActivityTracker, HeartbeatService, JobRunner};

/// Pops scripted responses, one per engine call.
struct ScriptedRunner {
    responses: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run_job(&self, _session_id: &SessionId, _prompt: &str) -> Result<String> {
        let mut responses = self.responses.lock();
        Ok(if responses.is_empty() {
            String::new()
        } else {
            responses.remove(0)
        })
    }
}

struct Setup {
    service: Arc<HeartbeatService>,
    bus: MessageBus,
    activity: Arc<ActivityTracker>,
    _dir: tempfile::TempDir,
}

fn setup(runner: Arc<dyn JobRunner>, heartbeat_md: &str) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let workspace = Arc::new(WorkspaceLoader::new(dir.path()));
    workspace.bootstrap().unwrap();
    std::fs::write(dir.path().join("HEARTBEAT.md"), heartbeat_md).unwrap();

    let (bus, _in_rx, _out_rx) = MessageBus::new(64, Duration::from_secs(300));
    let activity = ActivityTracker::new();
    let service = HeartbeatService::new(
        Duration::from_secs(60),
        runner,
        bus.clone(),
        EventBus::default(),
        Arc::clone(&activity),
        workspace,
    );
    Setup {
        service,
        bus,
        activity,
        _dir: dir,
    }
}

#[tokio::test]
async fn skip_decision_emits_zero_outbound_messages() {
    let runner = ScriptedRunner::new(&[r#"{"action":"skip","reason":"nothing due"}"#]);
    let s = setup(runner, "check the backups daily");
    s.activity
        .record(&SessionId::parse("telegram:42").unwrap(), None);

    s.service.tick().await;
    assert_eq!(s.bus.stats().outbound_depth, 0);
}

#[tokio::test]
async fn run_decision_emits_exactly_one_proactive_message() {
    let runner = ScriptedRunner::new(&[
        r#"{"action":"run","reason":"backup report is due"}"#,
        "Backups are green, nothing to do.",
    ]);
    let s = setup(runner, "check the backups daily");
    s.activity
        .record(&SessionId::parse("telegram:42").unwrap(), None);

    s.service.tick().await;
    assert_eq!(s.bus.stats().outbound_depth, 1);
}

#[tokio::test]
async fn malformed_decision_is_treated_as_skip() {
    // The model answers with free text instead of the structured decision
    let runner = ScriptedRunner::new(&["Everything looks fine to me!"]);
    let s = setup(runner, "check the backups daily");
    s.activity
        .record(&SessionId::parse("telegram:42").unwrap(), None);

    s.service.tick().await;
    assert_eq!(s.bus.stats().outbound_depth, 0);
}

#[tokio::test]
async fn empty_heartbeat_file_keeps_silent_without_engine_calls() {
    let runner = ScriptedRunner::new(&[r#"{"action":"run","reason":"should never be asked"}"#]);
    let s = setup(Arc::clone(&runner) as Arc<dyn JobRunner>, "# only comments\n\n");

    s.service.tick().await;
    assert_eq!(s.bus.stats().outbound_depth, 0);
    // The decide phase never ran
    assert_eq!(runner.responses.lock().len(), 1);
}
