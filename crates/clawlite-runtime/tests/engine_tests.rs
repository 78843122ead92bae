use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use clawlite_config::{AppConfig, WorkspaceLoader};
use clawlite_core::{EventBus, MessageBus, Result, Role, SessionId, Tool};
use clawlite_llm::mock::MockProvider;
use clawlite_llm::ProviderRouter;
use clawlite_memory::{MemoryIndex, SessionStore};
use clawlite_runtime::cancel::CancelRegistry;
use clawlite_runtime::subagent::SubagentManager;
use clawlite_runtime::{AgentEngine, ToolContext, ToolHandler, ToolRegistry};
use clawlite_skills::SkillRegistry;

struct Harness {
    engine: Arc<AgentEngine>,
    sessions: Arc<SessionStore>,
    memory: Arc<MemoryIndex>,
    tools: Arc<ToolRegistry>,
    _dir: tempfile::TempDir,
}

fn harness_with(mock: MockProvider, max_turns: u32) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.provider.model = "mock/test-model".into();
    config.engine.max_turns = max_turns;
    config.workspace_path = dir.path().join("workspace");
    config.state_path = dir.path().join("state");
    let config = Arc::new(RwLock::new(config));

    let mut router = ProviderRouter::new(vec![], None);
    router.add_provider(Arc::new(mock));

    let sessions = Arc::new(SessionStore::open(dir.path().join("state/sessions")).unwrap());
    let memory = Arc::new(MemoryIndex::open(dir.path().join("state/memory.jsonl")).unwrap());
    let skills = Arc::new(RwLock::new(SkillRegistry::new_empty()));
    let workspace = Arc::new(WorkspaceLoader::new(dir.path().join("workspace")));
    let tools = Arc::new(ToolRegistry::new(Duration::from_secs(30)));

    let engine = AgentEngine::new(
        config,
        Arc::new(router),
        Arc::clone(&tools),
        Arc::clone(&sessions),
        Arc::clone(&memory),
        skills,
        workspace,
        CancelRegistry::new(),
        EventBus::default(),
    );

    Harness {
        engine,
        sessions,
        memory,
        tools,
        _dir: dir,
    }
}

fn sid(s: &str) -> SessionId {
    SessionId::parse(s).unwrap()
}

struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    async fn run(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        Ok(args["word"].as_str().unwrap_or("").to_string())
    }
}

fn echo_def() -> Tool {
    Tool {
        name: "echo".into(),
        description: "Echo a word".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": { "word": { "type": "string" } },
            "required": ["word"]
        }),
    }
}

struct SleepTool;

#[async_trait]
impl ToolHandler for SleepTool {
    async fn run(&self, _args: &serde_json::Value, _ctx: &ToolContext) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok("woke up".into())
    }
}

// ── S1: chat round-trip ────────────────────────────────────────

#[tokio::test]
async fn chat_round_trip_writes_user_then_assistant() {
    let h = harness_with(MockProvider::new("mock").with_response("pong"), 8);
    let session = sid("cli:demo");

    let result = h.engine.run(&session, "say the word pong").await.unwrap();
    assert!(result.text.contains("pong"));
    assert_eq!(result.meta.mode, "online");
    assert_eq!(result.meta.turns, 1);

    let log = h.sessions.read_all(&session).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[0].text, "say the word pong");
    assert_eq!(log[1].role, Role::Assistant);
    assert!(log[1].text.contains("pong"));
}

// ── Tool-call loop ─────────────────────────────────────────────

#[tokio::test]
async fn tool_call_loop_dispatches_and_feeds_result_back() {
    let mock = MockProvider::new("mock")
        .with_tool_call("echo", serde_json::json!({"word": "ping"}))
        .with_response("the tool said ping");
    let h = harness_with(mock, 8);
    h.tools.register(echo_def(), Arc::new(EchoTool)).unwrap();

    let session = sid("cli:tools");
    let result = h.engine.run(&session, "use the echo tool").await.unwrap();
    assert_eq!(result.text, "the tool said ping");
    assert_eq!(result.meta.turns, 2);

    let log = h.sessions.read_all(&session).unwrap();
    // user, assistant(tool_calls), tool record, final assistant
    assert_eq!(log.len(), 4);
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(log[1].tool_calls.len(), 1);
    assert_eq!(log[2].role, Role::Tool);
    assert_eq!(log[2].tool_name.as_deref(), Some("echo"));
    assert_eq!(log[2].tool_result.as_deref(), Some("ping"));
    assert_eq!(log[3].role, Role::Assistant);
}

#[tokio::test]
async fn tool_errors_are_returned_to_the_model_not_the_caller() {
    let mock = MockProvider::new("mock")
        .with_tool_call("ghost", serde_json::json!({}))
        .with_response("recovered without the tool");
    let h = harness_with(mock, 8);

    let session = sid("cli:toolerr");
    let result = h.engine.run(&session, "try a missing tool").await.unwrap();
    assert_eq!(result.text, "recovered without the tool");

    let log = h.sessions.read_all(&session).unwrap();
    let tool_record = log.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_record
        .tool_result
        .as_deref()
        .unwrap()
        .contains("tool_not_found"));
}

#[tokio::test]
async fn max_turns_surfaces_a_brief_assistant_message() {
    // The model keeps asking for tools and never produces final text
    let mock = MockProvider::new("mock")
        .with_tool_call("echo", serde_json::json!({"word": "a"}))
        .with_tool_call("echo", serde_json::json!({"word": "b"}))
        .with_tool_call("echo", serde_json::json!({"word": "c"}));
    let h = harness_with(mock, 2);
    h.tools.register(echo_def(), Arc::new(EchoTool)).unwrap();

    let session = sid("cli:loop");
    let result = h.engine.run(&session, "loop forever").await.unwrap();
    assert_eq!(result.meta.reason, "max_turns_exceeded");
    assert!(!result.text.is_empty());

    let log = h.sessions.read_all(&session).unwrap();
    assert_eq!(log.last().unwrap().role, Role::Assistant);
}

// ── S5: cancellation via /stop ─────────────────────────────────

#[tokio::test]
async fn stop_cancels_in_flight_run_within_a_quantum() {
    let mock = MockProvider::new("mock").with_tool_call("sleep", serde_json::json!({}));
    let h = harness_with(mock, 8);
    h.tools
        .register(
            Tool {
                name: "sleep".into(),
                description: "sleeps for a long time".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            },
            Arc::new(SleepTool),
        )
        .unwrap();

    let session = sid("telegram:42");
    let engine = Arc::clone(&h.engine);
    let run_session = session.clone();
    let run = tokio::spawn(async move { engine.run(&run_session, "start a long tool").await });

    // Let the run reach the tool call, then stop the session
    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = std::time::Instant::now();
    let stop_result = h.engine.stop_session(&session).await;
    assert_eq!(stop_result.text, "Cancelled.");
    assert_eq!(stop_result.meta.reason, "session_cancelled");

    let outcome = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("cancellation must land within one scheduling quantum")
        .unwrap();
    assert_eq!(outcome.unwrap_err().kind(), "session_cancelled");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stop_message_returns_standardized_reply() {
    let h = harness_with(MockProvider::new("mock"), 8);
    let result = h.engine.run(&sid("cli:idle"), "/stop").await.unwrap();
    assert_eq!(result.text, "Cancelled.");
    assert_eq!(result.meta.reason, "session_cancelled");
}

// ── Per-session serialization ──────────────────────────────────

#[tokio::test]
async fn runs_on_one_session_never_interleave() {
    use clawlite_llm::mock::MockResponse;
    let mock = MockProvider::new("mock")
        .with_mock_response(MockResponse::text("first reply").with_delay(Duration::from_millis(150)))
        .with_mock_response(MockResponse::text("second reply").with_delay(Duration::from_millis(50)));
    let h = harness_with(mock, 8);
    let session = sid("cli:serial");

    let e1 = Arc::clone(&h.engine);
    let s1 = session.clone();
    let first = tokio::spawn(async move { e1.run(&s1, "first").await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let e2 = Arc::clone(&h.engine);
    let s2 = session.clone();
    let second = tokio::spawn(async move { e2.run(&s2, "second").await });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let log = h.sessions.read_all(&session).unwrap();
    let texts: Vec<&str> = log.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["first", "first reply", "second", "second reply"],
        "second run must queue behind the first, never interleave"
    );
}

// ── Consolidation ──────────────────────────────────────────────

#[tokio::test]
async fn consolidation_appends_tagged_memory_once() {
    let mock = MockProvider::new("mock")
        .with_response("pong")
        .with_response("Summary: the operator asked for pong.");
    let h = harness_with(mock, 8);
    let session = sid("cli:consolidate");

    h.engine.run(&session, "say pong").await.unwrap();

    assert!(h.engine.consolidate_session(&session).await.unwrap());
    let entries = h.memory.all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source_tag, "session:cli:consolidate");

    // A duplicate trigger inside the debounce window is dropped
    assert!(!h.engine.consolidate_session(&session).await.unwrap());
    assert_eq!(h.memory.count(), 1);
}

// ── Provider fallback metadata ─────────────────────────────────

#[tokio::test]
async fn fallback_is_visible_in_meta() {
    use clawlite_llm::mock::MockError;
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.provider.model = "mock/test-model".into();
    config.provider.fallback = vec!["backup/test-model".into()];
    config.workspace_path = dir.path().join("workspace");
    config.state_path = dir.path().join("state");

    let mut router = ProviderRouter::new(config.provider.fallback.clone(), None);
    router.add_provider(Arc::new(
        MockProvider::new("mock").with_error(MockError::SendFailed),
    ));
    router.add_provider(Arc::new(MockProvider::new("backup").with_response("from backup")));

    let sessions = Arc::new(SessionStore::open(dir.path().join("state/sessions")).unwrap());
    let memory = Arc::new(MemoryIndex::open(dir.path().join("state/memory.jsonl")).unwrap());
    let engine = AgentEngine::new(
        Arc::new(RwLock::new(config)),
        Arc::new(router),
        Arc::new(ToolRegistry::new(Duration::from_secs(5))),
        sessions,
        memory,
        Arc::new(RwLock::new(SkillRegistry::new_empty())),
        Arc::new(WorkspaceLoader::new(dir.path().join("workspace"))),
        CancelRegistry::new(),
        EventBus::default(),
    );

    let result = engine.run(&sid("cli:fb"), "hello").await.unwrap();
    assert_eq!(result.text, "from backup");
    assert_eq!(result.meta.mode, "fallback");
    assert_eq!(result.meta.model, "backup/test-model");
}

// ── Subagents ──────────────────────────────────────────────────

#[tokio::test]
async fn subagent_result_lands_on_the_parent_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.provider.model = "mock/test-model".into();
    config.workspace_path = dir.path().join("workspace");
    config.state_path = dir.path().join("state");

    let mut router = ProviderRouter::new(vec![], None);
    router.add_provider(Arc::new(MockProvider::new("mock").with_response("researched it")));

    let (bus, _in_rx, mut out_rx) = MessageBus::new(64, Duration::from_secs(300));
    let sessions = Arc::new(SessionStore::open(dir.path().join("state/sessions")).unwrap());
    let memory = Arc::new(MemoryIndex::open(dir.path().join("state/memory.jsonl")).unwrap());
    let engine = AgentEngine::new(
        Arc::new(RwLock::new(config)),
        Arc::new(router),
        Arc::new(ToolRegistry::new(Duration::from_secs(5))),
        sessions,
        memory,
        Arc::new(RwLock::new(SkillRegistry::new_empty())),
        Arc::new(WorkspaceLoader::new(dir.path().join("workspace"))),
        CancelRegistry::new(),
        EventBus::default(),
    );
    let subagents = SubagentManager::new(Arc::clone(&engine), bus.clone());

    let parent = sid("telegram:42");
    let run_id = subagents.spawn(&parent, "research something").await;
    assert!(!run_id.is_empty());

    let msg = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
        .await
        .expect("subagent result must be published")
        .unwrap();
    assert_eq!(msg.session_id, parent);
    assert!(msg.text.contains("researched it"));
}
