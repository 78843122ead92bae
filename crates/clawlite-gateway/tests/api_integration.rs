//! Gateway integration tests — exercise the HTTP surface with a mock LLM.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use clawlite_config::{AppConfig, WorkspaceLoader};
use clawlite_core::EventBus;
use clawlite_gateway::{build_router, GatewayState};
use clawlite_llm::mock::MockProvider;
use clawlite_llm::ProviderRouter;
use clawlite_memory::{MemoryIndex, SessionStore};
use clawlite_runtime::cancel::CancelRegistry;
use clawlite_runtime::scheduler::CronStore;
use clawlite_runtime::{AgentEngine, CronHandle, ToolRegistry};
use clawlite_skills::SkillRegistry;

const TOKEN: &str = "test-bearer-token";

fn setup(responses: Vec<&str>) -> (axum::Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let mut mock = MockProvider::new("mock");
    for r in responses {
        mock = mock.with_response(r);
    }
    let mut router = ProviderRouter::new(vec![], None);
    router.add_provider(Arc::new(mock));

    let mut config = AppConfig::default();
    config.provider.model = "mock/test-model".into();
    config.workspace_path = dir.path().join("workspace");
    config.state_path = dir.path().join("state");

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

    let cron_store = Arc::new(CronStore::open_in_memory().unwrap());
    let cron = CronHandle::new(cron_store, chrono_tz::UTC);

    let state = GatewayState::new(
        engine,
        cron,
        TOKEN.into(),
        Arc::new(|| serde_json::json!({"model": "mock/test-model", "uptime_secs": 0})),
    );
    (build_router(state), dir)
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
    req.header("authorization", format!("Bearer {TOKEN}"))
        .header("content-type", "application/json")
}

// ── Health ─────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_unauthenticated() {
    let (app, _dir) = setup(vec![]);
    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["ok"], true);
    assert!(json["uptime_seconds"].is_number());
    assert!(json["connections"].is_number());
}

// ── Auth ───────────────────────────────────────────────────────

#[tokio::test]
async fn missing_or_wrong_token_is_401() {
    let (app, _dir) = setup(vec![]);

    let resp = app
        .clone()
        .oneshot(
            Request::post("/v1/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"session_id":"cli:x","text":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(
            Request::post("/v1/chat")
                .header("authorization", "Bearer wrong")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"session_id":"cli:x","text":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// ── S1 over HTTP ───────────────────────────────────────────────

#[tokio::test]
async fn chat_round_trip() {
    let (app, _dir) = setup(vec!["pong"]);
    let resp = app
        .oneshot(
            authed(Request::post("/v1/chat"))
                .body(Body::from(
                    r#"{"session_id":"cli:demo","text":"say the word pong"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert!(json["text"].as_str().unwrap().contains("pong"));
    assert_eq!(json["meta"]["mode"], "online");
    assert!(json["meta"]["model"].is_string());
}

#[tokio::test]
async fn chat_with_invalid_body_is_400() {
    let (app, _dir) = setup(vec![]);
    let resp = app
        .clone()
        .oneshot(
            authed(Request::post("/v1/chat"))
                .body(Body::from(r#"{"text":"no session"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .oneshot(
            authed(Request::post("/v1/chat"))
                .body(Body::from(r#"{"session_id":"malformed","text":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_without_reachable_provider_is_503() {
    use clawlite_llm::mock::MockError;
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::default();
    config.provider.model = "mock/test-model".into();
    config.workspace_path = dir.path().join("workspace");
    config.state_path = dir.path().join("state");

    // Provider always fails, no fallback and no offline model
    let mut router = ProviderRouter::new(vec![], None);
    router.add_provider(Arc::new(MockProvider::new("mock").with_error(MockError::SendFailed)));

    let engine = AgentEngine::new(
        Arc::new(RwLock::new(config)),
        Arc::new(router),
        Arc::new(ToolRegistry::new(Duration::from_secs(5))),
        Arc::new(SessionStore::open(dir.path().join("state/sessions")).unwrap()),
        Arc::new(MemoryIndex::open(dir.path().join("state/memory.jsonl")).unwrap()),
        Arc::new(RwLock::new(SkillRegistry::new_empty())),
        Arc::new(WorkspaceLoader::new(dir.path().join("workspace"))),
        CancelRegistry::new(),
        EventBus::default(),
    );
    let cron = CronHandle::new(Arc::new(CronStore::open_in_memory().unwrap()), chrono_tz::UTC);
    let state = GatewayState::new(engine, cron, TOKEN.into(), Arc::new(|| serde_json::json!({})));
    let app = build_router(state);

    let resp = app
        .oneshot(
            authed(Request::post("/v1/chat"))
                .body(Body::from(r#"{"session_id":"cli:down","text":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ── Cron CRUD ──────────────────────────────────────────────────

#[tokio::test]
async fn cron_add_list_remove_lifecycle() {
    let (app, _dir) = setup(vec![]);

    // Add
    let resp = app
        .clone()
        .oneshot(
            authed(Request::post("/v1/cron/add"))
                .body(Body::from(
                    r#"{"session_id":"cli:ops","expression":"at 2099-01-01T00:00:00Z","prompt":"noop","name":"o"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    let job_id = json["job_id"].as_i64().unwrap();

    // List
    let resp = app
        .clone()
        .oneshot(
            authed(Request::get("/v1/cron/list?session_id=cli:ops"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(json["jobs"][0]["name"], "o");

    // Remove
    let resp = app
        .clone()
        .oneshot(
            authed(Request::delete(format!("/v1/cron/{job_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["removed"].as_i64().unwrap(), job_id);

    // Remove again → 404
    let resp = app
        .oneshot(
            authed(Request::delete(format!("/v1/cron/{job_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_cron_expression_is_400() {
    let (app, _dir) = setup(vec![]);
    for expression in ["every 0", "at 2001-01-01T00:00:00Z", "gibberish"] {
        let body = serde_json::json!({
            "session_id": "cli:ops",
            "expression": expression,
            "prompt": "x",
        });
        let resp = app
            .clone()
            .oneshot(
                authed(Request::post("/v1/cron/add"))
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.status(),
            StatusCode::BAD_REQUEST,
            "expression '{expression}' must be rejected"
        );
    }
}

// ── Status ─────────────────────────────────────────────────────

#[tokio::test]
async fn status_is_authed_and_read_only() {
    let (app, _dir) = setup(vec![]);

    let resp = app
        .clone()
        .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .oneshot(authed(Request::get("/v1/status")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["model"], "mock/test-model");
}

// ── WebSocket route auth ───────────────────────────────────────

#[tokio::test]
async fn ws_route_rejects_missing_token() {
    let (app, _dir) = setup(vec![]);
    let resp = app
        .oneshot(
            Request::get("/v1/ws")
                .header("upgrade", "websocket")
                .header("connection", "upgrade")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (app, _dir) = setup(vec![]);
    let resp = app
        .oneshot(Request::get("/v1/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
