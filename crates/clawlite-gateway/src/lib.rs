//! # clawlite-gateway
//!
//! HTTP/WebSocket API for the ClawLite runtime:
//!
//! - `GET /health` — unauthenticated liveness
//! - `POST /v1/chat` — bearer-authed chat round-trip
//! - `POST /v1/cron/add`, `GET /v1/cron/list`, `DELETE /v1/cron/{job_id}`
//! - `GET /v1/status` — read-only dashboard snapshot
//! - `WS /v1/ws` — streaming chat (`chat_chunk` frames + `chat_done`)

pub mod ws;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::warn;

use clawlite_core::{ClawLiteError, SessionId};
use clawlite_runtime::{AgentEngine, CronHandle};

/// Provider of the read-only status snapshot (the runtime in production, a
/// closure in tests).
pub type StatusSource = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Shared gateway state.
pub struct GatewayState {
    pub engine: Arc<AgentEngine>,
    pub cron: CronHandle,
    /// Process-wide bearer token; requests without it (except /health)
    /// get 401.
    pub token: String,
    pub status: StatusSource,
    pub started_at: Instant,
    pub ws_connections: AtomicUsize,
}

impl GatewayState {
    pub fn new(
        engine: Arc<AgentEngine>,
        cron: CronHandle,
        token: String,
        status: StatusSource,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            cron,
            token,
            status,
            started_at: Instant::now(),
            ws_connections: AtomicUsize::new(0),
        })
    }
}

/// Build the axum router.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let authed = Router::new()
        .route("/v1/chat", post(chat_handler))
        .route("/v1/cron/add", post(cron_add_handler))
        .route("/v1/cron/list", get(cron_list_handler))
        .route("/v1/cron/{job_id}", delete(cron_remove_handler))
        .route("/v1/status", get(status_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        // The WebSocket route checks the token itself: browsers cannot set
        // Authorization headers on upgrade requests, so `?token=` is
        // accepted there.
        .route("/v1/ws", get(ws::ws_handler))
        .merge(authed)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bearer-token check for every authed route.
async fn auth_middleware(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == state.token => next.run(request).await,
        _ => {
            warn!("unauthorized gateway request");
            (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
        }
    }
}

/// Map runtime errors onto the HTTP surface. Provider-class failures are
/// 503 (no provider reachable, no offline fallback took over); malformed
/// input is 400.
fn error_response(e: &ClawLiteError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e.kind() {
        "provider_timeout" | "provider_rate_limited" | "provider_send_failed"
        | "provider_circuit_open" | "auth_missing" | "auth_invalid" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        "cron_expression_invalid" | "session_error" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string(), "kind": e.kind()})))
}

// ── /health ────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "connections": state.ws_connections.load(Ordering::Relaxed),
    }))
}

// ── /v1/chat ───────────────────────────────────────────────────

async fn chat_handler(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let session_id = body["session_id"].as_str().unwrap_or("").trim();
    let text = body["text"].as_str().unwrap_or("").trim();
    if session_id.is_empty() || text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "session_id and text are required"})),
        )
            .into_response();
    }
    let session_id = match SessionId::parse(session_id) {
        Ok(sid) => sid,
        Err(e) => return error_response(&e).into_response(),
    };

    match state.engine.run(&session_id, text).await {
        Ok(result) => Json(json!({"text": result.text, "meta": result.meta})).into_response(),
        Err(ClawLiteError::SessionCancelled) => Json(json!({
            "text": "Cancelled.",
            "meta": {"mode": "online", "reason": "session_cancelled"},
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "chat request failed");
            error_response(&e).into_response()
        }
    }
}

// ── /v1/cron/* ─────────────────────────────────────────────────

async fn cron_add_handler(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let session_id = body["session_id"].as_str().unwrap_or("").trim();
    let expression = body["expression"].as_str().unwrap_or("").trim();
    let prompt = body["prompt"].as_str().unwrap_or("").trim();
    let name = body["name"].as_str().unwrap_or("");
    if session_id.is_empty() || expression.is_empty() || prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "session_id, expression and prompt are required"})),
        )
            .into_response();
    }

    match state.cron.add(session_id, expression, prompt, name) {
        Ok(job_id) => Json(json!({"job_id": job_id})).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
struct CronListParams {
    session_id: Option<String>,
}

async fn cron_list_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<CronListParams>,
) -> Response {
    match state.cron.list(params.session_id.as_deref()) {
        Ok(jobs) => Json(json!({"jobs": jobs})).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn cron_remove_handler(
    State(state): State<Arc<GatewayState>>,
    Path(job_id): Path<i64>,
) -> Response {
    match state.cron.remove(job_id) {
        Ok(true) => Json(json!({"removed": job_id})).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("job {job_id} not found")})),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

// ── /v1/status ─────────────────────────────────────────────────

async fn status_handler(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json((state.status)())
}
