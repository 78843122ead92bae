use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use clawlite_core::SessionId;

use crate::GatewayState;

#[derive(Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// `WS /v1/ws` — bidirectional chat with streaming. The bearer token is
/// accepted as `?token=<token>` or an `Authorization: Bearer` header.
pub async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let header_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let provided = params.token.or(header_token);
    if provided.as_deref() != Some(state.token.as_str()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<GatewayState>, mut socket: WebSocket) {
    state.ws_connections.fetch_add(1, Ordering::Relaxed);
    debug!("websocket chat connected");

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(raw) = message else {
            continue;
        };
        let payload: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => {
                let _ = send_json(&mut socket, &json!({"type": "error", "error": "invalid JSON"}))
                    .await;
                continue;
            }
        };
        let session_raw = payload["session_id"].as_str().unwrap_or("").trim();
        let text = payload["text"].as_str().unwrap_or("").trim();
        if session_raw.is_empty() || text.is_empty() {
            let _ = send_json(
                &mut socket,
                &json!({"type": "error", "error": "session_id and text are required"}),
            )
            .await;
            continue;
        }
        let session_id = match SessionId::parse(session_raw) {
            Ok(sid) => sid,
            Err(e) => {
                let _ =
                    send_json(&mut socket, &json!({"type": "error", "error": e.to_string()}))
                        .await;
                continue;
            }
        };

        // Stream deltas as chat_chunk frames while the run is in flight.
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let engine = Arc::clone(&state.engine);
        let run_session = session_id.clone();
        let run_text = text.to_string();
        let mut run = tokio::spawn(async move {
            engine.run_streaming(&run_session, &run_text, tx).await
        });

        let result = loop {
            tokio::select! {
                delta = rx.recv() => match delta {
                    Some(delta) => {
                        if send_json(&mut socket, &json!({"type": "chat_chunk", "text": delta}))
                            .await
                            .is_err()
                        {
                            run.abort();
                            break None;
                        }
                    }
                    None => {
                        // Sender dropped — the run is finishing
                        break Some((&mut run).await);
                    }
                },
                outcome = &mut run => break Some(outcome),
            }
        };

        match result {
            Some(Ok(Ok(result))) => {
                let _ = send_json(
                    &mut socket,
                    &json!({"type": "chat_done", "text": result.text, "meta": result.meta}),
                )
                .await;
            }
            Some(Ok(Err(e))) => {
                warn!(error = %e, "websocket chat run failed");
                let _ = send_json(
                    &mut socket,
                    &json!({"type": "error", "error": e.to_string(), "kind": e.kind()}),
                )
                .await;
            }
            Some(Err(join_err)) => {
                warn!(error = %join_err, "websocket chat task panicked");
                let _ = send_json(
                    &mut socket,
                    &json!({"type": "error", "error": "internal error"}),
                )
                .await;
            }
            None => break, // client went away
        }
    }

    state.ws_connections.fetch_sub(1, Ordering::Relaxed);
    debug!("websocket chat disconnected");
}

async fn send_json(
    socket: &mut WebSocket,
    value: &serde_json::Value,
) -> Result<(), axum::Error> {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
}
