//! HTTP control surface and SSE event plane.
//!
//! Routes:
//! - `GET /health[?ready=true]`: status probe (503 when not ready)
//! - `GET /events`: SSE fan-out of session events with heartbeats
//! - `POST /rpc`: one command per request, one envelope per response
//! - `POST /extension_ui_response`: resolve a pending UI round trip
//! - `POST /shutdown`: 204, then graceful shutdown
//!
//! Subscribers get no replay: an event emitted before a subscriber attaches
//! is lost; late consumers read the session log over RPC first, then attach.

use crate::rpc::{self, SessionHost};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

/// Heartbeat cadence on `/events` to keep proxies alive.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Request body cap.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Default bind address/port, overridable via environment.
pub const DEFAULT_PORT: u16 = 19_000;
pub const DEFAULT_BIND: &str = "127.0.0.1";

const KNOWN_COMMANDS: &[&str] = &[
    "prompt",
    "steer",
    "follow_up",
    "abort",
    "new_session",
    "get_state",
    "get_messages",
    "get_session_stats",
    "set_model",
    "cycle_model",
    "get_available_models",
    "set_thinking_level",
    "cycle_thinking_level",
    "set_steering_mode",
    "set_follow_up_mode",
    "compact",
    "set_auto_compaction",
    "set_auto_retry",
    "abort_retry",
    "bash",
    "abort_bash",
    "switch_session",
    "fork",
    "get_fork_messages",
    "get_last_assistant_text",
    "export_html",
    "set_session_name",
    "extension_ui_response",
];

#[derive(Clone)]
struct AppState {
    host: Arc<SessionHost>,
    shutdown: Arc<Notify>,
}

/// Resolve the bind address from the environment.
pub fn bind_address() -> SocketAddr {
    let bind = std::env::var("PLOVER_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let port = std::env::var("PLOVER_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("{bind}:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
}

/// Build the router for the control surface.
pub fn router(host: Arc<SessionHost>, shutdown: Arc<Notify>) -> Router {
    let state = AppState { host, shutdown };
    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/rpc", post(rpc_endpoint))
        .route("/extension_ui_response", post(ui_response))
        .route("/shutdown", post(shutdown_endpoint))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES * 2))
        .with_state(state)
}

/// Serve the control surface until `POST /shutdown`.
pub async fn serve(host: Arc<SessionHost>, addr: SocketAddr) -> crate::error::Result<()> {
    let shutdown = Arc::new(Notify::new());
    let app = router(Arc::clone(&host), Arc::clone(&shutdown));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await?;

    host.agent.shutdown().await;
    host.ui.shutdown();
    tracing::info!("graceful shutdown complete");
    Ok(())
}

async fn health(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let session_id = {
        let session = state.host.agent.session();
        let session = session.lock().await;
        session.header.id.clone()
    };
    let ready = true;
    let body = json!({
        "status": "ok",
        "ready": ready,
        "version": env!("CARGO_PKG_VERSION"),
        "sessionId": session_id,
        "isStreaming": state.host.agent.flags().is_streaming(),
    });
    let wants_ready = params.get("ready").is_some_and(|v| v == "true");
    if wants_ready && !ready {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    } else {
        (StatusCode::OK, Json(body))
    }
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.host.subscribe();

    let session_events = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok::<_, Infallible>(
                Event::default()
                    .event(event.name())
                    .data(event.data().to_string()),
            )),
            // A lagged subscriber loses events; there is no replay.
            Err(_) => None,
        }
    });

    let heartbeats = IntervalStream::new(tokio::time::interval(HEARTBEAT_INTERVAL))
        .map(|_| Ok::<_, Infallible>(Event::default().event("heartbeat").data("{}")));

    Sse::new(futures::stream::select(session_events, heartbeats))
}

async fn rpc_endpoint(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    if body.len() > MAX_BODY_BYTES {
        return (StatusCode::BAD_REQUEST, "request body too large").into_response();
    }
    let Ok(command) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "malformed JSON body").into_response();
    };
    let Some(command_type) = command.get("type").and_then(Value::as_str) else {
        return (StatusCode::BAD_REQUEST, "missing command type").into_response();
    };
    if !KNOWN_COMMANDS.contains(&command_type) {
        return (
            StatusCode::BAD_REQUEST,
            format!("unknown command type: {command_type}"),
        )
            .into_response();
    }

    let response = rpc::dispatch(&state.host, &command).await;
    Json(response).into_response()
}

async fn ui_response(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    if body.len() > MAX_BODY_BYTES {
        return (StatusCode::BAD_REQUEST, "request body too large").into_response();
    }
    let Ok(parsed) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "malformed JSON body").into_response();
    };
    let Some(id) = parsed.get("id").and_then(Value::as_str) else {
        return (StatusCode::BAD_REQUEST, "missing id").into_response();
    };
    let value = parsed.get("value").cloned().unwrap_or(Value::Null);
    // 200 even for unknown ids: the round trip already timed out.
    state.host.ui.resolve(id, value);
    StatusCode::OK.into_response()
}

async fn shutdown_endpoint(State(state): State<AppState>) -> StatusCode {
    state.shutdown.notify_one();
    StatusCode::NO_CONTENT
}
