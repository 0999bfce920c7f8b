//! HTTP surface: health, status, snapshot reads, and control relays.
//!
//! Everything here is read-mostly; the only mutation is the control relay,
//! which shells out through the adapter registry and republishes the outcome
//! on the infrastructure channel so live sessions see it.
use crate::AppState;
use crate::ws::ws_handler;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};
use skiff_common::channels;
use skiff_stream::ManagerStats;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Structured API error: an HTTP status paired with a JSON body carrying a
/// stable `code` and a human-readable `message`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn api_not_found(message: &str) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        body: ErrorResponse {
            code: "not_found".to_string(),
            message: message.to_string(),
        },
    }
}

#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub name: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub sessions: ManagerStats,
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> Json<AgentStatus> {
    Json(AgentStatus {
        name: "skiff-agent",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        sessions: state.manager.stats(),
    })
}

/// Channels that currently hold a snapshot, sorted by name.
async fn list_channels(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "channels": state.store.channels() }))
}

/// Latest snapshot for one channel; 404 until something has published there.
async fn channel_metrics(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .store
        .get(&channel)
        .ok_or_else(|| api_not_found("no snapshot for channel"))?;
    Ok(Json(json!({
        "channel": channel,
        "captured_at": snapshot.captured_at,
        "data": snapshot.value,
    })))
}

/// Relays a whitelisted action to a subsystem adapter. The outcome is also
/// published on `infrastructure.status` so subscribed sessions observe it.
async fn control(
    State(state): State<AppState>,
    Path((subsystem, action)): Path<(String, String)>,
    args: Option<Json<Vec<String>>>,
) -> Result<Json<Value>, ApiError> {
    let adapter = state
        .adapters
        .get(&subsystem)
        .ok_or_else(|| api_not_found("unknown subsystem"))?;
    let args = args.map(|Json(args)| args).unwrap_or_default();
    let outcome = adapter.invoke(&action, &args).await;
    let is_docker = subsystem == "docker";
    let payload = json!({
        "subsystem": subsystem,
        "action": action,
        "success": outcome.success,
        "message": outcome.message,
        "timestamp": outcome.timestamp,
    });
    state
        .store
        .publish(channels::INFRASTRUCTURE_STATUS, payload.clone());
    // Container lifecycle operations are also visible on their own channel.
    if is_docker {
        state.store.publish(channels::DOCKER_EVENTS, payload.clone());
    }
    Ok(Json(payload))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/status", get(status))
        .route("/api/v1/channels", get(list_channels))
        .route("/api/v1/metrics/{channel}", get(channel_metrics))
        .route("/api/v1/control/{subsystem}/{action}", post(control))
        .route("/ws", get(ws_handler))
        .with_state(state)
}
