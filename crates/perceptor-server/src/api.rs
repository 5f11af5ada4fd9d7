//! HTTP handlers: WebSocket upgrade, index page and the management API.

use std::path::PathBuf;
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use metrics_exporter_prometheus::PrometheusHandle;
use perceptor_settings::ClientConfig;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::gateway::{CommandError, CommandGateway};
use crate::health::{self, HealthResponse};
use crate::websocket::connection::ConnectionId;
use crate::websocket::handler::{SocketContext, handle_socket};
use crate::websocket::registry::ConnectionSummary;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Everything a new socket needs.
    pub socket: SocketContext,
    /// Command injection.
    pub gateway: CommandGateway,
    /// When the server started.
    pub start_time: Instant,
    /// Whether the server speaks TLS.
    pub tls: bool,
    /// Page served at `/`.
    pub index_file: PathBuf,
    /// Largest accepted WebSocket message.
    pub max_message_size: usize,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// `GET /api/status` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Live connection count.
    pub total_connections: usize,
    /// One row per live connection, in connection order.
    pub connections: Vec<ConnectionSummary>,
}

fn upgrade(ws: WebSocketUpgrade, state: AppState) -> Response {
    let ctx = state.socket;
    ws.max_message_size(state.max_message_size)
        .max_frame_size(state.max_message_size)
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// GET /: WebSocket upgrade when requested, otherwise the index page.
pub async fn root_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => upgrade(ws, state),
        Err(_) => index_page(&state.index_file).await,
    }
}

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state)
}

async fn index_page(path: &std::path::Path) -> Response {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => Html(body).into_response(),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "index page unavailable");
            (StatusCode::NOT_FOUND, "index.html not found").into_response()
        }
    }
}

/// GET /api/health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.tls))
}

/// GET /api/status
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let connections = state.socket.registry.list();
    Json(StatusResponse {
        total_connections: connections.len(),
        connections,
    })
}

/// GET /api/config
pub async fn config_handler(State(state): State<AppState>) -> Json<ClientConfig> {
    Json(state.socket.distributor.current().clone())
}

/// POST /api/command/{connection_id}
pub async fn command_handler(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, CommandError> {
    state
        .gateway
        .dispatch_raw(&ConnectionId::from(connection_id), &body)
        .await?;
    Ok(Json(json!({ "success": true, "message": "Command sent" })))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
