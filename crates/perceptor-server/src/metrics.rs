//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup; a second install fails.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Completed uploads (counter).
pub const UPLOADS_TOTAL: &str = "uploads_total";
/// Bytes written by completed uploads (counter).
pub const UPLOAD_BYTES_TOTAL: &str = "upload_bytes_total";
/// Upload failures (counter, labels: kind).
pub const UPLOAD_ERRORS_TOTAL: &str = "upload_errors_total";
/// Rejected control frames (counter, labels: kind).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Gateway commands (counter, labels: command, outcome).
pub const COMMANDS_TOTAL: &str = "commands_total";
