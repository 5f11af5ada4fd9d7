//! `/api/health` endpoint.

use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: &'static str,
    /// Current time, RFC 3339.
    pub timestamp: String,
    /// Seconds since the server started.
    pub uptime: f64,
    /// `["wss"]` when serving TLS, otherwise `["ws"]`.
    pub protocols: Vec<&'static str>,
}

/// Build a health response.
pub fn health_check(start_time: Instant, tls: bool) -> HealthResponse {
    HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime: start_time.elapsed().as_secs_f64(),
        protocols: vec![if tls { "wss" } else { "ws" }],
    }
}
