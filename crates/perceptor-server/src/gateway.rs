//! Out-of-band command injection from the control plane.
//!
//! A command is looked up by connection identity, validated, and written onto
//! the target's outbound stream through its write lock. Failures are reported
//! to the caller and never affect the target connection.

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::COMMANDS_TOTAL;
use crate::websocket::connection::{ConnectionId, SendError};
use crate::websocket::messages::CommandMessage;
use crate::websocket::registry::ConnectionRegistry;

/// Command that needs a time range.
pub const UPLOAD_TIME_RANGE: &str = "uploadTimeRange";

/// Why a command was not delivered. The display text is the `error` field of
/// the HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No live connection with that identity (or it closed mid-send).
    #[error("Connection not found or closed")]
    NotFound,
    /// The body is not a JSON object with a string `command`.
    #[error("Invalid request body")]
    InvalidBody,
    /// `uploadTimeRange` without both `startTime` and `endTime`.
    #[error("Missing startTime or endTime")]
    MissingTimeRange,
    /// The socket write failed.
    #[error("Failed to send message")]
    SendFailed,
}

impl CommandError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidBody | Self::MissingTimeRange => StatusCode::BAD_REQUEST,
            Self::SendFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidBody | Self::MissingTimeRange => "bad_request",
            Self::SendFailed => "send_failed",
        }
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Injects commands into live connections.
#[derive(Clone)]
pub struct CommandGateway {
    registry: Arc<ConnectionRegistry>,
}

impl CommandGateway {
    /// Create a gateway over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Validate a raw request body and deliver the command it describes.
    ///
    /// The connection is resolved before the body is looked at, so an unknown
    /// identity reports not-found even for a malformed body.
    pub async fn dispatch_raw(&self, id: &ConnectionId, body: &[u8]) -> Result<(), CommandError> {
        let Some(connection) = self.registry.get(id) else {
            counter!(COMMANDS_TOTAL, "command" => "unknown", "outcome" => "not_found").increment(1);
            return Err(CommandError::NotFound);
        };

        let command = match parse_command(body) {
            Ok(command) => command,
            Err(err) => {
                counter!(COMMANDS_TOTAL, "command" => "unknown", "outcome" => err.outcome()).increment(1);
                return Err(err);
            }
        };

        let result = connection
            .send_json(&command)
            .await
            .map_err(|err| match err {
                SendError::Closed => CommandError::NotFound,
                SendError::Transport(_) | SendError::Encode(_) => {
                    warn!(conn_id = %id, command = %command.command, error = %err, "command write failed");
                    CommandError::SendFailed
                }
            });

        let outcome = match &result {
            Ok(()) => {
                info!(conn_id = %id, command = %command.command, "command sent");
                "sent"
            }
            Err(err) => err.outcome(),
        };
        counter!(COMMANDS_TOTAL, "command" => command.command.clone(), "outcome" => outcome).increment(1);
        result
    }
}

/// Build the outbound command from a request body.
fn parse_command(body: &[u8]) -> Result<CommandMessage, CommandError> {
    let Ok(Value::Object(mut data)) = serde_json::from_slice::<Value>(body) else {
        return Err(CommandError::InvalidBody);
    };
    let Some(Value::String(command)) = data.remove("command") else {
        return Err(CommandError::InvalidBody);
    };
    let message = match data.remove("message") {
        None | Some(Value::Null) => Value::String(String::new()),
        Some(message) => message,
    };

    let (start_time, end_time) = if command == UPLOAD_TIME_RANGE {
        let start = data.remove("startTime").filter(|v| !v.is_null());
        let end = data.remove("endTime").filter(|v| !v.is_null());
        match (start, end) {
            (Some(start), Some(end)) => (Some(start), Some(end)),
            _ => return Err(CommandError::MissingTimeRange),
        }
    } else {
        (None, None)
    };

    Ok(CommandMessage {
        command,
        message,
        start_time,
        end_time,
    })
}
