//! Wire messages exchanged with capture devices.
//!
//! Inbound control frames are JSON objects discriminated by `type`. Outbound
//! frames are status replies, the session configuration, and gateway commands.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use perceptor_settings::ClientConfig;

/// Metadata announcing the payload carried by the next binary frame.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadMetadata {
    /// Destination file name, as sent. Checked when the destination opens.
    pub filename: String,
    /// Declared content type (`mimetype`, or `contentType`).
    pub content_type: Option<String>,
    /// Declared size in bytes. Informational only.
    pub filesize: Option<u64>,
    /// Any other fields, passed through untouched.
    pub extra: Map<String, Value>,
}

impl UploadMetadata {
    fn from_object(mut obj: Map<String, Value>) -> Result<Self, ProtocolError> {
        let filename = match obj.remove("filename") {
            Some(Value::String(name)) => name,
            _ => return Err(ProtocolError::InvalidUploadMetadata),
        };
        let mimetype = obj.remove("mimetype");
        let content_type_alias = obj.remove("contentType");
        let content_type = mimetype
            .or(content_type_alias)
            .and_then(|v| v.as_str().map(str::to_owned));
        let filesize = obj.remove("filesize").and_then(|v| v.as_u64());
        let _ = obj.remove("type");
        Ok(Self {
            filename,
            content_type,
            filesize,
            extra: obj,
        })
    }
}

/// A decoded inbound control frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    /// Device identification.
    ClientInfo {
        /// Display name, when supplied.
        client_name: Option<String>,
    },
    /// Connectivity check.
    Test,
    /// Upload announcement (typed, or legacy untyped metadata).
    Upload(UploadMetadata),
}

/// Control frames that cannot be acted on. The display text is the status
/// message sent back to the device.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not JSON, or JSON that is not an object.
    #[error("Invalid JSON")]
    InvalidJson,
    /// An `upload` without a usable filename.
    #[error("Invalid upload metadata")]
    InvalidUploadMetadata,
    /// Unrecognized `type` and no filename.
    #[error("Unknown message type")]
    UnknownType(Option<String>),
}

impl ProtocolError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::InvalidUploadMetadata => "invalid_upload_metadata",
            Self::UnknownType(_) => "unknown_type",
        }
    }
}

impl ControlMessage {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) else {
            return Err(ProtocolError::InvalidJson);
        };
        let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);

        match kind.as_deref() {
            Some("clientInfo") => Ok(Self::ClientInfo {
                client_name: obj
                    .get("clientName")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            }),
            Some("test") => Ok(Self::Test),
            Some("upload") => UploadMetadata::from_object(obj).map(Self::Upload),
            _ if obj.get("filename").is_some_and(Value::is_string) => {
                UploadMetadata::from_object(obj).map(Self::Upload)
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

/// Reply outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// The frame was handled.
    Success,
    /// The frame was rejected.
    Error,
}

/// `{"status": "success" | "error", "message": ...}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Human-readable detail.
    pub message: String,
}

impl StatusReply {
    /// Success reply.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: message.into(),
        }
    }

    /// Error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: message.into(),
        }
    }
}

/// Session configuration, the first frame on every connection.
#[derive(Clone, Debug, Serialize)]
pub struct ClientConfigMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    config: &'a ClientConfig,
}

impl<'a> ClientConfigMessage<'a> {
    /// Wrap `config` as `{"type":"clientConfig","config":{...}}`.
    pub fn new(config: &'a ClientConfig) -> Self {
        Self {
            kind: "clientConfig",
            config,
        }
    }
}

/// A command injected by the control plane.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    /// Command name, e.g. `record` or `uploadTimeRange`.
    pub command: String,
    /// Free-form payload; `""` when not given.
    pub message: Value,
    /// Range start for `uploadTimeRange`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Value>,
    /// Range end for `uploadTimeRange`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Value>,
}
