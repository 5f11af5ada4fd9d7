//! Settings type definitions.
//!
//! Field names are camelCase on the wire so existing `config.json` files from
//! the capture-device tooling load unchanged. Missing fields take their
//! default value during deserialization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque session configuration forwarded to every device on connect.
pub type ClientConfig = Map<String, Value>;

/// Root settings for the relay host.
///
/// ```json
/// {
///   "hostname": "0.0.0.0",
///   "port": 8080,
///   "uploadPath": "uploads/",
///   "clientConfig": { "videoFormat": "mp4" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Bind address.
    pub hostname: String,
    /// Listening port (HTTP and WebSocket share it).
    pub port: u16,
    /// Instance name advertised over mDNS.
    pub service_name: String,
    /// mDNS service type, fully qualified.
    pub service_type: String,
    /// Whether to advertise the service over mDNS.
    pub discovery_enabled: bool,
    /// PEM private key; TLS is enabled only when this and `cert_file` exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// PEM certificate chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    /// Directory uploaded files are written to.
    pub upload_path: String,
    /// HTML page served at `/` for non-WebSocket requests.
    pub index_file: String,
    /// Ping interval in milliseconds; `0` disables keep-alive.
    pub keep_alive_interval_ms: u64,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
    /// Outbound frames queued per connection before writers wait.
    pub send_queue_capacity: usize,
    /// Session configuration sent to devices as `{"type":"clientConfig"}`.
    pub client_config: ClientConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 8080,
            service_name: "AllSpark Server".to_string(),
            service_type: "_allspark._tcp.local.".to_string(),
            discovery_enabled: true,
            key_file: Some("keys/test-private.key".to_string()),
            cert_file: Some("keys/test-public.crt".to_string()),
            upload_path: "uploads/".to_string(),
            index_file: "index.html".to_string(),
            keep_alive_interval_ms: 5_000,
            max_message_size: 300 * 1024 * 1024,
            send_queue_capacity: 64,
            client_config: default_client_config(),
        }
    }
}

fn default_client_config() -> ClientConfig {
    let mut config = Map::new();
    let _ = config.insert("videoFormat".into(), Value::from("mp4"));
    let _ = config.insert("videoChunkDurationMs".into(), Value::from(30_000));
    let _ = config.insert("videoBufferMaxMB".into(), Value::from(16_000));
    config
}
