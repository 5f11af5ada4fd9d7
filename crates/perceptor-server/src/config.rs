//! Runtime server configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use perceptor_settings::{ClientConfig, RelaySettings, resolve_path};
use tracing::{info, warn};

use crate::websocket::handler::HeartbeatTiming;

/// Longest a single socket write may take before the connection is dropped.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;

/// PEM files for serving TLS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsFiles {
    /// Certificate chain.
    pub cert: PathBuf,
    /// Private key.
    pub key: PathBuf,
}

/// Configuration for the relay server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Directory uploads are written to.
    pub upload_dir: PathBuf,
    /// HTML page served at `/`.
    pub index_file: PathBuf,
    /// Keep-alive ping interval in milliseconds; `0` disables keep-alive.
    pub heartbeat_interval_ms: u64,
    /// Silence tolerated before a connection is dropped, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Bound on one socket write in milliseconds. A peer that stops reading
    /// is dropped once a write exceeds it.
    pub write_timeout_ms: u64,
    /// Session configuration sent to every device.
    pub client_config: ClientConfig,
    /// Serve HTTPS/WSS when set.
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = RelaySettings::default();
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            upload_dir: PathBuf::from(&settings.upload_path),
            index_file: PathBuf::from(&settings.index_file),
            heartbeat_interval_ms: settings.keep_alive_interval_ms,
            heartbeat_timeout_ms: settings.keep_alive_interval_ms,
            max_message_size: settings.max_message_size,
            send_queue_capacity: settings.send_queue_capacity,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            client_config: settings.client_config,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Derive the runtime configuration from loaded settings.
    ///
    /// Relative paths resolve against `base_dir`. TLS is enabled only when
    /// both the key and the certificate exist.
    pub fn from_settings(settings: &RelaySettings, base_dir: &Path) -> Self {
        let tls = match (&settings.cert_file, &settings.key_file) {
            (Some(cert), Some(key)) => {
                let files = TlsFiles {
                    cert: resolve_path(base_dir, cert),
                    key: resolve_path(base_dir, key),
                };
                if files.cert.is_file() && files.key.is_file() {
                    Some(files)
                } else {
                    warn!(
                        cert = %files.cert.display(),
                        key = %files.key.display(),
                        "TLS key or certificate not found, serving plain HTTP"
                    );
                    None
                }
            }
            _ => {
                info!("TLS not configured, serving plain HTTP");
                None
            }
        };

        Self {
            host: settings.hostname.clone(),
            port: settings.port,
            upload_dir: resolve_path(base_dir, &settings.upload_path),
            index_file: resolve_path(base_dir, &settings.index_file),
            heartbeat_interval_ms: settings.keep_alive_interval_ms,
            heartbeat_timeout_ms: settings.keep_alive_interval_ms,
            max_message_size: settings.max_message_size,
            send_queue_capacity: settings.send_queue_capacity,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            client_config: settings.client_config.clone(),
            tls,
        }
    }

    /// Keep-alive timing, or `None` when disabled.
    pub fn heartbeat(&self) -> Option<HeartbeatTiming> {
        (self.heartbeat_interval_ms > 0).then(|| HeartbeatTiming {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.heartbeat_timeout_ms.max(self.heartbeat_interval_ms)),
        })
    }

    /// Socket write bound (never zero).
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    /// Whether the server serves TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}
