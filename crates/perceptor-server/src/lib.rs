//! # perceptor-server
//!
//! WebSocket media-upload relay.
//!
//! - Capture devices connect over a `WebSocket`, receive the session
//!   configuration, then upload recordings as a JSON metadata frame followed
//!   by one binary payload frame
//! - A connection registry exposes every live device to the HTTP command
//!   gateway, which injects control-plane commands onto the same socket
//! - HTTP endpoints: health, status listing, client configuration, commands,
//!   Prometheus metrics, index page
//! - Keep-alive pings, optional TLS, mDNS advertisement, graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod discovery;
pub mod distributor;
pub mod gateway;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod tls;
pub mod websocket;

pub use config::{ServerConfig, TlsFiles};
pub use server::{RelayServer, ServerError};
