//! Live connection state shared by the socket handler, the command gateway,
//! the heartbeat and the status listing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::session::CompletedUpload;

/// Opaque per-connection identity: 8 lowercase hex characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// A new random identity (32 bits of randomness).
    ///
    /// Uniqueness among live connections is the registry's job; see
    /// [`ConnectionRegistry::fresh_id`](super::registry::ConnectionRegistry::fresh_id).
    pub fn random() -> Self {
        Self(format!("{:08x}", rand::random::<u32>()))
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why an outbound frame could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection is closed (or closing) and accepts no more frames.
    #[error("connection closed")]
    Closed,
    /// The socket write itself failed.
    #[error("socket write failed: {0}")]
    Transport(String),
    /// The payload could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// A frame handed to the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text frame.
    Text(String),
    /// Keep-alive ping.
    Ping,
}

/// A frame plus the channel the writer acknowledges the write on.
#[derive(Debug)]
pub struct Outbound {
    /// Frame to write.
    pub frame: OutboundFrame,
    /// Receives the outcome of the socket write.
    pub ack: oneshot::Sender<Result<(), SendError>>,
}

/// A connected capture device.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// When this connection was established.
    pub connected_at: Instant,
    client_name: Mutex<Option<String>>,
    last_upload: Mutex<Option<CompletedUpload>>,
    /// Write lock: every outbound frame goes through here, one at a time.
    /// `None` once the connection is closed.
    outbound: tokio::sync::Mutex<Option<mpsc::Sender<Outbound>>>,
    closed: AtomicBool,
    is_alive: AtomicBool,
}

impl Connection {
    /// Create a connection whose frames are written by the task draining `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            client_name: Mutex::new(None),
            last_upload: Mutex::new(None),
            outbound: tokio::sync::Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            is_alive: AtomicBool::new(true),
        }
    }

    /// Display name reported by the device, if any.
    pub fn client_name(&self) -> Option<String> {
        self.client_name.lock().clone()
    }

    /// Set the display name.
    pub fn set_client_name(&self, name: String) {
        *self.client_name.lock() = Some(name);
    }

    /// Most recently completed upload.
    pub fn last_upload(&self) -> Option<CompletedUpload> {
        self.last_upload.lock().clone()
    }

    /// Publish a completed upload.
    pub fn record_upload(&self, upload: CompletedUpload) {
        *self.last_upload.lock() = Some(upload);
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a text frame and wait for the writer to report the outcome.
    pub async fn send_text(&self, text: String) -> Result<(), SendError> {
        self.send_frame(OutboundFrame::Text(text)).await
    }

    /// Serialize `value` and send it as a text frame.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(value).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_text(text).await
    }

    /// Send a keep-alive ping.
    pub async fn ping(&self) -> Result<(), SendError> {
        self.send_frame(OutboundFrame::Ping).await
    }

    async fn send_frame(&self, frame: OutboundFrame) -> Result<(), SendError> {
        // Held until the writer acknowledges, so frames never interleave and a
        // concurrent close waits for this write.
        let guard = self.outbound.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::Closed);
        };
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let (ack, ack_rx) = oneshot::channel();
        tx.send(Outbound { frame, ack })
            .await
            .map_err(|_| SendError::Closed)?;
        ack_rx.await.map_err(|_| SendError::Closed)?
    }

    /// Close the outbound side, waiting for an in-flight write to finish.
    ///
    /// Dropping the sender ends the writer task once its queue drains.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut guard = self.outbound.lock().await;
        *guard = None;
    }

    /// Non-blocking close for use where awaiting is impossible (drop paths).
    pub fn close_now(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut guard) = self.outbound.try_lock() {
            *guard = None;
        }
    }

    /// Mark the connection as alive (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_name", &self.client_name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
