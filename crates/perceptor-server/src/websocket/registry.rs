//! Registry of live connections, shared by the socket handler, the command
//! gateway and the status API.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use super::connection::{Connection, ConnectionId};

/// Display name reported for connections that never sent `clientInfo`.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Registry invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A live connection already uses this identity.
    #[error("connection id {0} is already registered")]
    DuplicateId(ConnectionId),
}

/// One row of the status listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    /// Connection identity.
    pub id: ConnectionId,
    /// Display name, or [`UNKNOWN_DEVICE`].
    pub client_name: String,
    /// Filename of the last completed upload.
    pub last_filename: Option<String>,
    /// Size of the last completed upload in bytes.
    pub last_filesize: Option<u64>,
}

impl ConnectionSummary {
    fn of(connection: &Connection) -> Self {
        let last = connection.last_upload();
        Self {
            id: connection.id.clone(),
            client_name: connection
                .client_name()
                .unwrap_or_else(|| UNKNOWN_DEVICE.to_owned()),
            last_filename: last.as_ref().map(|u| u.filename.clone()),
            last_filesize: last.map(|u| u.size),
        }
    }
}

struct Entry {
    seq: u64,
    connection: Arc<Connection>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ConnectionId, Entry>,
    next_seq: u64,
}

/// Thread-safe map from identity to live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// An identity no live connection currently uses.
    pub fn fresh_id(&self) -> ConnectionId {
        let inner = self.inner.lock();
        loop {
            let id = ConnectionId::random();
            if !inner.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a connection.
    pub fn put(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&connection.id) {
            return Err(RegistryError::DuplicateId(connection.id.clone()));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let _ = inner
            .entries
            .insert(connection.id.clone(), Entry { seq, connection });
        Ok(())
    }

    /// Look up a live connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Remove a connection. Removing an absent identity is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().entries.remove(id).map(|entry| entry.connection)
    }

    /// Snapshot of all live connections in registration order.
    pub fn list(&self) -> Vec<ConnectionSummary> {
        let mut live: Vec<(u64, Arc<Connection>)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .map(|entry| (entry.seq, Arc::clone(&entry.connection)))
                .collect()
        };
        live.sort_by_key(|(seq, _)| *seq);
        live.iter().map(|(_, conn)| ConnectionSummary::of(conn)).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
