//! Delivers the session configuration to newly established connections.

use std::sync::Arc;

use perceptor_settings::ClientConfig;
use tracing::debug;

use crate::websocket::connection::{Connection, SendError};
use crate::websocket::messages::ClientConfigMessage;

/// Holds the loaded `clientConfig` object.
#[derive(Debug, Clone)]
pub struct ConfigDistributor {
    config: Arc<ClientConfig>,
}

impl ConfigDistributor {
    /// Create a distributor for `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The configuration sent to devices.
    pub fn current(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `{"type":"clientConfig","config":{...}}` and wait for the write.
    pub async fn send(&self, connection: &Connection) -> Result<(), SendError> {
        connection
            .send_json(&ClientConfigMessage::new(&self.config))
            .await?;
        debug!(conn_id = %connection.id, "session configuration delivered");
        Ok(())
    }
}
