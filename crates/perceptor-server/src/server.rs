//! `RelayServer`: Axum HTTP + WebSocket server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::config::ServerConfig;
use crate::distributor::ConfigDistributor;
use crate::gateway::CommandGateway;
use crate::shutdown::ShutdownCoordinator;
use crate::tls::{self, TlsError, TlsListener};
use crate::websocket::handler::SocketContext;
use crate::websocket::registry::ConnectionRegistry;

/// Startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// TLS material was configured but unusable.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// Other socket errors.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The upload relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    distributor: Arc<ConfigDistributor>,
    shutdown: ShutdownCoordinator,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig) -> Self {
        let distributor = Arc::new(ConfigDistributor::new(config.client_config.clone()));
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            distributor,
            shutdown: ShutdownCoordinator::new(),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let socket = SocketContext {
            registry: Arc::clone(&self.registry),
            distributor: Arc::clone(&self.distributor),
            upload_dir: self.config.upload_dir.clone(),
            heartbeat: self.config.heartbeat(),
            send_queue_capacity: self.config.send_queue_capacity,
            write_timeout: self.config.write_timeout(),
            shutdown: self.shutdown.token(),
        };
        let state = AppState {
            socket,
            gateway: CommandGateway::new(Arc::clone(&self.registry)),
            start_time: self.start_time,
            tls: self.config.is_tls(),
            index_file: self.config.index_file.clone(),
            max_message_size: self.config.max_message_size,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/", get(api::root_handler))
            .route("/ws", get(api::ws_handler))
            .route("/api/health", get(api::health_handler))
            .route("/api/status", get(api::status_handler))
            .route("/api/config", get(api::config_handler))
            .route("/api/command/{connection_id}", post(api::command_handler))
            .route("/metrics", get(api::metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in the background until shutdown is signalled.
    ///
    /// Returns the bound address and the serving task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();
        let until_shutdown = async move { token.cancelled().await };

        let handle = if let Some(files) = &self.config.tls {
            let tls_config = Arc::new(tls::load_server_config(&files.cert, &files.key)?);
            let listener = TlsListener::new(listener, tls_config)?;
            info!(addr = %local_addr, "serving HTTPS/WSS");
            tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, router)
                    .with_graceful_shutdown(until_shutdown)
                    .await
                {
                    error!(error = %err, "server error");
                }
            })
        } else {
            info!(addr = %local_addr, "serving HTTP/WS");
            tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, router)
                    .with_graceful_shutdown(until_shutdown)
                    .await
                {
                    error!(error = %err, "server error");
                }
            })
        };

        Ok((local_addr, handle))
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
