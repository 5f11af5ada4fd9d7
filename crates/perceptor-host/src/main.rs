//! # perceptor-host
//!
//! Upload relay binary: loads settings, starts the HTTP/WebSocket server,
//! advertises it over mDNS, and shuts down cleanly on Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use perceptor_server::discovery::{Advertisement, ServiceAdvertiser};
use perceptor_server::logging::{self, LogFormat};
use perceptor_server::{RelayServer, ServerConfig};
use perceptor_settings::RelaySettings;

/// Perceptor media-upload relay.
#[derive(Parser, Debug)]
#[command(name = "perceptor-host", about = "WebSocket media-upload relay")]
struct Cli {
    /// Settings file; created from defaults if missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Upload directory (overrides settings).
    #[arg(long)]
    upload_path: Option<String>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format: `compact` or `json`.
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Do not advertise the service over mDNS.
    #[arg(long)]
    no_discovery: bool,
}

impl Cli {
    /// Directory relative settings paths resolve against.
    fn base_dir(&self) -> PathBuf {
        match self.config.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.hostname.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(upload_path) = &self.upload_path {
            settings.upload_path.clone_from(upload_path);
        }
        if self.no_discovery {
            settings.discovery_enabled = false;
        }
    }
}

fn load_settings(path: &Path) -> Result<RelaySettings> {
    let _ = perceptor_settings::ensure_settings_file(path)
        .with_context(|| format!("Failed to create settings file {}", path.display()))?;
    perceptor_settings::load_settings_from_path(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    logging::init_subscriber(&args.log_level, args.log_format);

    let mut settings = load_settings(&args.config)?;
    args.apply(&mut settings);

    let config = ServerConfig::from_settings(&settings, &args.base_dir());
    let tls = config.is_tls();

    let mut server = RelayServer::new(config);
    match perceptor_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(err) => tracing::warn!(error = %err, "metrics disabled"),
    }

    let (addr, handle) = server.listen().await.context("Failed to start server")?;
    let scheme = if tls { "https" } else { "http" };
    tracing::info!("Perceptor relay listening on {scheme}://{addr}");

    let advertiser = if settings.discovery_enabled {
        let ad = Advertisement {
            service_name: settings.service_name.clone(),
            service_type: settings.service_type.clone(),
            port: addr.port(),
            tls,
        };
        match ServiceAdvertiser::register(&ad) {
            Ok(advertiser) => Some(advertiser),
            Err(err) => {
                tracing::warn!(error = %err, "mDNS advertisement failed, continuing without it");
                None
            }
        }
    } else {
        None
    };

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    if let Some(advertiser) = advertiser {
        advertiser.shutdown();
    }
    let _ = server.shutdown().graceful_shutdown(vec![handle], None).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
