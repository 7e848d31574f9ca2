//! Soxy - SOCKS5 proxy server
//!
//! This is the main entry point for the Soxy application.

use anyhow::Result;
use clap::Parser;
use soxy::config::{load_config, Config, UpstreamConfig};
use soxy::server::Server;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Soxy - SOCKS5 proxy with optional upstream chaining
#[derive(Parser, Debug)]
#[command(name = "soxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on [default: 1080]
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on [default: 127.0.0.1]
    #[arg(short, long)]
    listen: Option<String>,

    /// Upstream SOCKS5 proxy as host:port; enables chaining
    #[arg(short, long)]
    upstream: Option<UpstreamConfig>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

impl Args {
    /// Load the configuration file, if any, and apply command-line overrides
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let config = load_config(path)?;
                info!("Configuration loaded from: {:?}", path);
                config
            }
            None => Config::default(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(upstream) = self.upstream {
            config.server.upstream = Some(upstream);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    info!("Soxy v{}", soxy::VERSION);
    let config = args.into_config()?;

    let server = Server::bind(&config.server).await?;

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await
}

/// Resolve on Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to setup SIGTERM handler: {}", e),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

/// Setup logging based on the command line
///
/// `RUST_LOG` takes precedence over `--log-level` when set.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    Ok(())
}
