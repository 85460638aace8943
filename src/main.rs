//! # courier
//!
//! WebSocket broadcast server binary: loads configuration, installs
//! telemetry, serves until ctrl-c, then stops every worker.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use courier_server::config::{self, ServerConfig};
use courier_server::CourierServer;
use courier_telemetry::{LogFormat, TelemetryConfig};
use tracing::{info, warn, Level};

/// WebSocket broadcast server.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "WebSocket broadcast server")]
struct Cli {
    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Config file (defaults to $COURIER_CONFIG or ~/.courier/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: Level,

    /// Human-readable logs instead of JSON.
    #[arg(long)]
    pretty: bool,
}

fn parse_level(s: &str) -> Result<Level, String> {
    courier_telemetry::parse_level(s).ok_or_else(|| format!("unknown log level: {s}"))
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut config = config::load_config_from_path(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    courier_telemetry::init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        module_levels: vec![("tower_http".into(), Level::WARN)],
        format: if cli.pretty { LogFormat::Text } else { LogFormat::Json },
    })
    .context("Failed to initialize telemetry")?;

    let config = load_config(&cli)?;
    let metrics = courier_telemetry::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = CourierServer::new(config, metrics);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server address")?;
    info!(addr = %addr, "ready; open http://{addr}/ in a browser");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");

    if !server.drain(vec![handle]).await {
        warn!("server did not stop within the shutdown timeout");
    }
    info!("shutdown complete");
    Ok(())
}
