use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

mod assets;
mod channels;
mod config;
mod error;
mod metrics;
mod registry;
mod router;
mod server;
mod session;
mod ws;

use crate::channels::{EnvironmentChannel, FilesChannel, LogLevelChannel};
use crate::config::{load_config, FileConfig, GatewayConfig};
use crate::router::ChannelRouter;
use crate::server::AppState;

#[derive(Parser)]
#[command(name = "quay")]
#[command(about = "Resumable multiplexed gateway for browser clients")]
struct Cli {
    /// Port for the gateway (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Document root served to browsers
    #[arg(long)]
    root: Option<PathBuf>,

    /// Directory holding config.toml
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging behind a reload layer so the log-level channel can retarget
    // the filter at runtime.
    let default_directive = if cli.debug {
        "quay=debug,tower_http=debug,info"
    } else {
        "quay=info,tower_http=info,warn"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Quay {}", env!("CARGO_PKG_VERSION"));

    let file: FileConfig = load_config(&cli.config_dir)
        .extract()
        .context("invalid configuration")?;
    let mut config = GatewayConfig::from_file(&file);
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(root) = cli.root {
        config.document_root = root;
    }
    config.validate()?;

    let channels = ChannelRouter::builder()
        .register("environment", Arc::new(EnvironmentChannel::new()))?
        .register(
            "logs",
            Arc::new(LogLevelChannel::new(
                filter_handle,
                default_directive.to_string(),
            )),
        )?
        .register(
            "files",
            Arc::new(FilesChannel::new(config.workspace_root.clone())),
        )?
        .build();

    let state = AppState::new(config, channels);
    server::serve(state).await
}
