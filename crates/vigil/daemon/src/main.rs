//! Vigil Daemon - Fleet health manager
//!
//! The daemon provides:
//! - The reconciliation engine on real or virtual time
//! - Desired state pulled from the control plane's bulk API
//! - REST API for status, health and bus injection

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_control::ShadowMode;
use vigil_daemon::{DaemonConfig, DaemonError, DaemonResult, Server};

/// Vigil Daemon CLI
#[derive(Parser)]
#[command(name = "vigild")]
#[command(about = "Vigil - Fleet health manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, env = "VIGIL_LISTEN_ADDR")]
    listen: Option<String>,

    /// Bulk API base URL
    #[arg(long, env = "VIGIL_BULK_API")]
    bulk_api: Option<String>,

    /// What to do with corrective commands: live, shadow or mirror
    #[arg(long, env = "VIGIL_SHADOW_MODE")]
    shadow_mode: Option<ShadowMode>,

    /// Run on virtual time advanced by healthmanager.advance_time messages
    #[arg(long)]
    virtual_time: bool,

    /// Log level
    #[arg(long, env = "VIGIL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "VIGIL_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("Invalid listen address: {}", e)))?;
    }
    if let Some(url) = cli.bulk_api {
        config.bulk.api_url = Some(url);
    }
    if let Some(mode) = cli.shadow_mode {
        config.manager.shadow_mode = mode;
    }
    if cli.virtual_time {
        config.virtual_time = true;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen_addr,
        shadow_mode = ?config.manager.shadow_mode,
        virtual_time = config.virtual_time,
        bulk_api = config.bulk.api_url.as_deref().unwrap_or("none"),
        "Starting vigild"
    );

    let server = Server::new(config)?;
    server.run().await
}
