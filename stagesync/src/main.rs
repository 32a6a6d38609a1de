mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use stagesync_core::{logging, Config};
use tracing::info;

use server::StageSyncServer;

/// Relay node for synchronized command fan-out to live-event clients.
#[derive(Debug, Parser)]
#[command(name = "stagesync", version, about)]
struct Args {
    /// Path to a TOML config file. Environment variables prefixed with
    /// STAGESYNC__ override file values.
    #[arg(short, long, env = "STAGESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long, env = "STAGESYNC_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    logging::init_logging(&config.logging)?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        command_channel = %config.broker.command_channel,
        "StageSync relay starting"
    );

    StageSyncServer::new(config).start().await
}
