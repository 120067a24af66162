#![warn(missing_docs)]

//! HarborMQ broker daemon.

use anyhow::Result;
use clap::Parser;
use harbormq_broker::{Broker, BrokerConfig};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "harbormq", about = "HarborMQ message broker", version)]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "HARBORMQ_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory; overrides the configuration file.
    #[arg(long, env = "HARBORMQ_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) if path.exists() => BrokerConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            BrokerConfig::default()
        }
        None => BrokerConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!(data_dir = %config.data_dir.display(), "HarborMQ broker starting...");
    let broker = Broker::start(config)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    if let Some(replica) = broker.stop().await? {
        tracing::info!(last_seq = replica.last_seq(), "backup replica up to date");
    }
    Ok(())
}
