//! Cellmaster master service
//!
//! Runs a master cell in one process: every replica gets its own data
//! directory, object service and GC sweeper, and replicas talk over
//! in-process channels. Replica 0 leads.

mod cell;

use anyhow::{Context, Result};
use cell::MasterCell;
use cellmaster_common::MasterConfig;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cellmaster")]
#[command(about = "Cellmaster master cell")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cellmaster/master.toml")]
    config: String,

    /// Number of replicas in the cell
    #[arg(long, default_value = "3")]
    peers: usize,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Cell id (overrides the config file)
    #[arg(long)]
    cell_id: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "CELLMASTER_LOG_JSON")]
    log_json: bool,
}

/// Layer the config file under `CELLMASTER__*` environment overrides, then
/// apply command line overrides.
fn load_config(args: &Args) -> Result<MasterConfig> {
    let mut config: MasterConfig = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::with_prefix("CELLMASTER").separator("__"))
        .build()
        .with_context(|| format!("failed to read config {}", args.config))?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(data_dir) = &args.data_dir {
        config.data_dir.clone_from(data_dir);
    }
    if let Some(cell_id) = args.cell_id {
        config.cell_id = cell_id;
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    info!(
        cell_id = config.cell_id,
        data_dir = %config.data_dir.display(),
        peers = args.peers,
        "Starting cellmaster"
    );

    let cell = MasterCell::open(&config, args.peers)?;
    cell.start().await?;
    info!(version = %cell.leader_version(), "Cell is up");

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    cell.shutdown();

    info!("Cellmaster shut down gracefully");
    Ok(())
}
