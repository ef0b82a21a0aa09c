//! Sensor Network Server
//!
//! Accepts node connections, tracks node state and coordinates the start
//! of a data collection run. Runs until interrupted.

use clap::Parser;
use sensornet_core::{Server, SiteConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Sensor network data acquisition server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Site configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Main TCP port nodes register on
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Directory for per-node log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => SiteConfig::load(path)?,
        None => SiteConfig::default(),
    };
    if let Some(ip) = args.bind {
        config = config.with_bind_ip(ip);
    }
    if let Some(port) = args.port {
        config = config.with_main_port(port);
    }
    if let Some(dir) = args.log_dir {
        config = config.with_log_dir(dir);
    }

    info!("Sensor net server starting");
    let server = Server::start(config)?;
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Interrupted");

    let summary = serde_json::to_string_pretty(&server.net().snapshots())?;
    info!("Nodes at shutdown:\n{}", summary);

    let timeout = server.shutdown_timeout();
    let clean = tokio::task::spawn_blocking(move || server.shutdown(timeout)).await?;
    if !clean {
        error!("Some threads did not stop within {:?}", timeout);
    }
    Ok(())
}
