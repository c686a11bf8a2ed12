//! visiond - edge vision node daemon
//!
//! 1. Discovers cameras and keeps one running processing graph per camera
//! 2. Attaches and detaches per-deployment branches on control requests
//! 3. Batches frames per deployment and classifies them remotely
//! 4. Logs events and results, pushes recent results to an aggregator

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use vision_node::{
    api::{ApiConfig, ApiServer},
    Node, NodeConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Edge vision node daemon")]
struct Args {
    /// TOML (or .json) config file.
    #[arg(long, env = "VISION_NODE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Control API listen address.
    #[arg(long, value_name = "ADDR")]
    api_addr: Option<String>,

    /// Scheduler tick in milliseconds.
    #[arg(long, value_name = "MS")]
    tick_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = NodeConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }
    if let Some(tick) = args.tick_ms {
        if tick == 0 {
            return Err(anyhow!("--tick-ms must be greater than zero"));
        }
        config.scheduler.tick = Duration::from_millis(tick);
    }

    let node = Node::from_config(&config)?;
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        node.control(),
    )
    .spawn()?;
    log::info!("control api listening on {}", api_handle.addr);
    log::info!(
        "visiond running as {} ({} model(s), tick {:?})",
        node.node_id(),
        config.models.len(),
        config.scheduler.tick
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping control api...");
    api_handle.stop()?;
    node.shutdown()?;
    log::info!("visiond stopped");
    Ok(())
}
