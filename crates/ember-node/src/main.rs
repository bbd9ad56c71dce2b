//! Ember node - the p2p substrate wired to an in-memory chain.
//!
//! This is the main entry point for the ember-node binary.

use alloy_primitives::U256;
use anyhow::Result;
use clap::Parser;
use ember_network::{Host, HostConfig};
use ember_sync::{MemoryBlockQueue, MemoryChain, MemoryTxPool, SyncCapability};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::{split_peer_address, NodeConfig};

/// Ember blockchain node.
#[derive(Parser, Debug)]
#[command(name = "ember-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ember-node.toml")]
    config: PathBuf,

    /// P2P listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Declared public IP
    #[arg(long)]
    public_ip: Option<String>,

    /// Disable UPnP port mapping
    #[arg(long)]
    no_upnp: bool,

    /// Allow peers on private networks
    #[arg(long)]
    local: bool,

    /// Target live-peer count
    #[arg(long)]
    ideal_peers: Option<usize>,

    /// Network identifier
    #[arg(long)]
    network_id: Option<u64>,

    /// Bootstrap peer, host:port (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Peer-list persistence path
    #[arg(long)]
    peers_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting ember node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    info!(
        port = config.network.listen_port,
        network = config.network_id,
        peers = config.network.ideal_peer_count,
        "Configuration"
    );

    // The in-memory collaborators; a full client swaps in its database,
    // pool and import queue here.
    let chain = Arc::new(MemoryChain::new(format!("ember-{}", config.network_id)));
    let tx_pool = Arc::new(MemoryTxPool::new());
    let block_queue = Arc::new(MemoryBlockQueue::new(chain.clone()));

    let sync = Arc::new(SyncCapability::new(
        U256::from(config.network_id),
        chain.clone(),
        tx_pool,
        block_queue,
    ));

    let mut host = Host::new(HostConfig {
        listen_port: config.network.listen_port,
        public_ip: config.network.public_ip.clone(),
        upnp: config.network.upnp,
        local_networking: config.network.local_networking,
        ideal_peer_count: config.network.ideal_peer_count,
        client_version: format!("{}/{}", config.node_name, env!("CARGO_PKG_VERSION")),
    })?;
    host.register_capability(sync.clone());
    let host = Arc::new(host);

    host.start().await?;
    info!(id = %host.node_id(), port = host.listen_port(), "Host up");

    // Replay the saved peer list, then dial the bootstrap peers.
    if config.peers_file.exists() {
        match std::fs::read(&config.peers_file) {
            Ok(blob) => {
                if let Err(e) = host.restore_peers(&blob) {
                    warn!(error = %e, "Saved peer list unusable");
                }
            }
            Err(e) => warn!(error = %e, "Could not read peer list"),
        }
    }
    for entry in &config.network.bootstrap {
        let (address, port) = split_peer_address(entry, 30303);
        host.connect(&address, port).await;
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");

    let saved = host.save_peers();
    if let Err(e) = std::fs::write(&config.peers_file, &saved) {
        warn!(error = %e, "Could not save peer list");
    }
    host.stop().await;

    info!(height = chain.head_number(), "Ember node stopped");
    Ok(())
}
