//! Contract deployment scanner binary
//!
//! Scans a chain for contract deployments, historically over a block range,
//! in realtime from new heads, or both, and records them in RocksDB.

use anyhow::{bail, Context, Result};
use clap::Parser;
use contract_scout::config::{load_networks, BlockTag, NetworkDescriptor, ScanConfig, ScanMode};
use contract_scout::coordinator::{Coordinator, ScanEvent};
use contract_scout::retry::RetryPolicy;
use contract_scout::rpc::RpcClient;
use contract_scout::store::RocksScanStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Contract deployment scanner
#[derive(Parser)]
#[command(name = "scanner")]
#[command(about = "Detect contract deployments and record them locally")]
struct Args {
    /// Network name (looked up in --networks when given)
    #[arg(short, long, env = "SCOUT_NETWORK", default_value = "mainnet")]
    network: String,

    /// JSON file listing network descriptors
    #[arg(long, env = "SCOUT_NETWORKS_FILE")]
    networks: Option<PathBuf>,

    /// RPC endpoint URL, used when no networks file is given
    #[arg(short, long, env = "SCOUT_RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// WebSocket endpoint for new heads (polling is used without one)
    #[arg(short, long, env = "SCOUT_WS_URL")]
    ws_url: Option<String>,

    /// Chain id the endpoint must report, used when no networks file is given
    #[arg(long, env = "SCOUT_CHAIN_ID", default_value_t = 1)]
    chain_id: u64,

    /// Expected block interval in milliseconds, paces head polling without --ws-url
    #[arg(long)]
    block_time_ms: Option<u64>,

    /// Scan mode: realtime, historical or both
    #[arg(short, long, default_value = "realtime")]
    mode: ScanMode,

    /// First block to scan (number or "latest")
    #[arg(long, default_value = "latest")]
    start: BlockTag,

    /// Last block to scan (number or "latest")
    #[arg(long, default_value = "latest")]
    end: BlockTag,

    /// Blocks fetched per historical batch
    #[arg(long, default_value_t = 10)]
    batch_size: u64,

    /// Pause between historical batches in milliseconds
    #[arg(long, default_value_t = 1000)]
    batch_delay_ms: u64,

    /// Retries per RPC call after the first attempt
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Store a heuristic bytecode analysis for each contract
    #[arg(long)]
    analyze: bool,

    /// Path to RocksDB database directory
    #[arg(short, long, env = "SCOUT_DB_PATH", default_value = "./scout_db")]
    db_path: PathBuf,
}

impl Args {
    fn network(&self) -> Result<NetworkDescriptor> {
        if let Some(path) = &self.networks {
            let networks = load_networks(path)?;
            return match networks.into_iter().find(|n| n.name == self.network) {
                Some(network) => Ok(network),
                None => bail!("Network '{}' not found in {:?}", self.network, path),
            };
        }
        let mut network = NetworkDescriptor::new(&self.network, self.chain_id, &self.rpc_url);
        if let Some(ws_url) = &self.ws_url {
            network = network.with_ws_url(ws_url);
        }
        if let Some(ms) = self.block_time_ms {
            network = network.with_block_time(Duration::from_millis(ms));
        }
        Ok(network)
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            batch_size: self.batch_size,
            batch_delay_ms: self.batch_delay_ms,
            max_retries: self.max_retries,
            analyze_bytecode: self.analyze,
            ..ScanConfig::new(&self.network, self.mode).with_range(self.start, self.end)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let network = args.network()?;
    let config = args.scan_config();

    info!("Starting contract scanner");
    info!("Network: {} (chain id {})", network.name, network.chain_id);
    info!("RPC URL: {}", network.rpc_url);
    info!("Mode: {}", config.mode);
    info!("Database: {:?}", args.db_path);

    let rpc = RpcClient::new(network, RetryPolicy::new(config.max_retries))
        .context("Failed to create RPC client")?;

    let store = Arc::new(
        RocksScanStore::open(&args.db_path)
            .with_context(|| format!("Failed to open database at {:?}", args.db_path))?,
    );

    let coordinator = Coordinator::new(Arc::new(rpc), store.clone(), store);

    let mut events = coordinator.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ScanEvent::ContractDetected(record)) => info!(
                    address = %record.address_hex(),
                    kind = %record.kind,
                    block = record.block_number,
                    "Contract detected"
                ),
                Ok(ScanEvent::StatsUpdated(stats)) => info!(
                    blocks = stats.blocks_processed,
                    contracts = stats.contracts_found,
                    errors = stats.error_count,
                    checkpoint = ?stats.checkpoint,
                    "Progress"
                ),
                Ok(ScanEvent::StatusChanged { from, to }) => {
                    info!("Scan status {} -> {}", from, to)
                }
                Err(RecvError::Lagged(n)) => warn!("Event logger lagged, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    coordinator
        .start(config)
        .await
        .context("Failed to start scan")?;

    // Handle Ctrl+C gracefully
    tokio::select! {
        _ = coordinator.wait_stopped() => {
            info!("Scan finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            coordinator.stop().await.context("Failed to stop scan")?;
        }
    }

    let stats = coordinator.stats();
    drop(coordinator);
    let _ = logger.await;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
