//! CLI implementation for scoutctl
//!
//! Read-only queries against a scanner database. All commands output
//! pretty JSON.

use crate::config::ScanMode;
use crate::records::{ContractAnalysis, ContractRecord};
use crate::store::{CheckpointStore, RecordSink, RocksScanStore};
use crate::types::{parse_address, parse_b256};
use alloy_primitives::{Address, B256};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Contract scanner query tool
#[derive(Parser)]
#[command(name = "scoutctl")]
#[command(about = "Query contracts recorded by the scanner")]
pub struct Cli {
    /// Path to the RocksDB database directory
    #[arg(short, long, env = "SCOUT_DB_PATH", default_value = "./scout_db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get the record for one contract
    GetContract {
        /// Network name
        network: String,
        /// Contract address (hex, with or without 0x prefix)
        address: String,
    },
    /// Get the bytecode analysis for one contract
    GetAnalysis {
        /// Network name
        network: String,
        /// Contract address (hex, with or without 0x prefix)
        address: String,
    },
    /// List the most recently deployed contracts
    List {
        /// Network name
        network: String,
        /// Maximum number of records
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Count contracts, in total and per creation kind
    Count {
        /// Network name
        network: String,
    },
    /// List contracts sharing the runtime bytecode of a given contract or fingerprint
    SameBytecode {
        /// Network name
        network: String,
        /// Contract address (20 bytes) or bytecode fingerprint (32 bytes)
        target: String,
    },
    /// Get the scan checkpoint for a network and mode
    GetCheckpoint {
        /// Network name
        network: String,
        /// Scan mode: realtime, historical or both
        mode: ScanMode,
    },
}

fn address_arg(s: &str) -> Result<Address> {
    parse_address(s).map_err(|e| anyhow!("Invalid address {}: {}", s, e))
}

fn record_json(record: &ContractRecord) -> Value {
    json!({
        "address": record.address_hex(),
        "creator": format!("0x{:x}", record.creator),
        "origin": format!("0x{:x}", record.origin),
        "tx_hash": format!("0x{:x}", record.tx_hash),
        "block_number": record.block_number,
        "block_hash": format!("0x{:x}", record.block_hash),
        "timestamp": record.timestamp,
        "gas_used": record.gas_used.to_string(),
        "gas_price": record.gas_price.to_string(),
        "bytecode_size": record.bytecode_size,
        "fingerprint": format!("0x{:x}", record.fingerprint),
        "network": record.network,
        "chain_id": record.chain_id,
        "kind": record.kind.to_string(),
    })
}

fn analysis_json(analysis: &ContractAnalysis) -> Value {
    json!({
        "schema_version": analysis.schema_version,
        "address": format!("0x{:x}", analysis.address),
        "network": analysis.network,
        "fingerprint": format!("0x{:x}", analysis.fingerprint),
        "is_proxy": analysis.is_proxy,
        "proxy_implementation": analysis.proxy_implementation.map(|a| format!("0x{:x}", a)),
        "is_factory": analysis.is_factory,
        "has_fallback": analysis.has_fallback,
        "has_receive": analysis.has_receive,
        "selector_count": analysis.selector_count,
        "event_topic_count": analysis.event_topic_count,
        "approximate": true,
    })
}

/// Resolve a `same-bytecode` target to a fingerprint.
fn target_fingerprint(store: &dyn RecordSink, network: &str, target: &str) -> Result<B256> {
    if let Ok(fingerprint) = parse_b256(target) {
        return Ok(fingerprint);
    }
    let addr = address_arg(target)?;
    let record = store
        .get_contract(network, addr)?
        .with_context(|| format!("No contract 0x{:x} recorded on {}", addr, network))?;
    Ok(record.fingerprint)
}

/// Execute one command against `store`.
pub fn execute<S: RecordSink + CheckpointStore>(store: &S, command: Commands) -> Result<Value> {
    let result = match command {
        Commands::GetContract { network, address } => {
            let addr = address_arg(&address)?;
            match store.get_contract(&network, addr)? {
                Some(record) => json!({ "contract": record_json(&record) }),
                None => json!({
                    "address": format!("0x{:x}", addr),
                    "network": network,
                    "contract": null
                }),
            }
        }
        Commands::GetAnalysis { network, address } => {
            let addr = address_arg(&address)?;
            match store.get_analysis(&network, addr)? {
                Some(analysis) => json!({ "analysis": analysis_json(&analysis) }),
                None => json!({
                    "address": format!("0x{:x}", addr),
                    "network": network,
                    "analysis": null
                }),
            }
        }
        Commands::List { network, limit } => {
            let records = store.recent_contracts(&network, limit)?;
            json!({
                "network": network,
                "contracts": records.iter().map(record_json).collect::<Vec<_>>(),
            })
        }
        Commands::Count { network } => {
            let by_kind = store.contracts_by_kind(&network)?;
            json!({
                "network": network,
                "total": store.contract_count(&network)?,
                "by_kind": by_kind,
            })
        }
        Commands::SameBytecode { network, target } => {
            let fingerprint = target_fingerprint(store, &network, &target)?;
            let addresses = store.contracts_with_fingerprint(&network, fingerprint)?;
            json!({
                "network": network,
                "fingerprint": format!("0x{:x}", fingerprint),
                "addresses": addresses.iter().map(|a| format!("0x{:x}", a)).collect::<Vec<_>>(),
            })
        }
        Commands::GetCheckpoint { network, mode } => json!({
            "network": network,
            "mode": mode,
            "checkpoint": store.get_checkpoint(&network, mode)?,
        }),
    };
    Ok(result)
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = RocksScanStore::open(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;

    let result = execute(&store, cli.command)?;

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
