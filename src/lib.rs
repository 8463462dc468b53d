//! Contract Scout - EVM contract deployment scanner
//!
//! This library detects contract deployments on EVM chains (direct
//! creations, factory-announced contracts and CREATE2 deployments),
//! scanning historical block ranges and following new heads, and records
//! them in a persistent RocksDB store with resumable checkpoints.

pub mod analysis;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod fee;
pub mod keys;
pub mod records;
pub mod retry;
pub mod rpc;
pub mod store;
pub mod subscription;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenience
pub use config::{NetworkDescriptor, ScanConfig, ScanMode};
pub use coordinator::{Coordinator, ScanEvent, ScanStats, ScanStatus};
pub use detector::ContractDetector;
pub use error::{RpcError, ScanError};
pub use records::{ContractAnalysis, ContractRecord, CreationKind};
pub use rpc::{ChainClient, RpcClient};
pub use store::{CheckpointStore, MemoryStore, RecordSink, RocksScanStore};
