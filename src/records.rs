//! Record types for detected contracts
//!
//! These structs represent the data stored by a record sink.
//! They use postcard for binary serialization, which is compact and deterministic.

use alloy_primitives::{keccak256, Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema version carried by every `ContractAnalysis`.
pub const ANALYSIS_SCHEMA_VERSION: u16 = 1;

/// How a contract came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationKind {
    /// Top-level creation transaction (`to` absent)
    Direct,
    /// Announced by a known factory event
    Factory,
    /// Log-emitting address in a transaction whose input contains CREATE2
    Create2,
}

impl fmt::Display for CreationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CreationKind::Direct => "direct",
            CreationKind::Factory => "factory",
            CreationKind::Create2 => "create2",
        })
    }
}

/// One detected contract deployment.
///
/// `(network, address)` is the identity: storing a record for an existing
/// pair replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    /// Deployed contract address
    pub address: Address,
    /// Deployer: transaction sender, factory, or executing contract depending on `kind`
    pub creator: Address,
    /// Sender of the transaction that produced the deployment
    pub origin: Address,
    /// Creation transaction hash
    pub tx_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    /// Block timestamp (Unix epoch seconds)
    pub timestamp: u64,
    /// Gas used by the creation transaction
    pub gas_used: U256,
    /// Effective gas price paid by the creation transaction
    pub gas_price: U256,
    /// Runtime bytecode length in bytes
    pub bytecode_size: u64,
    /// keccak256 of the runtime bytecode
    pub fingerprint: B256,
    pub network: String,
    pub chain_id: u64,
    pub kind: CreationKind,
}

impl ContractRecord {
    /// Lowercase `0x`-prefixed address.
    pub fn address_hex(&self) -> String {
        format!("0x{:x}", self.address)
    }
}

/// Content hash of runtime bytecode.
pub fn bytecode_fingerprint(code: &[u8]) -> B256 {
    keccak256(code)
}

/// Heuristic bytecode features for one contract.
///
/// Every field is approximate: the values come from byte-pattern scans,
/// not from disassembly or control-flow analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAnalysis {
    pub schema_version: u16,
    pub address: Address,
    pub network: String,
    /// Fingerprint of the bytecode this analysis was computed from
    pub fingerprint: B256,
    /// Matches a known minimal-proxy preamble
    pub is_proxy: bool,
    /// Implementation address embedded in a minimal proxy
    pub proxy_implementation: Option<Address>,
    /// CREATE or CREATE2 opcode present
    pub is_factory: bool,
    /// Calldata-size guard that routes short calldata to a fallback
    pub has_fallback: bool,
    /// Empty-calldata branch typical of a `receive()` entry point
    pub has_receive: bool,
    /// Distinct dispatcher selectors (PUSH4 followed by EQ)
    pub selector_count: u32,
    /// Distinct PUSH32 constants, an upper bound on event topics
    pub event_topic_count: u32,
}

/// Decode a record from its postcard encoding.
pub fn decode_record(bytes: &[u8]) -> Result<ContractRecord, anyhow::Error> {
    postcard::from_bytes(bytes).map_err(|e| anyhow::anyhow!("Failed to decode contract record: {e}"))
}
