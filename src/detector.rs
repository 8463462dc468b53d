//! Contract detection
//!
//! Turns one fetched block into contract records. Three sources are checked
//! for every transaction:
//! - Direct creations: `to` absent, address taken from the receipt
//! - Factory events: a fixed set of well-known "contract created" logs
//! - CREATE2 heuristic: log emitters of a transaction whose input carries the CREATE2 opcode byte
//!
//! Every candidate must have non-empty bytecode on chain before a record is
//! produced. Transactions are processed concurrently and a failure in one of
//! them only costs that transaction's records.

use crate::analysis::analyze_bytecode;
use crate::cache::CodeCache;
use crate::error::RpcError;
use crate::fee::effective_gas_price;
use crate::records::{bytecode_fingerprint, ContractAnalysis, ContractRecord, CreationKind};
use crate::rpc::ChainClient;
use crate::types::{BlockView, Log, Receipt, Transaction};
use alloy_primitives::{keccak256, Address, B256, U256};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// CREATE2 opcode.
const CREATE2_OPCODE: u8 = 0xf5;

/// Event signatures emitted by common factories when they deploy a contract.
const FACTORY_EVENT_SIGNATURES: [&str; 7] = [
    "ContractCreated(address)",
    "ContractDeployed(address)",
    "Deployed(address,bytes32)",
    "ProxyCreation(address,address)",
    "PairCreated(address,address,address,uint256)",
    "PoolCreated(address,address,uint24,int24,address)",
    "NewContract(address)",
];

fn factory_topics() -> &'static [B256] {
    static TOPICS: OnceLock<Vec<B256>> = OnceLock::new();
    TOPICS.get_or_init(|| {
        FACTORY_EVENT_SIGNATURES
            .iter()
            .map(|sig| keccak256(sig.as_bytes()))
            .collect()
    })
}

/// Whether `log` is one of the known factory creation events.
pub fn is_factory_event(log: &Log) -> bool {
    log.topics
        .first()
        .is_some_and(|topic0| factory_topics().contains(topic0))
}

/// Addresses a factory log might be announcing: every indexed topic and
/// every data word that is a left-padded 20-byte value. The emitter and
/// the zero address are excluded.
pub fn factory_candidates(log: &Log) -> Vec<Address> {
    let words = log
        .topics
        .iter()
        .skip(1)
        .map(|t| t.as_slice())
        .chain(log.data.chunks_exact(32));

    let mut candidates = Vec::new();
    for word in words {
        if word[..12].iter().any(|b| *b != 0) {
            continue;
        }
        let addr = Address::from_slice(&word[12..]);
        if addr != Address::ZERO && addr != log.address && !candidates.contains(&addr) {
            candidates.push(addr);
        }
    }
    candidates
}

/// Input longer than a bare selector that contains the CREATE2 opcode byte.
///
/// This matches any occurrence of 0xf5, including inside calldata
/// arguments, so it only nominates candidates; bytecode verification
/// decides.
pub fn looks_like_create2(input: &[u8]) -> bool {
    input.len() > 4 && input.contains(&CREATE2_OPCODE)
}

/// Output of `detect_contracts` for one block.
#[derive(Debug, Default)]
pub struct Detection {
    pub records: Vec<ContractRecord>,
    /// Present only when bytecode analysis is enabled
    pub analyses: Vec<ContractAnalysis>,
    /// Malformed transactions that were skipped
    pub skipped: u64,
    /// Transactions whose detection failed (RPC errors)
    pub failures: u64,
}

/// A verified deployment found in one transaction.
struct Found {
    address: Address,
    creator: Address,
    kind: CreationKind,
    code: Arc<Vec<u8>>,
}

pub struct ContractDetector {
    client: Arc<dyn ChainClient>,
    analyze: bool,
    cache: CodeCache,
}

impl ContractDetector {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            analyze: false,
            cache: CodeCache::default(),
        }
    }

    /// Also produce a `ContractAnalysis` for every record.
    pub fn with_analysis(mut self, enabled: bool) -> Self {
        self.analyze = enabled;
        self
    }

    /// Detect every contract created in `block`.
    pub async fn detect_contracts(&self, block: &BlockView) -> Detection {
        let mut detection = Detection {
            skipped: block.malformed_count() as u64,
            ..Default::default()
        };

        let mut valid = Vec::new();
        for tx in block.transactions.iter().flatten() {
            if tx.hash == B256::ZERO {
                detection.skipped += 1;
            } else {
                valid.push(tx);
            }
        }

        let outcomes = join_all(valid.iter().map(|tx| self.detect_transaction(block, tx))).await;

        let mut seen = HashSet::new();
        for (tx, outcome) in valid.iter().zip(outcomes) {
            let found = match outcome {
                Ok(found) => found,
                Err(e) => {
                    warn!(
                        "Detection failed for tx 0x{:x} in block {}: {}",
                        tx.hash, block.number, e
                    );
                    detection.failures += 1;
                    continue;
                }
            };

            for (record, code) in found {
                // Same address twice in one block: keep the first sighting
                if !seen.insert(record.address) {
                    continue;
                }
                if self.analyze {
                    detection.analyses.push(analyze_bytecode(
                        &record.network,
                        record.address,
                        record.fingerprint,
                        &code,
                    ));
                }
                detection.records.push(record);
            }
        }

        if !detection.records.is_empty() {
            debug!(
                "Block {}: {} contracts detected",
                block.number,
                detection.records.len()
            );
        }
        detection
    }

    async fn detect_transaction(
        &self,
        block: &BlockView,
        tx: &Transaction,
    ) -> Result<Vec<(ContractRecord, Arc<Vec<u8>>)>, RpcError> {
        // Plain value transfers can neither create nor call a factory
        if !tx.is_contract_creation() && !tx.has_input() {
            return Ok(Vec::new());
        }

        let Some(receipt) = self.client.transaction_receipt(tx.hash).await? else {
            debug!("No receipt for tx 0x{:x} in block {}", tx.hash, block.number);
            return Ok(Vec::new());
        };
        if receipt.is_failure() {
            return Ok(Vec::new());
        }

        let mut checked = HashSet::new();
        let mut found = Vec::new();

        if tx.is_contract_creation() {
            if let Some(address) = receipt.contract_address {
                checked.insert(address);
                if let Some(code) = self.verified_code(address).await? {
                    found.push(Found {
                        address,
                        creator: tx.from,
                        kind: CreationKind::Direct,
                        code,
                    });
                }
            }
        }

        for log in receipt.logs.iter().filter(|l| is_factory_event(l)) {
            for address in factory_candidates(log) {
                if !checked.insert(address) {
                    continue;
                }
                if let Some(code) = self.verified_code(address).await? {
                    found.push(Found {
                        address,
                        creator: log.address,
                        kind: CreationKind::Factory,
                        code,
                    });
                }
            }
        }

        if looks_like_create2(&tx.input) {
            for log in &receipt.logs {
                let address = log.address;
                if Some(address) == tx.to || !checked.insert(address) {
                    continue;
                }
                if let Some(code) = self.verified_code(address).await? {
                    found.push(Found {
                        address,
                        creator: tx.to.unwrap_or(tx.from),
                        kind: CreationKind::Create2,
                        code,
                    });
                }
            }
        }

        let gas_price = effective_gas_price(tx, &receipt, block.base_fee_per_gas).unwrap_or(U256::ZERO);
        Ok(found
            .into_iter()
            .map(|f| {
                let record = self.build_record(block, tx, &receipt, gas_price, &f);
                (record, f.code)
            })
            .collect())
    }

    fn build_record(
        &self,
        block: &BlockView,
        tx: &Transaction,
        receipt: &Receipt,
        gas_price: U256,
        found: &Found,
    ) -> ContractRecord {
        let network = self.client.network();
        ContractRecord {
            address: found.address,
            creator: found.creator,
            origin: tx.from,
            tx_hash: tx.hash,
            block_number: block.number,
            block_hash: block.hash,
            timestamp: block.timestamp,
            gas_used: receipt.gas_used,
            gas_price,
            bytecode_size: found.code.len() as u64,
            fingerprint: bytecode_fingerprint(&found.code),
            network: network.name.clone(),
            chain_id: network.chain_id,
            kind: found.kind,
        }
    }

    /// Bytecode at `address`, or `None` when nothing is deployed there.
    async fn verified_code(&self, address: Address) -> Result<Option<Arc<Vec<u8>>>, RpcError> {
        if let Some(code) = self.cache.get(address) {
            return Ok(Some(code));
        }
        let code = self.client.code(address).await?;
        if code.is_empty() {
            debug!("No bytecode at 0x{:x}, skipping", address);
            return Ok(None);
        }
        let code = Arc::new(code);
        self.cache.insert(address, code.clone());
        Ok(Some(code))
    }
}
