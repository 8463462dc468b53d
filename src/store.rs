//! Record sink and checkpoint store
//!
//! `RecordSink` persists contract records and analyses with idempotent
//! upserts keyed by (network, address). `CheckpointStore` tracks the last
//! fully scanned block per (network, mode) and only ever moves forward.
//!
//! `RocksScanStore` implements both on RocksDB with column families;
//! `MemoryStore` implements both in memory.

use crate::config::ScanMode;
use crate::keys::{
    decode_key_address, encode_analysis_key, encode_checkpoint_key, encode_contract_key,
    encode_fingerprint_key, fingerprint_prefix, network_prefix,
};
use crate::records::{decode_record, ContractAnalysis, ContractRecord, CreationKind};
use alloy_primitives::{Address, B256};
use anyhow::{anyhow, Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Persistence for detected contracts.
///
/// Writes are idempotent: upserting the same (network, address) again
/// replaces the stored value (last write wins).
pub trait RecordSink: Send + Sync {
    /// Insert or replace a contract record.
    fn upsert_contract(&self, record: &ContractRecord) -> Result<()>;

    /// Insert or replace the analysis for a contract.
    fn upsert_analysis(&self, analysis: &ContractAnalysis) -> Result<()>;

    fn get_contract(&self, network: &str, addr: Address) -> Result<Option<ContractRecord>>;

    fn get_analysis(&self, network: &str, addr: Address) -> Result<Option<ContractAnalysis>>;

    /// Number of contracts stored for `network`.
    fn contract_count(&self, network: &str) -> Result<u64>;

    /// Contract counts per creation kind.
    fn contracts_by_kind(&self, network: &str) -> Result<KindCounts>;

    /// Addresses on `network` whose runtime bytecode hashes to `fingerprint`.
    fn contracts_with_fingerprint(&self, network: &str, fingerprint: B256) -> Result<Vec<Address>>;

    /// Most recently deployed contracts, newest block first.
    fn recent_contracts(&self, network: &str, limit: usize) -> Result<Vec<ContractRecord>>;
}

/// Progress tracking for resumable scans.
pub trait CheckpointStore: Send + Sync {
    /// Last fully scanned block, if any.
    fn get_checkpoint(&self, network: &str, mode: ScanMode) -> Result<Option<u64>>;

    /// Advance the checkpoint to `block`.
    ///
    /// Monotonic: a value at or below the stored one is ignored and `false`
    /// is returned. Concurrent callers resolve to the maximum.
    fn set_checkpoint(&self, network: &str, mode: ScanMode, block: u64) -> Result<bool>;
}

/// Contract counts by creation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub direct: u64,
    pub factory: u64,
    pub create2: u64,
}

impl KindCounts {
    fn add(&mut self, kind: CreationKind) {
        match kind {
            CreationKind::Direct => self.direct += 1,
            CreationKind::Factory => self.factory += 1,
            CreationKind::Create2 => self.create2 += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.direct + self.factory + self.create2
    }
}

fn newest_first(records: &mut Vec<ContractRecord>, limit: usize) {
    records.sort_by(|a, b| {
        b.block_number
            .cmp(&a.block_number)
            .then_with(|| a.address.cmp(&b.address))
    });
    records.truncate(limit);
}

const CF_CONTRACTS: &str = "contracts";
const CF_ANALYSES: &str = "analyses";
const CF_FINGERPRINTS: &str = "fingerprints";
const CF_CHECKPOINTS: &str = "checkpoints";

/// RocksDB-backed implementation of `RecordSink` and `CheckpointStore`.
///
/// Uses column families to organize different types of data:
/// - contracts: postcard `ContractRecord` per (network, address)
/// - analyses: postcard `ContractAnalysis` per (network, address)
/// - fingerprints: empty values, keyed (network, fingerprint, address)
/// - checkpoints: big-endian block number per (network, mode)
pub struct RocksScanStore {
    db: DB,
    /// Serializes read-modify-write sequences (index maintenance, checkpoints)
    write_lock: Mutex<()>,
}

impl RocksScanStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = vec![
            ColumnFamilyDescriptor::new(CF_CONTRACTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_ANALYSES, Options::default()),
            ColumnFamilyDescriptor::new(CF_FINGERPRINTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CHECKPOINTS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("Store write lock poisoned"))
    }

    /// Visit every (key, value) under `prefix` in `cf`.
    fn scan_prefix<F>(&self, cf_name: &str, prefix: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let cf = self.get_cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if !key.starts_with(prefix) {
                break;
            }
            visit(&key, &value)?;
        }
        Ok(())
    }

    fn network_contracts(&self, network: &str) -> Result<Vec<ContractRecord>> {
        let mut records = Vec::new();
        self.scan_prefix(CF_CONTRACTS, &network_prefix(b'C', network), |_, value| {
            records.push(decode_record(value)?);
            Ok(())
        })?;
        Ok(records)
    }
}

impl RecordSink for RocksScanStore {
    fn upsert_contract(&self, record: &ContractRecord) -> Result<()> {
        let contracts = self.get_cf(CF_CONTRACTS)?;
        let fingerprints = self.get_cf(CF_FINGERPRINTS)?;
        let key = encode_contract_key(&record.network, record.address);
        let value = postcard::to_allocvec(record).context("Failed to serialize contract record")?;

        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();

        // Re-deployment at the same address with new code: drop the stale index entry
        if let Some(existing) = self.db.get_cf(contracts, &key).context("Failed to get contract")? {
            let existing = decode_record(&existing)?;
            if existing.fingerprint != record.fingerprint {
                batch.delete_cf(
                    fingerprints,
                    encode_fingerprint_key(&record.network, existing.fingerprint, record.address),
                );
            }
        }

        batch.put_cf(contracts, &key, &value);
        batch.put_cf(
            fingerprints,
            encode_fingerprint_key(&record.network, record.fingerprint, record.address),
            b"",
        );
        self.db.write(batch).context("Failed to write contract record")?;
        Ok(())
    }

    fn upsert_analysis(&self, analysis: &ContractAnalysis) -> Result<()> {
        let cf = self.get_cf(CF_ANALYSES)?;
        let key = encode_analysis_key(&analysis.network, analysis.address);
        let value = postcard::to_allocvec(analysis).context("Failed to serialize contract analysis")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put contract analysis")?;
        Ok(())
    }

    fn get_contract(&self, network: &str, addr: Address) -> Result<Option<ContractRecord>> {
        let cf = self.get_cf(CF_CONTRACTS)?;
        let key = encode_contract_key(network, addr);
        match self.db.get_cf(cf, &key).context("Failed to get contract")? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_analysis(&self, network: &str, addr: Address) -> Result<Option<ContractAnalysis>> {
        let cf = self.get_cf(CF_ANALYSES)?;
        let key = encode_analysis_key(network, addr);
        match self.db.get_cf(cf, &key).context("Failed to get contract analysis")? {
            Some(bytes) => {
                let analysis = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize contract analysis")?;
                Ok(Some(analysis))
            }
            None => Ok(None),
        }
    }

    fn contract_count(&self, network: &str) -> Result<u64> {
        let mut count = 0u64;
        self.scan_prefix(CF_CONTRACTS, &network_prefix(b'C', network), |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    fn contracts_by_kind(&self, network: &str) -> Result<KindCounts> {
        let mut counts = KindCounts::default();
        for record in self.network_contracts(network)? {
            counts.add(record.kind);
        }
        Ok(counts)
    }

    fn contracts_with_fingerprint(&self, network: &str, fingerprint: B256) -> Result<Vec<Address>> {
        let mut addresses = Vec::new();
        self.scan_prefix(
            CF_FINGERPRINTS,
            &fingerprint_prefix(network, fingerprint),
            |key, _| {
                let addr = decode_key_address(key).context("Malformed fingerprint key")?;
                addresses.push(addr);
                Ok(())
            },
        )?;
        Ok(addresses)
    }

    fn recent_contracts(&self, network: &str, limit: usize) -> Result<Vec<ContractRecord>> {
        let mut records = self.network_contracts(network)?;
        newest_first(&mut records, limit);
        Ok(records)
    }
}

impl CheckpointStore for RocksScanStore {
    fn get_checkpoint(&self, network: &str, mode: ScanMode) -> Result<Option<u64>> {
        let cf = self.get_cf(CF_CHECKPOINTS)?;
        let key = encode_checkpoint_key(network, mode);
        match self.db.get_cf(cf, &key).context("Failed to get checkpoint")? {
            Some(bytes) => {
                if bytes.len() != 8 {
                    anyhow::bail!("Invalid checkpoint value length: {}", bytes.len());
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn set_checkpoint(&self, network: &str, mode: ScanMode, block: u64) -> Result<bool> {
        let cf = self.get_cf(CF_CHECKPOINTS)?;
        let key = encode_checkpoint_key(network, mode);

        let _guard = self.lock()?;
        if let Some(current) = self.get_checkpoint(network, mode)? {
            if block <= current {
                return Ok(false);
            }
        }
        self.db
            .put_cf(cf, &key, block.to_be_bytes())
            .context("Failed to put checkpoint")?;
        Ok(true)
    }
}

#[derive(Default)]
struct MemoryState {
    contracts: HashMap<(String, Address), ContractRecord>,
    analyses: HashMap<(String, Address), ContractAnalysis>,
    checkpoints: HashMap<(String, ScanMode), u64>,
}

/// In-memory `RecordSink` and `CheckpointStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Memory store lock poisoned"))
    }

    fn network_contracts(&self, network: &str) -> Result<Vec<ContractRecord>> {
        Ok(self
            .state()?
            .contracts
            .values()
            .filter(|r| r.network == network)
            .cloned()
            .collect())
    }
}

impl RecordSink for MemoryStore {
    fn upsert_contract(&self, record: &ContractRecord) -> Result<()> {
        self.state()?
            .contracts
            .insert((record.network.clone(), record.address), record.clone());
        Ok(())
    }

    fn upsert_analysis(&self, analysis: &ContractAnalysis) -> Result<()> {
        self.state()?
            .analyses
            .insert((analysis.network.clone(), analysis.address), analysis.clone());
        Ok(())
    }

    fn get_contract(&self, network: &str, addr: Address) -> Result<Option<ContractRecord>> {
        Ok(self
            .state()?
            .contracts
            .get(&(network.to_string(), addr))
            .cloned())
    }

    fn get_analysis(&self, network: &str, addr: Address) -> Result<Option<ContractAnalysis>> {
        Ok(self
            .state()?
            .analyses
            .get(&(network.to_string(), addr))
            .cloned())
    }

    fn contract_count(&self, network: &str) -> Result<u64> {
        Ok(self
            .state()?
            .contracts
            .keys()
            .filter(|(n, _)| n == network)
            .count() as u64)
    }

    fn contracts_by_kind(&self, network: &str) -> Result<KindCounts> {
        let mut counts = KindCounts::default();
        for record in self.network_contracts(network)? {
            counts.add(record.kind);
        }
        Ok(counts)
    }

    fn contracts_with_fingerprint(&self, network: &str, fingerprint: B256) -> Result<Vec<Address>> {
        let mut addresses: Vec<Address> = self
            .network_contracts(network)?
            .into_iter()
            .filter(|r| r.fingerprint == fingerprint)
            .map(|r| r.address)
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    fn recent_contracts(&self, network: &str, limit: usize) -> Result<Vec<ContractRecord>> {
        let mut records = self.network_contracts(network)?;
        newest_first(&mut records, limit);
        Ok(records)
    }
}

impl CheckpointStore for MemoryStore {
    fn get_checkpoint(&self, network: &str, mode: ScanMode) -> Result<Option<u64>> {
        Ok(self
            .state()?
            .checkpoints
            .get(&(network.to_string(), mode))
            .copied())
    }

    fn set_checkpoint(&self, network: &str, mode: ScanMode, block: u64) -> Result<bool> {
        let mut state = self.state()?;
        let key = (network.to_string(), mode);
        match state.checkpoints.get(&key) {
            Some(current) if block <= *current => Ok(false),
            _ => {
                state.checkpoints.insert(key, block);
                Ok(true)
            }
        }
    }
}
