//! Scriptable in-memory chain for unit tests.

use crate::config::NetworkDescriptor;
use crate::error::RpcError;
use crate::retry::RetryPolicy;
use crate::rpc::ChainClient;
use crate::subscription::BlockSubscription;
use crate::types::{BlockView, Log, Receipt, Transaction};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TEST_NETWORK: &str = "testnet";
pub const TEST_CHAIN_ID: u64 = 31337;

pub fn addr(n: u64) -> Address {
    let mut bytes = [0u8; 20];
    bytes[12..].copy_from_slice(&n.to_be_bytes());
    Address::from(bytes)
}

pub fn hash(n: u64) -> B256 {
    B256::from(U256::from(n))
}

/// Address as a left-padded 32-byte word, the way it appears in topics.
pub fn word(a: Address) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(a.as_slice());
    B256::from(bytes)
}

pub fn block(number: u64, transactions: Vec<Transaction>) -> BlockView {
    BlockView {
        number,
        hash: hash(1_000_000 + number),
        timestamp: 1_700_000_000 + number * 12,
        base_fee_per_gas: Some(U256::from(10u64)),
        transactions: transactions.into_iter().map(Some).collect(),
    }
}

pub fn creation_tx(id: u64, from: Address) -> Transaction {
    Transaction {
        hash: hash(id),
        from,
        to: None,
        gas_price: Some(U256::from(20u64)),
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
        input: vec![0x60, 0x80, 0x60, 0x40, 0x52],
    }
}

pub fn call_tx(id: u64, from: Address, to: Address, input: Vec<u8>) -> Transaction {
    Transaction {
        to: Some(to),
        input,
        ..creation_tx(id, from)
    }
}

pub fn receipt(status: u64, contract_address: Option<Address>, logs: Vec<Log>) -> Receipt {
    Receipt {
        status: Some(status),
        contract_address,
        gas_used: U256::from(100_000u64),
        effective_gas_price: None,
        logs,
    }
}

#[derive(Default)]
struct MockState {
    latest: u64,
    blocks: HashMap<u64, BlockView>,
    failing_blocks: HashSet<u64>,
    retrying_blocks: HashSet<u64>,
    receipts: HashMap<B256, Receipt>,
    failing_receipts: HashSet<B256>,
    code: HashMap<Address, Vec<u8>>,
    subscribers: Vec<mpsc::Sender<BlockView>>,
}

pub struct MockChain {
    network: NetworkDescriptor,
    reported_chain_id: u64,
    state: Mutex<MockState>,
    max_retries: AtomicU32,
    block_attempts: AtomicU32,
    shutdown: CancellationToken,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            network: NetworkDescriptor::new(TEST_NETWORK, TEST_CHAIN_ID, "http://mock"),
            reported_chain_id: TEST_CHAIN_ID,
            state: Mutex::new(MockState::default()),
            max_retries: AtomicU32::new(0),
            block_attempts: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.network = self.network.with_block_time(block_time);
        self
    }

    /// Endpoint that reports a different chain id than the descriptor.
    pub fn reporting_chain_id(mut self, chain_id: u64) -> Self {
        self.reported_chain_id = chain_id;
        self
    }

    pub fn set_latest(&self, latest: u64) {
        self.state.lock().unwrap().latest = latest;
    }

    pub fn add_block(&self, block: BlockView) {
        let mut state = self.state.lock().unwrap();
        state.latest = state.latest.max(block.number);
        state.blocks.insert(block.number, block);
    }

    /// Add empty blocks for every number in `range`.
    pub fn add_empty_blocks(&self, range: std::ops::RangeInclusive<u64>) {
        for number in range {
            self.add_block(block(number, Vec::new()));
        }
    }

    pub fn fail_block(&self, number: u64) {
        self.state.lock().unwrap().failing_blocks.insert(number);
    }

    /// Fetching `number` keeps failing with a retryable error, backing off
    /// under the client's retry policy until the client is closed.
    pub fn retry_block(&self, number: u64) {
        self.state.lock().unwrap().retrying_blocks.insert(number);
    }

    /// Attempts made against blocks registered with `retry_block`.
    pub fn block_attempts(&self) -> u32 {
        self.block_attempts.load(Ordering::SeqCst)
    }

    pub fn add_receipt(&self, tx_hash: B256, receipt: Receipt) {
        self.state.lock().unwrap().receipts.insert(tx_hash, receipt);
    }

    pub fn fail_receipt(&self, tx_hash: B256) {
        self.state.lock().unwrap().failing_receipts.insert(tx_hash);
    }

    pub fn set_code(&self, address: Address, code: Vec<u8>) {
        self.state.lock().unwrap().code.insert(address, code);
    }

    /// Deliver `block` to every live subscriber.
    pub async fn push_block(&self, block: BlockView) {
        self.add_block(block.clone());
        let subscribers = self.state.lock().unwrap().subscribers.clone();
        for subscriber in subscribers {
            let _ = subscriber.send(block.clone()).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|s| !s.is_closed());
        state.subscribers.len()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn network(&self) -> &NetworkDescriptor {
        &self.network
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.reported_chain_id)
    }

    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().latest)
    }

    async fn block(&self, number: u64, _with_txs: bool) -> Result<BlockView, RpcError> {
        let retrying = self.state.lock().unwrap().retrying_blocks.contains(&number);
        if retrying {
            let policy = RetryPolicy::new(self.max_retries());
            return policy
                .run("eth_getBlockByNumber", &self.shutdown, || {
                    self.block_attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(RpcError::Http { status: 503 }) }
                })
                .await;
        }

        let state = self.state.lock().unwrap();
        if state.failing_blocks.contains(&number) {
            return Err(RpcError::Http { status: 503 });
        }
        state
            .blocks
            .get(&number)
            .cloned()
            .ok_or(RpcError::BlockNotFound(number))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError> {
        let state = self.state.lock().unwrap();
        if state.failing_receipts.contains(&hash) {
            return Err(RpcError::Transport("connection reset".into()));
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn code(&self, address: Address) -> Result<Vec<u8>, RpcError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .code
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(&self) -> Result<BlockSubscription, RpcError> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().subscribers.push(tx);
        Ok(BlockSubscription::new(rx, CancellationToken::new()))
    }

    fn set_max_retries(&self, max_retries: u32) {
        self.max_retries.store(max_retries, Ordering::SeqCst);
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.state.lock().unwrap().subscribers.clear();
    }
}
