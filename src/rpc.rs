//! JSON-RPC chain client
//!
//! `ChainClient` is the seam the detector and coordinator depend on.
//! `RpcClient` implements it over HTTP JSON-RPC, wrapping every call in
//! the shared `RetryPolicy` and handling hex string parsing.

use crate::config::NetworkDescriptor;
use crate::error::{RpcError, ScanError};
use crate::retry::RetryPolicy;
use crate::subscription::{self, BlockSubscription};
use crate::types::{parse_hex_bytes, parse_hex_u64, BlockView, Receipt};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Access to one EVM chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The network this client is bound to.
    fn network(&self) -> &NetworkDescriptor;

    /// Chain id reported by the endpoint.
    async fn chain_id(&self) -> Result<u64, RpcError>;

    /// Current chain height.
    async fn latest_block_number(&self) -> Result<u64, RpcError>;

    /// Fetch one block, with full transaction objects when `with_txs` is set.
    async fn block(&self, number: u64, with_txs: bool) -> Result<BlockView, RpcError>;

    /// Fetch a receipt. `None` when the node does not know the transaction.
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError>;

    /// Runtime bytecode currently deployed at `address` (empty for EOAs).
    async fn code(&self, address: Address) -> Result<Vec<u8>, RpcError>;

    /// Stream newly mined blocks until the subscription is cancelled or dropped.
    async fn subscribe(&self) -> Result<BlockSubscription, RpcError>;

    /// Fetch `start..=end` concurrently, one request per block.
    ///
    /// Best effort: blocks that fail are logged and left out, so the result
    /// may be shorter than the range. Returned blocks are sorted by number.
    async fn blocks(&self, start: u64, end: u64) -> Vec<BlockView> {
        if start > end {
            return Vec::new();
        }
        let fetches = (start..=end).map(|number| async move { (number, self.block(number, true).await) });
        let mut blocks: Vec<BlockView> = join_all(fetches)
            .await
            .into_iter()
            .filter_map(|(number, result)| match result {
                Ok(block) => Some(block),
                Err(e) => {
                    warn!("Failed to fetch block {} on {}: {}", number, self.network().name, e);
                    None
                }
            })
            .collect();
        blocks.sort_by_key(|b| b.number);
        blocks
    }

    /// Change how many times a failing call is retried.
    fn set_max_retries(&self, _max_retries: u32) {}

    /// Release the connection: cancel subscriptions and pending backoff waits.
    fn close(&self) {}
}

/// Check that `client` talks to the chain its descriptor declares.
///
/// A mismatch is a configuration error and is never retried.
pub async fn verify_chain_id(client: &dyn ChainClient) -> Result<(), ScanError> {
    let network = client.network();
    let actual = client
        .chain_id()
        .await
        .map_err(|source| ScanError::Connect {
            network: network.name.clone(),
            source,
        })?;
    if actual != network.chain_id {
        return Err(ScanError::ChainIdMismatch {
            network: network.name.clone(),
            expected: network.chain_id,
            actual,
        });
    }
    info!("Connected to {} (chain id {})", network.name, actual);
    Ok(())
}

/// JSON-RPC client for Ethereum nodes.
#[derive(Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    network: NetworkDescriptor,
    policy: RetryPolicy,
    max_retries: Arc<AtomicU32>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl RpcClient {
    /// Create a new RPC client for `network`.
    pub fn new(network: NetworkDescriptor, policy: RetryPolicy) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            network,
            max_retries: Arc::new(AtomicU32::new(policy.max_retries)),
            policy,
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token cancelled when the client is closed.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.load(Ordering::Relaxed),
            ..self.policy
        }
    }

    /// Make a single JSON-RPC call.
    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.network.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Http {
                status: status.as_u16(),
            });
        }

        let mut body: Value = response.json().await.map_err(|e| RpcError::Decode {
            what: "response body",
            reason: e.to_string(),
        })?;

        // Check for RPC error
        if let Some(error) = body.get("error") {
            return Err(RpcError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        // Extract result
        match body.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(RpcError::Decode {
                what: "response",
                reason: "missing 'result' field".to_string(),
            }),
        }
    }

    /// Make a JSON-RPC call under the retry policy.
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.policy()
            .run(method, &self.shutdown, || self.call_once(method, &params))
            .await
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u64, RpcError> {
        let result = self.call(method, params).await?;
        let raw = result.as_str().ok_or_else(|| RpcError::Decode {
            what: "quantity",
            reason: format!("{method} result is not a string"),
        })?;
        parse_hex_u64(raw).map_err(|reason| RpcError::Decode {
            what: "quantity",
            reason,
        })
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    fn network(&self) -> &NetworkDescriptor {
        &self.network
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.quantity("eth_chainId", json!([])).await
    }

    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        self.quantity("eth_blockNumber", json!([])).await
    }

    async fn block(&self, number: u64, with_txs: bool) -> Result<BlockView, RpcError> {
        let params = json!([format!("0x{:x}", number), with_txs]);
        let method = "eth_getBlockByNumber";
        let block = self
            .policy()
            .run(method, &self.shutdown, || async {
                let result = self.call_once(method, &params).await?;
                if result.is_null() {
                    // Not yet visible on this node; worth retrying
                    return Err(RpcError::BlockNotFound(number));
                }
                Ok(result)
            })
            .await?;
        serde_json::from_value(block).map_err(|e| RpcError::Decode {
            what: "block",
            reason: e.to_string(),
        })
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError> {
        let hash_str = format!("0x{:x}", hash);
        let result = self
            .call("eth_getTransactionReceipt", json!([hash_str]))
            .await?;
        if result.is_null() {
            debug!("No receipt for {}", hash_str);
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| RpcError::Decode {
                what: "receipt",
                reason: e.to_string(),
            })
    }

    async fn code(&self, address: Address) -> Result<Vec<u8>, RpcError> {
        let addr_str = format!("0x{:x}", address);
        let result = self.call("eth_getCode", json!([addr_str, "latest"])).await?;
        let code_str = result.as_str().ok_or_else(|| RpcError::Decode {
            what: "code",
            reason: "eth_getCode result is not a string".to_string(),
        })?;
        parse_hex_bytes(code_str).map_err(|reason| RpcError::Decode {
            what: "code",
            reason,
        })
    }

    async fn subscribe(&self) -> Result<BlockSubscription, RpcError> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        Ok(subscription::spawn(self.clone()))
    }

    fn set_max_retries(&self, max_retries: u32) {
        self.max_retries.store(max_retries, Ordering::Relaxed);
    }

    fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Closing chain client for {}", self.network.name);
            self.shutdown.cancel();
        }
    }
}
