//! Error taxonomy
//!
//! `RpcError` covers everything the chain client can fail with and knows
//! which failures are worth retrying. `ScanError` is what `Coordinator`
//! control calls surface synchronously to their caller.

use crate::config::{ConfigError, ScanMode};
use crate::coordinator::ScanStatus;
use thiserror::Error;

/// Failures talking to a chain node.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request never produced an HTTP/WebSocket response.
    #[error("RPC transport error: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success HTTP status.
    #[error("RPC endpoint returned HTTP {status}")]
    Http { status: u16 },

    /// The endpoint answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node returned `null` for a block it should know about.
    #[error("block {0} not found")]
    BlockNotFound(u64),

    /// The response could not be decoded into the expected shape.
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    /// The client was shut down while the call was pending.
    #[error("RPC call cancelled")]
    Cancelled,
}

impl RpcError {
    /// Check if this error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) | RpcError::BlockNotFound(_) => true,
            RpcError::Http { status } => *status == 429 || *status >= 500,
            RpcError::Rpc { message, .. } => is_retryable_message(message),
            RpcError::Decode { .. } | RpcError::Cancelled => false,
        }
    }
}

fn is_retryable_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    [
        "timeout",
        "timed out",
        "rate limit",
        "too many requests",
        "connection",
        "temporarily",
        "try again",
        "header not found",
        "unknown block",
        "busy",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

/// Failures surfaced by `Coordinator` control operations.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("config targets network '{requested}' but the chain client is bound to '{bound}'")]
    NetworkMismatch { requested: String, bound: String },

    #[error("chain id mismatch on '{network}': expected {expected}, endpoint reported {actual}")]
    ChainIdMismatch {
        network: String,
        expected: u64,
        actual: u64,
    },

    #[error("failed to reach '{network}'")]
    Connect {
        network: String,
        #[source]
        source: RpcError,
    },

    #[error("resolved start block {start} is after end block {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("cannot {action} a scan that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: ScanStatus,
    },

    #[error("failed to read checkpoint for '{network}' ({mode})")]
    Checkpoint {
        network: String,
        mode: ScanMode,
        #[source]
        source: anyhow::Error,
    },
}
