//! Retry policy for chain calls
//!
//! One policy object, applied uniformly by the chain client: the first
//! attempt runs immediately, each retry waits an exponentially growing
//! delay capped at `max_delay`. Cancellation is checked at the top of every
//! attempt and interrupts a pending backoff wait.

use crate::error::RpcError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `retry` (1-indexed): `initial * 2^(retry-1)`, capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` under this policy.
    ///
    /// Non-retryable errors return immediately. Exhausting the policy
    /// returns the last error seen.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut retry = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RpcError::Cancelled);
            }

            let err = match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!("RPC '{}' succeeded after {} retries", operation_name, retry);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || retry >= self.max_retries {
                if retry > 0 {
                    warn!(
                        "RPC '{}' failed after {} attempts: {}",
                        operation_name,
                        retry + 1,
                        err
                    );
                }
                return Err(err);
            }

            retry += 1;
            let delay = self.delay_for_retry(retry);
            warn!(
                "RPC '{}' failed ({}), retry {}/{} in {:?}",
                operation_name, err, retry, self.max_retries, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
