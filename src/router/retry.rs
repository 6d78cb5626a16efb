use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{RouterError, RouterResult};
use crate::metrics;

pub const DEFAULT_RETRY_LIMIT: u32 = 20;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(1_000);

/// Bounded retry on communication failures. Fixed for the router's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failed attempt.
    pub retry_limit: u32,
    pub retry_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_wait: DEFAULT_RETRY_WAIT,
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_limit: u32, retry_wait: Duration) -> Self {
        Self {
            retry_limit,
            retry_wait,
        }
    }
}

/// Runs one dispatch under a `RetryPolicy`.
///
/// Only `RouterError::Communication` is retried. The attempt closure is
/// expected to have already released the failed connection back to the
/// registry before returning that error. Cancellation aborts both an
/// in-flight attempt and a pending retry wait.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> RouterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        let mut retries = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RouterError::Cancelled),
                result = attempt() => result,
            };

            let (alias, source) = match result {
                Err(RouterError::Communication { alias, source }) => (alias, source),
                other => return other,
            };

            if retries >= self.policy.retry_limit {
                metrics::retries_exhausted(&alias);
                warn!(
                    alias = %alias,
                    attempts = retries + 1,
                    error = %source,
                    "retry limit reached"
                );
                return Err(RouterError::RetriesExhausted {
                    alias,
                    attempts: retries + 1,
                    source,
                });
            }

            retries += 1;
            metrics::retry(&alias);
            warn!(
                alias = %alias,
                retry = retries,
                limit = self.policy.retry_limit,
                wait_ms = self.policy.retry_wait.as_millis() as u64,
                error = %source,
                "communication failure, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RouterError::Cancelled),
                _ = sleep(self.policy.retry_wait) => {}
            }
        }
    }
}
