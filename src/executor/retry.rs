//! Retry wrapper for transient executor failures
//!
//! Only failures of the executor itself are retried, and only the transient
//! ones (see [`ExecutorError::is_transient`]). A command that ran and exited
//! nonzero is returned as-is: re-running it could mask real misconfiguration.

use super::{ExecResult, Executor, ExecutorError, RunOptions, quote_command};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for a [`RetryingExecutor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = run once)
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds)
    pub backoff_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    /// Delay before the retry following attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Executor that retries transient failures of an inner executor
#[derive(Debug, Clone)]
pub struct RetryingExecutor<E> {
    inner: E,
    config: RetryConfig,
}

impl<E: Executor> RetryingExecutor<E> {
    /// Wrap `inner` with the retry policy in `config`
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ExecutorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutorError>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "Attempt {}/{} of '{}' failed ({}), retrying in {:?}",
                        attempt, max_attempts, what, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<E: Executor> Executor for RetryingExecutor<E> {
    async fn run(
        &self,
        argv: &[String],
        options: &RunOptions,
    ) -> Result<ExecResult, ExecutorError> {
        self.with_retries(&quote_command(argv), || self.inner.run(argv, options))
            .await
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), ExecutorError> {
        self.with_retries(&format!("write {path}"), || {
            self.inner.write_file(path, content, mode)
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ExecutorError> {
        self.with_retries(&format!("read {path}"), || self.inner.read_file(path))
            .await
    }

    async fn remove_file(&self, path: &str) -> Result<(), ExecutorError> {
        self.with_retries(&format!("remove {path}"), || self.inner.remove_file(path))
            .await
    }
}
