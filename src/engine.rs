use crate::config::RetryPolicy;
use crate::errors::Result;
use crate::protocol::{ExecutionRequest, ExecutionResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What an executor backend enforces around the runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorCapabilities {
    /// Backend name, recorded in every capsule
    pub backend: String,
    /// Whether the sandbox has no network access
    pub network_isolated: bool,
    /// Whether dataset files are mounted read-only
    pub read_only_data: bool,
    /// Whether the root filesystem is read-only
    pub read_only_root: bool,
    pub max_memory_mb: usize,
    pub max_cpus: f64,
    /// Security level (0-10, 10 being most isolated)
    pub security_level: u8,
}

/// A backend that runs one [`ExecutionRequest`] inside an isolated sandbox.
///
/// Backends implement [`Executor::dispatch`] as a single attempt. Callers use
/// [`Executor::execute`], which retries infrastructure failures only.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Backend name, e.g. `container` or `cluster-job`
    fn backend(&self) -> &str;

    /// Run the request once and return its normalized result
    async fn dispatch(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn capabilities(&self) -> ExecutorCapabilities;

    /// Dispatch with bounded retry on dispatch failures
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let policy = self.retry_policy();
        let mut attempt = 1;
        loop {
            match self.dispatch(request).await {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "[EXECUTOR] {} attempt {}/{} failed: {}. Retrying in {:?}",
                        self.backend(),
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
