//! Retry and timeout policy for the chain RPC transport.

use std::time::Duration;

use serde::Deserialize;

fn default_max_retries() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Retry policy applied to every chain RPC request.
///
/// Transient transport failures are retried with exponential backoff and
/// full jitter; JSON-RPC level rejections are never retried.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRetryConfig {
    /// Maximum number of retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff delay in seconds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RpcRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RpcRetryConfig {
    /// The per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// A policy that never retries, used by probes that do their own
    /// failover.
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }
}
