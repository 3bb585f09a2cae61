//! Node-level configuration for the indexing engine.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, File};
use serde::Deserialize;
use url::Url;

use super::{duration_from_secs, RpcRetryConfig};

fn default_manifest_path() -> PathBuf {
    PathBuf::from("project.yaml")
}

fn default_database_url() -> String {
    "sqlite://clio.db?mode=rwc".into()
}

fn default_batch_size() -> u64 {
    100
}

fn default_fetch_concurrency() -> usize {
    4
}

fn default_chain_interval_ms() -> u64 {
    6_000
}

fn default_memory_budget_bytes() -> u64 {
    // 1 GiB working-set budget before batch scaling kicks in.
    1024 * 1024 * 1024
}

fn default_store_cache_size() -> usize {
    500
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

/// Configuration of one engine instance.
///
/// Values mirror the CLI surface; CLI flags override file values, and
/// non-empty `endpoints`/`dictionary_url` override the manifest's network
/// section.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Path to the project manifest.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    /// SQLite URL for engine-owned metadata.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Target number of heights per scheduler scan.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Concurrent block assemblies per dispatcher.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Worker count; `0` runs the single-process dispatcher.
    #[serde(default)]
    pub workers: usize,

    /// Index against the best (optimistic) head instead of the finalized
    /// head.
    #[serde(default)]
    pub unfinalized_blocks: bool,

    /// Heights to skip without processing.
    #[serde(default)]
    pub bypass_blocks: Vec<u64>,

    /// RPC endpoints; overrides the manifest's endpoint list when
    /// non-empty.
    #[serde(default)]
    pub endpoints: Vec<Url>,

    /// Dictionary service URL; overrides the manifest's when set.
    #[serde(default)]
    pub dictionary_url: Option<Url>,

    /// Expected block production interval of the chain in milliseconds.
    #[serde(default = "default_chain_interval_ms")]
    pub chain_interval_ms: u64,

    /// Memory budget driving batch scaling and the worker fetch gate.
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: u64,

    /// Entity-store cache size handed to the store layer.
    #[serde(default = "default_store_cache_size")]
    pub store_cache_size: usize,

    /// Enables the sandbox profiler.
    #[serde(default)]
    pub profiler: bool,

    /// Maximum time to wait for graceful shutdown.
    #[serde(default = "default_shutdown_timeout", deserialize_with = "duration_from_secs")]
    pub shutdown_timeout: Duration,

    /// Retry policy for chain RPC requests.
    #[serde(default)]
    pub rpc_retry: RpcRetryConfig,

    /// Reconnect attempts before an endpoint is evicted from the pool.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            database_url: default_database_url(),
            batch_size: default_batch_size(),
            fetch_concurrency: default_fetch_concurrency(),
            workers: 0,
            unfinalized_blocks: false,
            bypass_blocks: Vec::new(),
            endpoints: Vec::new(),
            dictionary_url: None,
            chain_interval_ms: default_chain_interval_ms(),
            memory_budget_bytes: default_memory_budget_bytes(),
            store_cache_size: default_store_cache_size(),
            profiler: false,
            shutdown_timeout: default_shutdown_timeout(),
            rpc_retry: RpcRetryConfig::default(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from a YAML file, falling back to defaults for
    /// absent keys.
    pub fn from_file(path: Option<&str>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path.unwrap_or("clio.yaml")))
            .build()?;
        s.try_deserialize()
    }

    /// Creates a builder for tests.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }
}

/// A builder for creating `NodeConfig` instances for testing.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

#[cfg(any(test, feature = "test-helpers"))]
impl NodeConfigBuilder {
    /// Sets the scheduler batch size.
    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Sets the dispatcher concurrency.
    pub fn fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.config.fetch_concurrency = fetch_concurrency;
        self
    }

    /// Sets the worker count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Toggles unfinalized-blocks mode.
    pub fn unfinalized_blocks(mut self, unfinalized: bool) -> Self {
        self.config.unfinalized_blocks = unfinalized;
        self
    }

    /// Sets the bypass list.
    pub fn bypass_blocks(mut self, bypass_blocks: Vec<u64>) -> Self {
        self.config.bypass_blocks = bypass_blocks;
        self
    }

    /// Sets the endpoint list.
    pub fn endpoints(mut self, endpoints: Vec<Url>) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    /// Sets the database URL.
    pub fn database_url(mut self, url: &str) -> Self {
        self.config.database_url = url.to_string();
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> NodeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.workers, 0);
        assert!(!config.unfinalized_blocks);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.chain_interval_ms, 6_000);
    }

    #[test]
    fn loads_partial_yaml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clio.yaml");
        std::fs::write(
            &path,
            "batch_size: 25\nunfinalized_blocks: true\nendpoints:\n  - http://localhost:3030\n",
        )
        .unwrap();

        let config = NodeConfig::from_file(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.batch_size, 25);
        assert!(config.unfinalized_blocks);
        assert_eq!(config.endpoints.len(), 1);
        // Untouched keys keep their defaults.
        assert_eq!(config.fetch_concurrency, 4);
    }
}
