//! Application context and initialization logic: loads configuration and
//! the manifest, connects the API pool, and wires the project, dictionary
//! and metadata repository for the supervisor.

pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use events::{AppMetrics, EventBus, IndexerEvent, Metrics};

use crate::config::{ManifestError, ManifestLoader, NodeConfig, ProjectManifest};
use crate::dictionary::DictionaryService;
use crate::filter::{BlockFilter, FilterSpec};
use crate::persistence::{PersistenceError, SqliteStateRepository, StateRepository};
use crate::project::{
    Datasource, DatasourceProcessor, HandlerFilter, ProjectError, ProjectService,
};
use crate::rpc::pool::DeclaredChain;
use crate::rpc::types::BlockReference;
use crate::rpc::{ApiPool, PoolError, RpcClientError};

/// Errors during context initialization; all are fatal and map to exit
/// code 1.
#[derive(Debug, Error)]
pub enum AppContextError {
    /// Node configuration failed to load.
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// The project manifest failed to load or validate.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The metadata database could not be opened.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The API pool could not be established or the chain identity
    /// mismatched.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The project could not be compiled.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// An anchor block for a cron filter could not be fetched.
    #[error(transparent)]
    Rpc(#[from] RpcClientError),

    /// A semantic check failed.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// CLI flags that override file configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `--batch-size`
    pub batch_size: Option<u64>,
    /// `--workers`
    pub workers: Option<usize>,
    /// `--endpoint` (comma-separated)
    pub endpoints: Option<Vec<Url>>,
    /// `--dictionary`
    pub dictionary: Option<Url>,
    /// `--unfinalized-blocks`
    pub unfinalized_blocks: Option<bool>,
    /// `--store-cache-size`
    pub store_cache_size: Option<usize>,
    /// `--profiler`
    pub profiler: bool,
    /// `--bypass-blocks` (comma-separated)
    pub bypass_blocks: Option<Vec<u64>>,
}

/// Everything the supervisor needs, fully initialized.
pub struct AppContext {
    /// Effective node configuration.
    pub config: Arc<NodeConfig>,
    /// The loaded project manifest.
    pub manifest: ProjectManifest,
    /// Engine metadata repository.
    pub repository: Arc<SqliteStateRepository>,
    /// The connected API pool.
    pub pool: Arc<ApiPool>,
    /// The compiled project.
    pub project: Arc<ProjectService>,
    /// The dictionary client, when one is configured.
    pub dictionary: Option<Arc<DictionaryService>>,
    /// The engine-wide event bus.
    pub events: EventBus,
    /// Shared metrics snapshot.
    pub metrics: AppMetrics,
    /// Cold-start or resume height.
    pub init_height: u64,
    /// Root cancellation token.
    pub token: CancellationToken,
}

/// A builder for the [`AppContext`], allowing configuration overrides and
/// step-by-step initialization.
pub struct AppContextBuilder {
    config_path: Option<String>,
    overrides: CliOverrides,
    processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
}

impl AppContextBuilder {
    /// Creates a builder reading configuration from `config_path` (or
    /// defaults) with CLI overrides applied on top.
    pub fn new(config_path: Option<String>, overrides: CliOverrides) -> Self {
        Self { config_path, overrides, processors: HashMap::new() }
    }

    /// Registers a custom datasource processor.
    pub fn processor(mut self, processor: Arc<dyn DatasourceProcessor>) -> Self {
        self.processors.insert(processor.kind().to_string(), processor);
        self
    }

    /// Builds the `AppContext`, performing all initialization steps.
    pub async fn build(self) -> Result<AppContext, AppContextError> {
        tracing::debug!("Loading node configuration...");
        let mut config = match &self.config_path {
            Some(path) => NodeConfig::from_file(Some(path))?,
            None => NodeConfig::default(),
        };
        apply_overrides(&mut config, &self.overrides);

        tracing::debug!(manifest = %config.manifest_path.display(), "Loading project manifest...");
        let manifest = ManifestLoader::new(config.manifest_path.clone()).load()?;
        tracing::info!(
            project = %manifest.name,
            version = %manifest.version,
            datasource_count = manifest.data_sources.len(),
            "Project manifest loaded."
        );

        let endpoints = resolve_endpoints(&config, &manifest)?;
        let token = CancellationToken::new();
        let events = EventBus::default();

        tracing::debug!("Initializing state repository...");
        let repository = Arc::new(SqliteStateRepository::new(&config.database_url).await?);
        repository.run_migrations().await?;

        let declared = DeclaredChain {
            chain_id: manifest.network.chain_id.clone(),
            genesis_hash: manifest.network.genesis_hash.clone(),
        };
        let pool = ApiPool::connect(
            &endpoints,
            &declared,
            config.rpc_retry.clone(),
            config.max_reconnect_attempts,
            events.clone(),
            token.clone(),
        )
        .await?;
        let meta = pool.network_meta().clone();
        tracing::info!(chain = %meta.chain, genesis_hash = %meta.genesis_hash, "Connected to chain.");

        // A database initialized against a different chain must not be
        // silently reused.
        match repository.genesis_hash(&meta.chain).await? {
            Some(stored) if stored != meta.genesis_hash => {
                return Err(AppContextError::Pool(PoolError::ChainMismatch {
                    endpoint: "<database>".into(),
                    expected: stored,
                    observed: meta.genesis_hash,
                }));
            }
            Some(_) => {}
            None => repository.set_genesis_hash(&meta.chain, &meta.genesis_hash).await?,
        }

        let anchors = resolve_cron_anchors(&manifest, &pool).await?;
        let project = Arc::new(
            ProjectService::new(
                meta.chain.clone(),
                manifest.data_sources.clone(),
                manifest.templates.clone(),
                anchors,
                repository.clone() as Arc<dyn StateRepository>,
                self.processors,
            )
            .await?,
        );

        let dictionary = resolve_dictionary(&config, &manifest, &meta.genesis_hash)?;
        if let Some(dictionary) = &dictionary {
            dictionary.update_queries(&project.raw_datasources(), project.processors());
            match dictionary.sync_metadata().await {
                Ok(metadata) => tracing::info!(
                    start_height = metadata.start_height,
                    last_processed_height = metadata.last_processed_height,
                    "Dictionary metadata synced."
                ),
                Err(e) => tracing::warn!(error = %e, "Dictionary metadata sync failed."),
            }
        }

        // Merge manifest bypass heights into the configured list.
        for height in &manifest.network.bypass_blocks {
            if !config.bypass_blocks.contains(height) {
                config.bypass_blocks.push(*height);
            }
        }

        let init_height = match repository.last_processed_height(&meta.chain).await? {
            Some(last) => last + 1,
            None => project.start_height(),
        };
        tracing::info!(init_height, "Resolved indexing start height.");

        Ok(AppContext {
            config: Arc::new(config),
            manifest,
            repository,
            pool,
            project,
            dictionary,
            events,
            metrics: AppMetrics::default(),
            init_height,
            token,
        })
    }
}

fn apply_overrides(config: &mut NodeConfig, overrides: &CliOverrides) {
    if let Some(batch_size) = overrides.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(endpoints) = &overrides.endpoints {
        config.endpoints = endpoints.clone();
    }
    if let Some(dictionary) = &overrides.dictionary {
        config.dictionary_url = Some(dictionary.clone());
    }
    if let Some(unfinalized) = overrides.unfinalized_blocks {
        config.unfinalized_blocks = unfinalized;
    }
    if let Some(store_cache_size) = overrides.store_cache_size {
        config.store_cache_size = store_cache_size;
    }
    if overrides.profiler {
        config.profiler = true;
    }
    if let Some(bypass_blocks) = &overrides.bypass_blocks {
        config.bypass_blocks = bypass_blocks.clone();
    }
}

fn resolve_endpoints(
    config: &NodeConfig,
    manifest: &ProjectManifest,
) -> Result<Vec<Url>, AppContextError> {
    if !config.endpoints.is_empty() {
        return Ok(config.endpoints.clone());
    }
    manifest
        .network
        .endpoint
        .iter()
        .map(|raw| {
            Url::parse(raw).map_err(|e| {
                AppContextError::Validation(format!("invalid manifest endpoint `{raw}`: {e}"))
            })
        })
        .collect()
}

fn resolve_dictionary(
    config: &NodeConfig,
    manifest: &ProjectManifest,
    genesis_hash: &str,
) -> Result<Option<Arc<DictionaryService>>, AppContextError> {
    let url = match (&config.dictionary_url, &manifest.network.dictionary) {
        (Some(url), _) => Some(url.clone()),
        (None, Some(raw)) => Some(Url::parse(raw).map_err(|e| {
            AppContextError::Validation(format!("invalid dictionary URL `{raw}`: {e}"))
        })?),
        (None, None) => None,
    };
    Ok(url.map(|url| {
        Arc::new(DictionaryService::new(url, genesis_hash.to_string(), &config.rpc_retry))
    }))
}

/// Fetches the timestamp of the block at each cron-filtered datasource's
/// start height.
async fn resolve_cron_anchors(
    manifest: &ProjectManifest,
    pool: &ApiPool,
) -> Result<HashMap<u64, u64>, AppContextError> {
    let mut anchors = HashMap::new();
    for ds in &manifest.data_sources {
        if !has_cron_filter(ds) || anchors.contains_key(&ds.start_block) {
            continue;
        }
        let api = pool.unsafe_api().await?;
        let block = api.block(&BlockReference::height(ds.start_block)).await?;
        anchors.insert(ds.start_block, block.header.timestamp);
    }
    Ok(anchors)
}

fn has_cron_filter(ds: &Datasource) -> bool {
    ds.mapping.handlers.iter().any(|handler| {
        matches!(
            &handler.filter,
            Some(HandlerFilter::Block(spec)) if has_timestamp(spec)
        )
    })
}

fn has_timestamp(spec: &FilterSpec<BlockFilter>) -> bool {
    spec.as_slice().iter().any(|f| f.timestamp.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_file_values() {
        let mut config = NodeConfig::default();
        apply_overrides(
            &mut config,
            &CliOverrides {
                batch_size: Some(25),
                workers: Some(4),
                unfinalized_blocks: Some(true),
                bypass_blocks: Some(vec![7, 8]),
                profiler: true,
                ..CliOverrides::default()
            },
        );

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.workers, 4);
        assert!(config.unfinalized_blocks);
        assert_eq!(config.bypass_blocks, vec![7, 8]);
        assert!(config.profiler);
    }

    fn manifest_with_endpoint(endpoint: serde_json::Value) -> ProjectManifest {
        serde_json::from_value(serde_json::json!({
            "specVersion": "1.0.0",
            "name": "p",
            "version": "0.0.1",
            "schema": { "file": "./schema.graphql" },
            "network": { "endpoint": endpoint },
            "dataSources": [{
                "kind": "Near/Runtime",
                "startBlock": 1,
                "mapping": { "file": "./dist/index.js", "handlers": [] }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn config_endpoints_override_manifest_endpoints() {
        let manifest = manifest_with_endpoint(serde_json::json!("https://from-manifest.example"));

        let defaults = NodeConfig::default();
        let from_manifest = resolve_endpoints(&defaults, &manifest).unwrap();
        assert_eq!(from_manifest[0].as_str(), "https://from-manifest.example/");

        let mut config = NodeConfig::default();
        config.endpoints = vec![Url::parse("https://from-cli.example").unwrap()];
        let from_cli = resolve_endpoints(&config, &manifest).unwrap();
        assert_eq!(from_cli[0].as_str(), "https://from-cli.example/");
    }

    #[test]
    fn invalid_manifest_endpoint_is_a_validation_error() {
        let manifest = manifest_with_endpoint(serde_json::json!("not a url"));
        let err = resolve_endpoints(&NodeConfig::default(), &manifest).unwrap_err();
        assert!(matches!(err, AppContextError::Validation(_)));
    }
}
