//! The project service: the static datasource set, templates, and the
//! dynamic datasources layered on top, resolved per height for the
//! indexer.

pub mod datasource;
pub mod dynamic;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

pub use datasource::{
    BaseHandlerKind, Datasource, DatasourceKind, DatasourceProcessor, Handler, HandlerFilter,
    HandlerKind, HandlerProcessor, ProcessorError, Transformer,
};
pub use dynamic::{DynamicDsError, DynamicDsRecord, DynamicDsService};

use crate::filter::{CompiledBlockFilter, CronFilterError, FilterSpec};
use crate::persistence::StateRepository;

/// Errors building or mutating the project.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// A cron expression failed to compile.
    #[error(transparent)]
    Cron(#[from] CronFilterError),

    /// A dynamic datasource operation failed.
    #[error(transparent)]
    Dynamic(#[from] DynamicDsError),

    /// A custom datasource failed its processor's validation.
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// A custom datasource names a kind no registered processor serves.
    #[error("No datasource processor registered for kind `{0}`")]
    UnknownProcessorKind(String),

    /// A cron-filtered datasource was compiled without an anchor timestamp.
    #[error("Missing anchor timestamp for cron filter on datasource starting at {start_block}")]
    MissingCronAnchor {
        /// Start height of the datasource.
        start_block: u64,
    },
}

/// A handler with its block filters compiled against the datasource anchor.
#[derive(Debug)]
pub struct CompiledHandler {
    /// The declared handler.
    pub handler: Handler,
    block_filters: Option<Vec<CompiledBlockFilter>>,
}

impl CompiledHandler {
    fn compile(
        handler: Handler,
        anchor_timestamp: Option<u64>,
        start_block: u64,
    ) -> Result<Self, ProjectError> {
        let block_filters = match (&handler.kind, &handler.filter) {
            (HandlerKind::Block, Some(HandlerFilter::Block(spec))) => {
                Some(compile_block_filters(spec, anchor_timestamp, start_block)?)
            }
            _ => None,
        };
        Ok(Self { handler, block_filters })
    }

    /// The compiled block filters, for block handlers that declared any.
    pub fn block_filters(&self) -> Option<&[CompiledBlockFilter]> {
        self.block_filters.as_deref()
    }
}

fn compile_block_filters(
    spec: &FilterSpec<crate::filter::BlockFilter>,
    anchor_timestamp: Option<u64>,
    start_block: u64,
) -> Result<Vec<CompiledBlockFilter>, ProjectError> {
    spec.as_slice()
        .iter()
        .map(|filter| {
            let anchor = match (&filter.timestamp, anchor_timestamp) {
                (Some(_), None) => {
                    return Err(ProjectError::MissingCronAnchor { start_block });
                }
                (_, anchor) => anchor.unwrap_or(0),
            };
            CompiledBlockFilter::compile(filter, anchor).map_err(ProjectError::from)
        })
        .collect()
}

/// A datasource with all of its handlers compiled.
#[derive(Debug)]
pub struct CompiledDatasource {
    /// The declared datasource.
    pub source: Datasource,
    /// Its handlers, compiled.
    pub handlers: Vec<CompiledHandler>,
}

impl CompiledDatasource {
    /// Compiles `source`, anchoring cron filters at `anchor_timestamp`
    /// (the timestamp of the block at the datasource's start height).
    pub fn compile(
        source: Datasource,
        anchor_timestamp: Option<u64>,
    ) -> Result<Self, ProjectError> {
        let handlers = source
            .mapping
            .handlers
            .iter()
            .cloned()
            .map(|h| CompiledHandler::compile(h, anchor_timestamp, source.start_block))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { source, handlers })
    }
}

/// The project service: static and dynamic datasources resolved per
/// height.
///
/// The dynamic set is an atomically swapped snapshot; creation and rewind
/// replace it wholesale so concurrent readers never see a partial update.
pub struct ProjectService {
    chain: String,
    static_datasources: Vec<Arc<CompiledDatasource>>,
    dynamic_service: DynamicDsService,
    dynamic_datasources: ArcSwap<Vec<Arc<CompiledDatasource>>>,
    processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
}

impl ProjectService {
    /// Builds the service: validates custom datasources against their
    /// processors, compiles static datasources, and re-materializes any
    /// persisted dynamic ones.
    ///
    /// `anchors` maps a datasource start height to the timestamp of the
    /// block at that height; required only for cron-filtered datasources.
    pub async fn new(
        chain: String,
        datasources: Vec<Datasource>,
        templates: Vec<Datasource>,
        anchors: HashMap<u64, u64>,
        repository: Arc<dyn StateRepository>,
        processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
    ) -> Result<Self, ProjectError> {
        for ds in datasources.iter().chain(templates.iter()) {
            if let Some(kind) = ds.processor_kind() {
                let processor = processors
                    .get(kind)
                    .ok_or_else(|| ProjectError::UnknownProcessorKind(kind.to_string()))?;
                processor.validate(ds)?;
            }
        }

        let static_datasources = datasources
            .into_iter()
            .map(|ds| {
                let anchor = anchors.get(&ds.start_block).copied();
                CompiledDatasource::compile(ds, anchor).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dynamic_service = DynamicDsService::new(chain.clone(), templates, repository);
        let dynamic_datasources = dynamic_service
            .load()
            .await?
            .into_iter()
            .map(|(ds, record)| {
                CompiledDatasource::compile(ds, Some(record.created_at_timestamp)).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            static_count = static_datasources.len(),
            dynamic_count = dynamic_datasources.len(),
            "Project datasources loaded."
        );

        Ok(Self {
            chain,
            static_datasources,
            dynamic_service,
            dynamic_datasources: ArcSwap::new(Arc::new(dynamic_datasources)),
            processors,
        })
    }

    /// The chain id this project indexes.
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// The registered custom datasource processors.
    pub fn processors(&self) -> &HashMap<String, Arc<dyn DatasourceProcessor>> {
        &self.processors
    }

    /// The lowest start height across static datasources; the cold-start
    /// height of the project.
    pub fn start_height(&self) -> u64 {
        self.static_datasources
            .iter()
            .map(|ds| ds.source.start_block)
            .min()
            .unwrap_or(1)
    }

    /// All datasources enabled at `height`: static and dynamic with
    /// `start_block <= height`.
    pub fn datasources_at(&self, height: u64) -> Vec<Arc<CompiledDatasource>> {
        let dynamic = self.dynamic_datasources.load();
        self.static_datasources
            .iter()
            .chain(dynamic.iter())
            .filter(|ds| ds.source.start_block <= height)
            .cloned()
            .collect()
    }

    /// The raw declared shape of every current datasource, static then
    /// dynamic; input to dictionary query construction.
    pub fn raw_datasources(&self) -> Vec<Datasource> {
        let dynamic = self.dynamic_datasources.load();
        self.static_datasources
            .iter()
            .chain(dynamic.iter())
            .map(|ds| ds.source.clone())
            .collect()
    }

    /// Modulo values of every modulo-filtered block handler.
    pub fn block_handler_modulos(&self) -> Vec<u64> {
        let dynamic = self.dynamic_datasources.load();
        self.static_datasources
            .iter()
            .chain(dynamic.iter())
            .flat_map(|ds| ds.handlers.iter())
            .filter_map(|h| h.block_filters())
            .flatten()
            .filter_map(|f| f.modulo)
            .collect()
    }

    /// Whether every handler in the project is a modulo-filtered block
    /// handler; enables the scheduler's sparse fast path.
    pub fn all_handlers_are_modulo_blocks(&self) -> bool {
        let dynamic = self.dynamic_datasources.load();
        let mut any = false;
        for ds in self.static_datasources.iter().chain(dynamic.iter()) {
            for handler in &ds.handlers {
                match handler.block_filters() {
                    Some(filters) if filters.iter().all(|f| f.modulo.is_some()) => any = true,
                    _ => return false,
                }
            }
        }
        any
    }

    /// Creates a dynamic datasource from a template at `height`, persists
    /// it, and publishes the new snapshot.
    pub async fn create_dynamic_datasource(
        &self,
        template_name: &str,
        args: serde_json::Value,
        height: u64,
        block_timestamp: u64,
    ) -> Result<(), ProjectError> {
        let (ds, record) =
            self.dynamic_service.create(template_name, args, height, block_timestamp).await?;
        let compiled =
            Arc::new(CompiledDatasource::compile(ds, Some(record.created_at_timestamp))?);

        let current = self.dynamic_datasources.load_full();
        let mut next = current.as_ref().clone();
        next.push(compiled);
        self.dynamic_datasources.store(Arc::new(next));
        Ok(())
    }

    /// Drops dynamic datasources created at or above `height`, from both
    /// the snapshot and the persisted log. Called on rewinds.
    pub async fn remove_dynamic_datasources_from(
        &self,
        height: u64,
    ) -> Result<u64, ProjectError> {
        let removed = self.dynamic_service.delete_records_from(height).await?;

        let current = self.dynamic_datasources.load_full();
        let next: Vec<_> =
            current.iter().filter(|ds| ds.source.start_block < height).cloned().collect();
        self.dynamic_datasources.store(Arc::new(next));
        Ok(removed)
    }
}
