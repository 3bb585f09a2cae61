//! Per-block handler selection and dispatch.
//!
//! For each fetched block the indexer resolves the datasources enabled at
//! that height, filters the block's contents against each handler, runs
//! transformers, and invokes the sandboxed mapping handlers. Side effects
//! (dynamic-datasource creations) are collected into the
//! [`ProcessBlockResponse`].

pub mod runtime;

use std::sync::Arc;

use thiserror::Error;

pub use runtime::{
    DynamicDsRequest, HandlerContext, HandlerError, HandlerLogger, HandlerRuntime,
};

use crate::block::types::{IndexedAction, IndexedBlock, IndexedTransaction};
use crate::filter::{self, passes_any};
use crate::project::{
    BaseHandlerKind, CompiledDatasource, CompiledHandler, HandlerFilter, HandlerKind,
    ProcessorError, ProjectError, ProjectService,
};
use crate::rpc::{ApiPool, PoolError};
use crate::store::StoreService;
use crate::unfinalized::UnfinalizedTracker;

/// Input to a mapping handler, tagged by base kind.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum HandlerInput {
    /// A whole block.
    Block(Arc<IndexedBlock>),
    /// One transaction.
    Transaction(IndexedTransaction),
    /// One action.
    Action(IndexedAction),
}

impl HandlerInput {
    /// The base kind of this input.
    pub fn base_kind(&self) -> BaseHandlerKind {
        match self {
            Self::Block(_) => BaseHandlerKind::Block,
            Self::Transaction(_) => BaseHandlerKind::Transaction,
            Self::Action(_) => BaseHandlerKind::Action,
        }
    }
}

/// Errors aborting the indexing of a block.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// A user handler failed; fatal to preserve store consistency.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// No healthy RPC connection for the handler API view.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A dynamic-datasource creation failed.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// A custom processor rejected its input.
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// A custom handler kind has no registered handler processor.
    #[error("No handler processor registered for kind `{0}`")]
    UnknownHandlerKind(String),

    /// A handler input failed to serialize for the sandbox.
    #[error("Failed to serialize handler input: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The outcome of indexing one block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessBlockResponse {
    /// Hash of the processed block; `None` when the block was skipped.
    pub block_hash: Option<String>,
    /// Whether a handler created a dynamic datasource.
    pub dynamic_ds_created: bool,
    /// Set when a fork was detected; the last trusted height.
    pub reindex_block_height: Option<u64>,
}

/// Runs handlers over fetched blocks.
pub struct IndexerService {
    project: Arc<ProjectService>,
    pool: Arc<ApiPool>,
    store: Arc<dyn StoreService>,
    runtime: Arc<dyn HandlerRuntime>,
    unfinalized: Option<Arc<UnfinalizedTracker>>,
}

impl IndexerService {
    /// Creates the indexer. `unfinalized` is present only in
    /// unfinalized-blocks mode.
    pub fn new(
        project: Arc<ProjectService>,
        pool: Arc<ApiPool>,
        store: Arc<dyn StoreService>,
        runtime: Arc<dyn HandlerRuntime>,
        unfinalized: Option<Arc<UnfinalizedTracker>>,
    ) -> Self {
        Self { project, pool, store, runtime, unfinalized }
    }

    /// Indexes one block: fork check, handler selection, filtering,
    /// transformation, invocation, and side-effect collection.
    pub async fn index_block(
        &self,
        block: Arc<IndexedBlock>,
    ) -> Result<ProcessBlockResponse, IndexerError> {
        let height = block.height();

        if let Some(tracker) = &self.unfinalized {
            if let Some(trusted) = tracker.register_indexed(&block.header).await {
                return Ok(ProcessBlockResponse {
                    block_hash: Some(block.hash().to_string()),
                    dynamic_ds_created: false,
                    reindex_block_height: Some(trusted),
                });
            }
        }

        let ctx = HandlerContext::new(
            self.pool.safe_api(height).await?,
            Arc::clone(&self.store),
            self.project.chain().to_string(),
        );

        for ds in self.project.datasources_at(height) {
            self.run_datasource(&ds, &block, &ctx).await?;
        }

        let mut dynamic_ds_created = false;
        for request in ctx.take_dynamic_ds_requests() {
            self.project
                .create_dynamic_datasource(
                    &request.template,
                    request.args,
                    height,
                    block.header.timestamp,
                )
                .await?;
            dynamic_ds_created = true;
        }

        Ok(ProcessBlockResponse {
            block_hash: Some(block.hash().to_string()),
            dynamic_ds_created,
            reindex_block_height: None,
        })
    }

    async fn run_datasource(
        &self,
        ds: &CompiledDatasource,
        block: &Arc<IndexedBlock>,
        ctx: &HandlerContext,
    ) -> Result<(), IndexerError> {
        for compiled in &ds.handlers {
            match &compiled.handler.kind {
                HandlerKind::Block | HandlerKind::Transaction | HandlerKind::Action => {
                    self.run_runtime_handler(ds, compiled, block, ctx).await?;
                }
                HandlerKind::Custom(kind) => {
                    self.run_custom_handler(ds, compiled, kind, block, ctx).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_runtime_handler(
        &self,
        ds: &CompiledDatasource,
        compiled: &CompiledHandler,
        block: &Arc<IndexedBlock>,
        ctx: &HandlerContext,
    ) -> Result<(), IndexerError> {
        let handler = &compiled.handler;
        let inputs = match &handler.kind {
            HandlerKind::Block => {
                let passes = match compiled.block_filters() {
                    None => true,
                    Some(filters) => {
                        filters.is_empty()
                            || filters.iter().any(|f| filter::filter_block(block, Some(f)))
                    }
                };
                if passes {
                    vec![HandlerInput::Block(Arc::clone(block))]
                } else {
                    Vec::new()
                }
            }
            HandlerKind::Transaction => {
                let spec = handler.filter.as_ref().and_then(HandlerFilter::as_transaction);
                block
                    .transactions
                    .iter()
                    .filter(|tx| {
                        passes_any(*tx, spec, |tx, f| filter::filter_transaction(tx, Some(f)))
                    })
                    .cloned()
                    .map(HandlerInput::Transaction)
                    .collect()
            }
            HandlerKind::Action => {
                let spec = handler.filter.as_ref().and_then(HandlerFilter::as_action);
                block
                    .actions
                    .iter()
                    .filter(|action| {
                        passes_any(*action, spec, |a, f| filter::filter_action(a, Some(f)))
                    })
                    .cloned()
                    .map(HandlerInput::Action)
                    .collect()
            }
            HandlerKind::Custom(_) => unreachable!("custom handlers are dispatched separately"),
        };

        for input in inputs {
            let value = serde_json::to_value(&input)?;
            self.runtime
                .invoke(&ds.source.mapping.file, &handler.handler, &value, ctx)
                .await?;
        }
        Ok(())
    }

    async fn run_custom_handler(
        &self,
        ds: &CompiledDatasource,
        compiled: &CompiledHandler,
        kind: &str,
        block: &Arc<IndexedBlock>,
        ctx: &HandlerContext,
    ) -> Result<(), IndexerError> {
        let handler = &compiled.handler;
        let processor = ds
            .source
            .processor_kind()
            .and_then(|k| self.project.processors().get(k))
            .ok_or_else(|| IndexerError::UnknownHandlerKind(kind.to_string()))?;
        let handler_processor = processor
            .handler_processors()
            .get(kind)
            .ok_or_else(|| IndexerError::UnknownHandlerKind(kind.to_string()))?;

        let raw_filter = match &handler.filter {
            Some(HandlerFilter::Custom(raw)) => raw.clone(),
            _ => serde_json::Value::Null,
        };

        let inputs: Vec<HandlerInput> = match handler_processor.base_kind {
            BaseHandlerKind::Block => vec![HandlerInput::Block(Arc::clone(block))],
            BaseHandlerKind::Transaction => {
                block.transactions.iter().cloned().map(HandlerInput::Transaction).collect()
            }
            BaseHandlerKind::Action => {
                block.actions.iter().cloned().map(HandlerInput::Action).collect()
            }
        };

        for input in inputs {
            if !(handler_processor.filter)(&input, &raw_filter) {
                continue;
            }
            for value in handler_processor.transformer.apply(&input)? {
                self.runtime
                    .invoke(&ds.source.mapping.file, &handler.handler, &value, ctx)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::runtime::MockHandlerRuntime;
    use super::*;
    use crate::config::RpcRetryConfig;
    use crate::context::events::EventBus;
    use crate::persistence::SqliteStateRepository;
    use crate::project::{Datasource, DatasourceProcessor, HandlerProcessor, Transformer};
    use crate::rpc::pool::DeclaredChain;
    use crate::store::MockStoreService;
    use crate::test_helpers::{BlockViewBuilder, IndexedBlockBuilder, IndexedTransactionBuilder};

    async fn test_pool() -> (mockito::ServerGuard, Arc<ApiPool>) {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({ "method": "status" })))
            .with_body(
                serde_json::json!({
                    "jsonrpc": "2.0", "id": 1,
                    "result": {
                        "chain_id": "mainnet",
                        "genesis_height": 1,
                        "sync_info": { "latest_block_hash": "tip", "latest_block_height": 10 }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "method": "block", "params": { "block_id": 1 }
            })))
            .with_body(
                serde_json::json!({
                    "jsonrpc": "2.0", "id": 1,
                    "result": BlockViewBuilder::new().height(1).hash("0xGEN").build()
                })
                .to_string(),
            )
            .create_async()
            .await;

        let pool = ApiPool::connect(
            &[Url::parse(&server.url()).unwrap()],
            &DeclaredChain::default(),
            RpcRetryConfig::no_retry(),
            5,
            EventBus::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (server, pool)
    }

    fn runtime_ds(start_block: u64, handlers: serde_json::Value) -> Datasource {
        serde_json::from_value(serde_json::json!({
            "kind": "Near/Runtime",
            "startBlock": start_block,
            "mapping": { "file": "./dist/index.js", "handlers": handlers }
        }))
        .unwrap()
    }

    async fn project_with(
        datasources: Vec<Datasource>,
        templates: Vec<Datasource>,
        processors: HashMap<String, Arc<dyn DatasourceProcessor>>,
    ) -> Arc<ProjectService> {
        let repo = SqliteStateRepository::new("sqlite::memory:").await.unwrap();
        repo.run_migrations().await.unwrap();
        Arc::new(
            ProjectService::new(
                "mainnet".into(),
                datasources,
                templates,
                HashMap::new(),
                Arc::new(repo),
                processors,
            )
            .await
            .unwrap(),
        )
    }

    fn sample_block() -> Arc<IndexedBlock> {
        Arc::new(
            IndexedBlockBuilder::new()
                .height(100)
                .transaction_with_actions(
                    IndexedTransactionBuilder::new()
                        .hash("tx-a")
                        .signer_id("alice.near")
                        .receiver_id("dex.near")
                        .build(),
                    vec![serde_json::json!({ "Transfer": { "deposit": "1" } })],
                )
                .transaction_with_actions(
                    IndexedTransactionBuilder::new()
                        .hash("tx-b")
                        .signer_id("bob.near")
                        .receiver_id("pool.near")
                        .build(),
                    vec![serde_json::json!("CreateAccount")],
                )
                .build(),
        )
    }

    #[tokio::test]
    async fn transaction_handler_sees_only_matching_transactions() {
        let (_server, pool) = test_pool().await;
        let project = project_with(
            vec![runtime_ds(1, serde_json::json!([
                { "kind": "near/TransactionHandler", "handler": "handleTx",
                  "filter": { "sender": "alice.near" } }
            ]))],
            vec![],
            HashMap::new(),
        )
        .await;

        let mut runtime = MockHandlerRuntime::new();
        runtime
            .expect_invoke()
            .withf(|_, handler, input, _| {
                handler == "handleTx" && input["hash"] == serde_json::json!("tx-a")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let indexer = IndexerService::new(
            project,
            pool,
            Arc::new(MockStoreService::new()),
            Arc::new(runtime),
            None,
        );

        let response = indexer.index_block(sample_block()).await.unwrap();
        assert_eq!(response.block_hash.as_deref(), Some("B100"));
        assert!(!response.dynamic_ds_created);
        assert_eq!(response.reindex_block_height, None);
    }

    #[tokio::test]
    async fn action_handler_filters_by_type() {
        let (_server, pool) = test_pool().await;
        let project = project_with(
            vec![runtime_ds(1, serde_json::json!([
                { "kind": "near/ActionHandler", "handler": "handleAction",
                  "filter": { "type": "CreateAccount" } }
            ]))],
            vec![],
            HashMap::new(),
        )
        .await;

        let mut runtime = MockHandlerRuntime::new();
        runtime
            .expect_invoke()
            .withf(|_, handler, input, _| {
                handler == "handleAction"
                    && input["transaction"]["hash"] == serde_json::json!("tx-b")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let indexer = IndexerService::new(
            project,
            pool,
            Arc::new(MockStoreService::new()),
            Arc::new(runtime),
            None,
        );

        indexer.index_block(sample_block()).await.unwrap();
    }

    #[tokio::test]
    async fn modulo_block_handler_skips_off_boundary_heights() {
        let (_server, pool) = test_pool().await;
        let project = project_with(
            vec![runtime_ds(1, serde_json::json!([
                { "kind": "near/BlockHandler", "handler": "handleBlock",
                  "filter": { "modulo": 100 } }
            ]))],
            vec![],
            HashMap::new(),
        )
        .await;

        let mut runtime = MockHandlerRuntime::new();
        // Height 100 matches, height 101 does not.
        runtime
            .expect_invoke()
            .withf(|_, handler, _, _| handler == "handleBlock")
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let indexer = IndexerService::new(
            project,
            pool,
            Arc::new(MockStoreService::new()),
            Arc::new(runtime),
            None,
        );

        indexer
            .index_block(Arc::new(IndexedBlockBuilder::new().height(100).build()))
            .await
            .unwrap();
        indexer
            .index_block(Arc::new(IndexedBlockBuilder::new().height(101).build()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handler_failure_is_fatal() {
        let (_server, pool) = test_pool().await;
        let project = project_with(
            vec![runtime_ds(1, serde_json::json!([
                { "kind": "near/BlockHandler", "handler": "handleBlock" }
            ]))],
            vec![],
            HashMap::new(),
        )
        .await;

        let mut runtime = MockHandlerRuntime::new();
        runtime.expect_invoke().returning(|_, handler, _, _| {
            Err(HandlerError { handler: handler.to_string(), message: "boom".into() })
        });

        let indexer = IndexerService::new(
            project,
            pool,
            Arc::new(MockStoreService::new()),
            Arc::new(runtime),
            None,
        );

        let err = indexer.index_block(sample_block()).await.unwrap_err();
        assert!(matches!(err, IndexerError::Handler(_)));
    }

    #[tokio::test]
    async fn dynamic_ds_request_is_applied_and_reported() {
        let (_server, pool) = test_pool().await;
        let mut template = runtime_ds(
            1,
            serde_json::json!([
                { "kind": "near/TransactionHandler", "handler": "handleFt",
                  "filter": { "receiver": "ft.near" } }
            ]),
        );
        template.name = Some("FtContract".into());

        let project = project_with(
            vec![runtime_ds(1, serde_json::json!([
                { "kind": "near/BlockHandler", "handler": "handleBlock" }
            ]))],
            vec![template],
            HashMap::new(),
        )
        .await;

        let mut runtime = MockHandlerRuntime::new();
        runtime.expect_invoke().times(1).returning(|_, _, _, ctx| {
            ctx.create_dynamic_datasource("FtContract", serde_json::json!({ "c": "ft.near" }));
            Ok(())
        });

        let indexer = IndexerService::new(
            Arc::clone(&project),
            pool,
            Arc::new(MockStoreService::new()),
            Arc::new(runtime),
            None,
        );

        let block = Arc::new(IndexedBlockBuilder::new().height(500).build());
        let response = indexer.index_block(block).await.unwrap();

        assert!(response.dynamic_ds_created);
        // The new datasource applies from the creating height onward.
        assert_eq!(project.datasources_at(500).len(), 2);
        assert_eq!(project.datasources_at(499).len(), 1);
    }

    struct FtProcessor {
        handlers: HashMap<String, HandlerProcessor>,
    }

    impl FtProcessor {
        fn new() -> Self {
            let mut handlers = HashMap::new();
            handlers.insert(
                "near/FtTransferHandler".to_string(),
                HandlerProcessor {
                    base_kind: BaseHandlerKind::Transaction,
                    filter: Arc::new(|input, raw| match input {
                        HandlerInput::Transaction(tx) => {
                            raw.get("receiver").and_then(|r| r.as_str())
                                == Some(tx.receiver_id.as_str())
                        }
                        _ => false,
                    }),
                    transformer: Transformer::V0(Arc::new(|input| match input {
                        HandlerInput::Transaction(tx) => {
                            Ok(serde_json::json!({ "from": tx.signer_id, "kind": "ft" }))
                        }
                        _ => Err(ProcessorError::Transform("expected transaction".into())),
                    })),
                },
            );
            Self { handlers }
        }
    }

    impl DatasourceProcessor for FtProcessor {
        fn kind(&self) -> &str {
            "Near/FtTransfers"
        }

        fn validate(&self, _datasource: &Datasource) -> Result<(), ProcessorError> {
            Ok(())
        }

        fn dictionary_query(
            &self,
            _filter: &serde_json::Value,
            _datasource: &Datasource,
        ) -> Option<crate::dictionary::DictionaryQueryEntry> {
            None
        }

        fn handler_processors(&self) -> &HashMap<String, HandlerProcessor> {
            &self.handlers
        }
    }

    #[tokio::test]
    async fn custom_processor_filters_and_transforms() {
        let (_server, pool) = test_pool().await;

        let custom_ds: Datasource = serde_json::from_value(serde_json::json!({
            "kind": "Near/FtTransfers",
            "startBlock": 1,
            "mapping": {
                "file": "./dist/ft.js",
                "handlers": [
                    { "kind": "near/FtTransferHandler", "handler": "handleFt",
                      "filter": { "receiver": "dex.near" } }
                ]
            }
        }))
        .unwrap();

        let mut processors: HashMap<String, Arc<dyn DatasourceProcessor>> = HashMap::new();
        processors.insert("Near/FtTransfers".into(), Arc::new(FtProcessor::new()));
        let project = project_with(vec![custom_ds], vec![], processors).await;

        let mut runtime = MockHandlerRuntime::new();
        // Only tx-a targets dex.near; the v0 transformer lifts to one call.
        runtime
            .expect_invoke()
            .withf(|file, handler, input, _| {
                file == "./dist/ft.js"
                    && handler == "handleFt"
                    && *input == serde_json::json!({ "from": "alice.near", "kind": "ft" })
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let indexer = IndexerService::new(
            project,
            pool,
            Arc::new(MockStoreService::new()),
            Arc::new(runtime),
            None,
        );

        indexer.index_block(sample_block()).await.unwrap();
    }

    #[tokio::test]
    async fn fork_detection_short_circuits_handlers() {
        let (_server, pool) = test_pool().await;
        let project = project_with(
            vec![runtime_ds(1, serde_json::json!([
                { "kind": "near/BlockHandler", "handler": "handleBlock" }
            ]))],
            vec![],
            HashMap::new(),
        )
        .await;

        let tracker = Arc::new(UnfinalizedTracker::new());
        tracker.register_finalized(98, "B98").await;
        tracker
            .register_indexed(&IndexedBlockBuilder::new().height(99).build().header)
            .await;

        let mut runtime = MockHandlerRuntime::new();
        runtime.expect_invoke().times(0);

        let indexer = IndexerService::new(
            project,
            pool,
            Arc::new(MockStoreService::new()),
            Arc::new(runtime),
            Some(tracker),
        );

        // Height 100 claims a parent that is not the indexed block 99.
        let block = Arc::new(
            IndexedBlockBuilder::new().height(100).prev_hash("FORKED").build(),
        );
        let response = indexer.index_block(block).await.unwrap();
        assert_eq!(response.reindex_block_height, Some(98));
    }
}
