//! The block dispatcher: claims scheduled heights, drives assembly and
//! indexing, and commits results in strictly ascending order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, FutureExt, StreamExt};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::block::{AssemblyError, BlockAssembler};
use crate::context::events::{EventBus, IndexerEvent};
use crate::dictionary::DictionaryService;
use crate::indexer::{IndexerError, IndexerService, ProcessBlockResponse};
use crate::persistence::{PersistenceError, StateRepository};
use crate::project::{ProjectError, ProjectService};
use crate::rpc::{ApiPool, PoolError};
use crate::store::{StoreError, StoreService};

/// Fatal dispatcher failures; any of these terminates the pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Block assembly failed with a transient or decode error.
    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    /// The indexer aborted.
    #[error(transparent)]
    Indexer(#[from] IndexerError),

    /// No healthy RPC connection.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The store rejected a commit or rollback.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Engine metadata could not be persisted.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A rewind could not update the datasource set.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// A worker task died without replying.
    #[error("Worker {0} stopped responding")]
    WorkerGone(usize),
}

/// The scheduler-facing surface of a dispatcher.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockDispatcher: Send + Sync {
    /// Buffers `heights` (ascending, already bypass-cleaned) and records
    /// `latest_buffered_height`, the raw pre-bypass maximum.
    async fn enqueue_blocks(&self, heights: Vec<u64>, latest_buffered_height: u64);

    /// Discards buffered heights at or above `height` and resets
    /// `latest_buffered_height` to `height - 1`.
    async fn flush_queue(&self, height: u64);

    /// Remaining queue capacity, the scheduler's backpressure signal.
    fn free_size(&self) -> usize;

    /// The highest height the scheduler has handed over, if any.
    fn latest_buffered_height(&self) -> Option<u64>;

    /// Rewinds all state above `last_trusted`: queue, store, dynamic
    /// datasources, and the committed-height marker.
    async fn rewind(&self, last_trusted: u64) -> Result<(), DispatchError>;
}

/// Shared post-processing used by both dispatcher variants: commits,
/// skips, dynamic-datasource resets and fork rewinds.
pub(crate) struct DispatchContext {
    pub project: Arc<ProjectService>,
    pub store: Arc<dyn StoreService>,
    pub state: Arc<dyn StateRepository>,
    pub dictionary: Option<Arc<DictionaryService>>,
    pub events: EventBus,
}

/// What the caller's processing loop should do after one height.
pub(crate) enum Advance {
    /// Keep draining the current batch.
    Continue,
    /// The queue was flushed; abandon the rest of the batch.
    Flushed,
}

impl DispatchContext {
    /// Commits one indexed block.
    pub async fn commit(
        &self,
        height: u64,
        block_hash: &str,
        timestamp: u64,
    ) -> Result<(), DispatchError> {
        self.store.commit_block(height).await?;
        self.state
            .set_last_processed_height(self.project.chain(), height, block_hash)
            .await?;
        self.events.emit(IndexerEvent::BlockProcessed { height, timestamp });
        Ok(())
    }

    /// Records a permanently unavailable height as skipped and advances.
    pub async fn skip_unavailable(&self, height: u64) -> Result<(), DispatchError> {
        tracing::warn!(height, "Block unavailable on chain; marking skipped.");
        self.state.set_last_processed_height(self.project.chain(), height, "").await?;
        Ok(())
    }

    /// Applies a dynamic-datasource creation at `height`: rebuilds the
    /// dictionary query set and asks for a flush of everything after it.
    pub fn reset_for_new_ds(&self, next_height: u64) {
        if let Some(dictionary) = &self.dictionary {
            dictionary.update_queries(&self.project.raw_datasources(), self.project.processors());
        }
        self.events.emit(IndexerEvent::RewindRequested { height: next_height });
        tracing::info!(
            next_height,
            "Dynamic datasource created; buffered work invalidated."
        );
    }

    /// Rewinds persistent state above `last_trusted`.
    pub async fn rewind_state(&self, last_trusted: u64) -> Result<(), DispatchError> {
        self.store.rollback(last_trusted + 1).await?;
        self.project.remove_dynamic_datasources_from(last_trusted + 1).await?;
        self.state
            .set_last_processed_height(self.project.chain(), last_trusted, "")
            .await?;
        if let Some(dictionary) = &self.dictionary {
            dictionary.update_queries(&self.project.raw_datasources(), self.project.processors());
        }
        self.events.emit(IndexerEvent::RewindRequested { height: last_trusted + 1 });
        tracing::warn!(last_trusted, "Rewound state for chain reorganization.");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<u64>,
    latest_buffered: Option<u64>,
}

/// The single-process dispatcher: an in-memory bounded queue drained by one
/// worker task that assembles blocks concurrently but indexes and commits
/// them in order.
pub struct SingleDispatcher {
    state: Mutex<QueueState>,
    capacity: usize,
    fetch_concurrency: usize,
    /// Bumped on every flush; in-flight batches from an older epoch are
    /// abandoned before their commits.
    flush_epoch: AtomicU64,
    work_available: Notify,
    pool: Arc<ApiPool>,
    assembler: BlockAssembler,
    indexer: Arc<IndexerService>,
    ctx: DispatchContext,
}

impl SingleDispatcher {
    /// Creates the dispatcher with a queue of `capacity` heights.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capacity: usize,
        fetch_concurrency: usize,
        pool: Arc<ApiPool>,
        assembler: BlockAssembler,
        indexer: Arc<IndexerService>,
        project: Arc<ProjectService>,
        store: Arc<dyn StoreService>,
        state: Arc<dyn StateRepository>,
        dictionary: Option<Arc<DictionaryService>>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            fetch_concurrency: fetch_concurrency.max(1),
            flush_epoch: AtomicU64::new(0),
            work_available: Notify::new(),
            pool,
            assembler,
            indexer,
            ctx: DispatchContext { project, store, state, dictionary, events },
        })
    }

    /// Seeds the resume point after a restart.
    pub fn init_latest_buffered(&self, height: Option<u64>) {
        self.state.lock().expect("dispatcher state lock poisoned").latest_buffered = height;
    }

    fn take_batch(&self) -> (Vec<u64>, u64) {
        let mut state = self.state.lock().expect("dispatcher state lock poisoned");
        let count = self.fetch_concurrency.min(state.queue.len());
        let batch = state.queue.drain(..count).collect();
        (batch, self.flush_epoch.load(Ordering::SeqCst))
    }

    /// The processing loop. Runs until cancellation; returns the first
    /// fatal error.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    tracing::info!("Block dispatcher cancellation signal received, shutting down...");
                    return Ok(());
                }

                _ = self.work_available.notified() => {}
            }

            loop {
                if token.is_cancelled() {
                    return Ok(());
                }
                let (batch, epoch) = self.take_batch();
                if batch.is_empty() {
                    break;
                }
                self.process_batch(batch, epoch).await?;
            }
        }
    }

    async fn process_batch(&self, batch: Vec<u64>, epoch: u64) -> Result<(), DispatchError> {
        let api = self.pool.unsafe_api().await?;

        // Assemble concurrently; `buffered` keeps results in height order
        // so commits stay strictly ascending.
        let assembled: Vec<(u64, Result<_, AssemblyError>)> = stream::iter(batch)
            .map(|height| {
                let api = Arc::clone(&api);
                let assembler = self.assembler.clone();
                async move { (height, assembler.assemble(&api, height).await) }.boxed()
            })
            .buffered(self.fetch_concurrency)
            .collect()
            .await;

        for (height, result) in assembled {
            if self.flush_epoch.load(Ordering::SeqCst) != epoch {
                tracing::debug!(height, "Queue flushed mid-batch; dropping stale work.");
                return Ok(());
            }

            let block = match result {
                Ok(block) => Arc::new(block),
                Err(AssemblyError::BlockUnavailable(height)) => {
                    self.ctx.skip_unavailable(height).await?;
                    continue;
                }
                Err(e) => {
                    self.pool.report_failure(api.endpoint()).await;
                    return Err(e.into());
                }
            };

            match self.handle_indexed(height, block).await? {
                Advance::Continue => {}
                Advance::Flushed => return Ok(()),
            }
        }
        Ok(())
    }

    async fn handle_indexed(
        &self,
        height: u64,
        block: Arc<crate::block::IndexedBlock>,
    ) -> Result<Advance, DispatchError> {
        let timestamp = block.header.timestamp;
        let response: ProcessBlockResponse = self.indexer.index_block(block).await?;

        if let Some(trusted) = response.reindex_block_height {
            self.rewind(trusted).await?;
            return Ok(Advance::Flushed);
        }

        let block_hash = response.block_hash.clone().unwrap_or_default();
        self.ctx.commit(height, &block_hash, timestamp).await?;

        if response.dynamic_ds_created {
            self.flush_queue(height + 1).await;
            self.ctx.reset_for_new_ds(height + 1);
            return Ok(Advance::Flushed);
        }
        Ok(Advance::Continue)
    }
}

#[async_trait]
impl BlockDispatcher for SingleDispatcher {
    async fn enqueue_blocks(&self, heights: Vec<u64>, latest_buffered_height: u64) {
        {
            let mut state = self.state.lock().expect("dispatcher state lock poisoned");
            state.queue.extend(heights);
            state.latest_buffered = Some(latest_buffered_height);
        }
        self.work_available.notify_one();
    }

    async fn flush_queue(&self, height: u64) {
        let mut state = self.state.lock().expect("dispatcher state lock poisoned");
        state.queue.retain(|h| *h < height);
        state.latest_buffered = Some(height.saturating_sub(1));
        self.flush_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn free_size(&self) -> usize {
        let state = self.state.lock().expect("dispatcher state lock poisoned");
        self.capacity.saturating_sub(state.queue.len())
    }

    fn latest_buffered_height(&self) -> Option<u64> {
        self.state.lock().expect("dispatcher state lock poisoned").latest_buffered
    }

    async fn rewind(&self, last_trusted: u64) -> Result<(), DispatchError> {
        self.flush_queue(last_trusted + 1).await;
        self.ctx.rewind_state(last_trusted).await
    }
}
