//! The worker-pool dispatcher: a fixed set of worker tasks, each owning a
//! fetched-block map and answering `fetch_block`/`process_block` commands.
//! Fetching is parallel across workers; indexing and commits stay strictly
//! ascending.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::dispatcher::{BlockDispatcher, DispatchContext, DispatchError};
use crate::block::{AssemblyError, BlockAssembler, IndexedBlock};
use crate::context::events::EventBus;
use crate::dictionary::DictionaryService;
use crate::indexer::{IndexerService, ProcessBlockResponse};
use crate::persistence::StateRepository;
use crate::project::ProjectService;
use crate::rpc::ApiPool;
use crate::store::StoreService;

/// A process-wide gate over worker memory use.
///
/// Writers lock it when the fetched-block working set breaches the budget;
/// workers await release before fetching more blocks.
#[derive(Debug, Default)]
pub struct MemoryGate {
    locked: AtomicBool,
    unlocked: Notify,
}

impl MemoryGate {
    /// Creates an unlocked gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks or releases the gate.
    pub fn set_locked(&self, locked: bool) {
        let was = self.locked.swap(locked, Ordering::SeqCst);
        if was && !locked {
            self.unlocked.notify_waiters();
        }
    }

    /// Whether the gate is currently locked.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Waits until the gate is open.
    pub async fn acquire(&self) {
        loop {
            let unlocked = self.unlocked.notified();
            if !self.is_locked() {
                return;
            }
            unlocked.await;
        }
    }
}

enum FetchedBlock {
    Available(Arc<IndexedBlock>),
    Unavailable,
}

enum WorkerCommand {
    Fetch {
        height: u64,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Process {
        height: u64,
        reply: oneshot::Sender<Result<(ProcessBlockResponse, u64), DispatchError>>,
    },
    Discard {
        from_height: u64,
    },
}

/// One worker: owns its fetched-block map, answers commands sequentially.
struct WorkerService {
    id: usize,
    pool: Arc<ApiPool>,
    assembler: BlockAssembler,
    indexer: Arc<IndexerService>,
    gate: Arc<MemoryGate>,
    blocks: HashMap<u64, FetchedBlock>,
}

impl WorkerService {
    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                command = commands.recv() => {
                    match command {
                        Some(WorkerCommand::Fetch { height, reply }) => {
                            let _ = reply.send(self.fetch_block(height).await);
                        }
                        Some(WorkerCommand::Process { height, reply }) => {
                            let _ = reply.send(self.process_block(height).await);
                        }
                        Some(WorkerCommand::Discard { from_height }) => {
                            self.blocks.retain(|h, _| *h < from_height);
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!(worker = self.id, "Worker stopped.");
    }

    /// Pulls the block at `height` into worker memory.
    ///
    /// A permanent miss is recorded, not raised; transient failures are
    /// fatal and re-raised to the dispatcher.
    async fn fetch_block(&mut self, height: u64) -> Result<(), DispatchError> {
        self.gate.acquire().await;

        let api = self.pool.unsafe_api().await?;
        match self.assembler.assemble(&api, height).await {
            Ok(block) => {
                self.blocks.insert(height, FetchedBlock::Available(Arc::new(block)));
                Ok(())
            }
            Err(AssemblyError::BlockUnavailable(height)) => {
                tracing::warn!(worker = self.id, height, "Block unavailable; recording skip.");
                self.blocks.insert(height, FetchedBlock::Unavailable);
                Ok(())
            }
            Err(e) => {
                self.pool.report_failure(api.endpoint()).await;
                Err(e.into())
            }
        }
    }

    /// Runs handlers over a previously fetched block. Unavailable heights
    /// answer with a `block_hash: None` response.
    async fn process_block(
        &mut self,
        height: u64,
    ) -> Result<(ProcessBlockResponse, u64), DispatchError> {
        match self.blocks.remove(&height) {
            Some(FetchedBlock::Available(block)) => {
                let timestamp = block.header.timestamp;
                let response = self.indexer.index_block(block).await?;
                Ok((response, timestamp))
            }
            Some(FetchedBlock::Unavailable) | None => Ok((
                ProcessBlockResponse {
                    block_hash: None,
                    dynamic_ds_created: false,
                    reindex_block_height: None,
                },
                0,
            )),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<(u64, usize)>,
    latest_buffered: Option<u64>,
}

/// The worker-pool dispatcher: round-robin height assignment across a
/// fixed worker set.
pub struct WorkerDispatcher {
    state: Mutex<QueueState>,
    capacity: usize,
    fetch_concurrency: usize,
    flush_epoch: AtomicU64,
    work_available: Notify,
    workers: Vec<mpsc::Sender<WorkerCommand>>,
    next_worker: AtomicUsize,
    gate: Arc<MemoryGate>,
    ctx: DispatchContext,
}

impl WorkerDispatcher {
    /// Creates the dispatcher and spawns `worker_count` worker tasks bound
    /// to `token`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_count: usize,
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
        token: CancellationToken,
    ) -> Arc<Self> {
        let gate = Arc::new(MemoryGate::new());
        let mut workers = Vec::with_capacity(worker_count.max(1));

        for id in 0..worker_count.max(1) {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let worker = WorkerService {
                id,
                pool: Arc::clone(&pool),
                assembler: assembler.clone(),
                indexer: Arc::clone(&indexer),
                gate: Arc::clone(&gate),
                blocks: HashMap::new(),
            };
            tokio::spawn(worker.run(rx, token.clone()));
            workers.push(tx);
        }

        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            fetch_concurrency: fetch_concurrency.max(1),
            flush_epoch: AtomicU64::new(0),
            work_available: Notify::new(),
            workers,
            next_worker: AtomicUsize::new(0),
            gate,
            ctx: DispatchContext { project, store, state, dictionary, events },
        })
    }

    /// Seeds the resume point after a restart.
    pub fn init_latest_buffered(&self, height: Option<u64>) {
        self.state.lock().expect("dispatcher state lock poisoned").latest_buffered = height;
    }

    /// The gate the batch-scale monitor locks under memory pressure.
    pub fn memory_gate(&self) -> Arc<MemoryGate> {
        Arc::clone(&self.gate)
    }

    fn take_batch(&self) -> (Vec<(u64, usize)>, u64) {
        let mut state = self.state.lock().expect("dispatcher state lock poisoned");
        let count = self.fetch_concurrency.min(state.queue.len());
        let batch = state.queue.drain(..count).collect();
        (batch, self.flush_epoch.load(Ordering::SeqCst))
    }

    async fn fetch_on_worker(&self, worker: usize, height: u64) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.workers[worker]
            .send(WorkerCommand::Fetch { height, reply })
            .await
            .map_err(|_| DispatchError::WorkerGone(worker))?;
        rx.await.map_err(|_| DispatchError::WorkerGone(worker))?
    }

    async fn process_on_worker(
        &self,
        worker: usize,
        height: u64,
    ) -> Result<(ProcessBlockResponse, u64), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.workers[worker]
            .send(WorkerCommand::Process { height, reply })
            .await
            .map_err(|_| DispatchError::WorkerGone(worker))?;
        rx.await.map_err(|_| DispatchError::WorkerGone(worker))?
    }

    /// The dispatch loop: fetch a batch across workers in parallel, then
    /// process and commit each height in ascending order.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    tracing::info!("Worker dispatcher cancellation signal received, shutting down...");
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

                future::try_join_all(
                    batch.iter().map(|(height, worker)| self.fetch_on_worker(*worker, *height)),
                )
                .await?;

                let mut flushed = false;
                for (height, worker) in batch {
                    if self.flush_epoch.load(Ordering::SeqCst) != epoch {
                        flushed = true;
                        break;
                    }

                    let (response, timestamp) = self.process_on_worker(worker, height).await?;

                    if let Some(trusted) = response.reindex_block_height {
                        self.rewind(trusted).await?;
                        flushed = true;
                        break;
                    }

                    match &response.block_hash {
                        None => self.ctx.skip_unavailable(height).await?,
                        Some(hash) => self.ctx.commit(height, hash, timestamp).await?,
                    }

                    if response.dynamic_ds_created {
                        self.flush_queue(height + 1).await;
                        self.ctx.reset_for_new_ds(height + 1);
                        flushed = true;
                        break;
                    }
                }
                if flushed {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlockDispatcher for WorkerDispatcher {
    async fn enqueue_blocks(&self, heights: Vec<u64>, latest_buffered_height: u64) {
        {
            let mut state = self.state.lock().expect("dispatcher state lock poisoned");
            for height in heights {
                let worker =
                    self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
                state.queue.push_back((height, worker));
            }
            state.latest_buffered = Some(latest_buffered_height);
        }
        self.work_available.notify_one();
    }

    async fn flush_queue(&self, height: u64) {
        {
            let mut state = self.state.lock().expect("dispatcher state lock poisoned");
            state.queue.retain(|(h, _)| *h < height);
            state.latest_buffered = Some(height.saturating_sub(1));
            self.flush_epoch.fetch_add(1, Ordering::SeqCst);
        }
        for worker in &self.workers {
            let _ = worker.send(WorkerCommand::Discard { from_height: height }).await;
        }
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

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::config::RpcRetryConfig;
    use crate::indexer::runtime::MockHandlerRuntime;
    use crate::persistence::SqliteStateRepository;
    use crate::project::Datasource;
    use crate::rpc::pool::DeclaredChain;
    use crate::store::MockStoreService;
    use crate::test_helpers::BlockViewBuilder;

    #[tokio::test]
    async fn memory_gate_blocks_until_released() {
        let gate = Arc::new(MemoryGate::new());
        gate.set_locked(true);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.set_locked(false);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn open_gate_admits_immediately() {
        let gate = MemoryGate::new();
        tokio::time::timeout(Duration::from_millis(100), gate.acquire()).await.unwrap();
    }

    fn rpc_result<T: serde::Serialize>(result: &T) -> String {
        serde_json::json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string()
    }

    async fn mock_block(server: &mut mockito::ServerGuard, height: u64) {
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "method": "block", "params": { "block_id": height }
            })))
            .with_body(rpc_result(&BlockViewBuilder::new().height(height).build()))
            .expect_at_least(1)
            .create_async()
            .await;
    }

    async fn mock_unavailable(server: &mut mockito::ServerGuard, height: u64) {
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "method": "block", "params": { "block_id": height }
            })))
            .with_body(
                serde_json::json!({
                    "jsonrpc": "2.0", "id": 1,
                    "error": {
                        "code": -32000, "message": "missing",
                        "cause": { "name": "UNKNOWN_BLOCK" }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;
    }

    async fn build_dispatcher(
        server: &mut mockito::ServerGuard,
        store: MockStoreService,
        token: CancellationToken,
    ) -> (Arc<WorkerDispatcher>, Arc<SqliteStateRepository>) {
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({ "method": "status" })))
            .with_body(rpc_result(&serde_json::json!({
                "chain_id": "mainnet",
                "genesis_height": 1,
                "sync_info": { "latest_block_hash": "tip", "latest_block_height": 10 }
            })))
            .create_async()
            .await;
        mock_block(server, 1).await;

        let pool = ApiPool::connect(
            &[Url::parse(&server.url()).unwrap()],
            &DeclaredChain::default(),
            RpcRetryConfig::no_retry(),
            5,
            EventBus::default(),
            token.clone(),
        )
        .await
        .unwrap();

        let repo = SqliteStateRepository::new("sqlite::memory:").await.unwrap();
        repo.run_migrations().await.unwrap();
        let repo = Arc::new(repo);

        let ds: Datasource = serde_json::from_value(serde_json::json!({
            "kind": "Near/Runtime",
            "startBlock": 1,
            "mapping": {
                "file": "./dist/index.js",
                "handlers": [ { "kind": "near/BlockHandler", "handler": "handleBlock" } ]
            }
        }))
        .unwrap();
        let project = Arc::new(
            ProjectService::new(
                "mainnet".into(),
                vec![ds],
                vec![],
                StdHashMap::new(),
                repo.clone(),
                StdHashMap::new(),
            )
            .await
            .unwrap(),
        );

        let mut runtime = MockHandlerRuntime::new();
        runtime.expect_invoke().returning(|_, _, _, _| Ok(()));

        let store: Arc<dyn StoreService> = Arc::new(store);
        let indexer = Arc::new(IndexerService::new(
            Arc::clone(&project),
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::new(runtime),
            None,
        ));

        let dispatcher = WorkerDispatcher::new(
            3,
            30,
            4,
            pool,
            BlockAssembler::new(2),
            indexer,
            project,
            store,
            repo.clone() as Arc<dyn StateRepository>,
            None,
            EventBus::default(),
            token,
        );
        (dispatcher, repo)
    }

    async fn wait_for_height(repo: &SqliteStateRepository, height: u64) {
        for _ in 0..200 {
            if repo.last_processed_height("mainnet").await.unwrap() == Some(height) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker dispatcher never committed height {height}");
    }

    #[tokio::test]
    async fn commits_stay_ascending_across_workers() {
        let mut server = mockito::Server::new_async().await;
        for height in 200u64..=205 {
            mock_block(&mut server, height).await;
        }

        let committed = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockStoreService::new();
        let committed_clone = Arc::clone(&committed);
        store.expect_commit_block().returning(move |height| {
            committed_clone.lock().unwrap().push(height);
            Ok(())
        });

        let token = CancellationToken::new();
        let (dispatcher, repo) = build_dispatcher(&mut server, store, token.clone()).await;
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(token.clone()));

        dispatcher.enqueue_blocks((200..=205).collect(), 205).await;
        wait_for_height(&repo, 205).await;

        assert_eq!(*committed.lock().unwrap(), (200..=205).collect::<Vec<_>>());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unavailable_block_reports_null_hash_and_advances() {
        let mut server = mockito::Server::new_async().await;
        mock_block(&mut server, 41).await;
        mock_unavailable(&mut server, 42).await;
        mock_block(&mut server, 43).await;

        let committed = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockStoreService::new();
        let committed_clone = Arc::clone(&committed);
        store.expect_commit_block().returning(move |height| {
            committed_clone.lock().unwrap().push(height);
            Ok(())
        });

        let token = CancellationToken::new();
        let (dispatcher, repo) = build_dispatcher(&mut server, store, token.clone()).await;
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(token.clone()));

        dispatcher.enqueue_blocks(vec![41, 42, 43], 43).await;
        wait_for_height(&repo, 43).await;

        assert_eq!(*committed.lock().unwrap(), vec![41, 43]);

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
