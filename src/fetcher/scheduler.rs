//! The fetch scheduler: decides which block heights to process next, using
//! the dictionary when applicable and falling back to sequential ranges,
//! honoring finalized vs. best targets, modulo-only fast paths, and bypass
//! lists.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::dispatcher::BlockDispatcher;
use super::worker::MemoryGate;
use super::{block_time_variance, BATCH_SCALE_INTERVAL, DICTIONARY_MAX_QUERY_SIZE, MINIMUM_BATCH_SIZE};
use crate::config::NodeConfig;
use crate::context::events::{EventBus, IndexerEvent};
use crate::dictionary::{DictionaryError, DictionaryService};
use crate::project::ProjectService;
use crate::rpc::types::{BlockReference, Finality};
use crate::rpc::ApiPool;
use crate::unfinalized::UnfinalizedTracker;

/// Decides the next heights to buffer and keeps chain-head targets fresh.
pub struct FetchScheduler {
    config: Arc<NodeConfig>,
    project: Arc<ProjectService>,
    pool: Arc<ApiPool>,
    dictionary: Option<Arc<DictionaryService>>,
    dispatcher: Arc<dyn BlockDispatcher>,
    unfinalized_tracker: Option<Arc<UnfinalizedTracker>>,
    memory_gate: Option<Arc<MemoryGate>>,
    events: EventBus,
    init_height: u64,
    latest_finalized: AtomicU64,
    latest_best: AtomicU64,
    batch_scale: Mutex<f64>,
    bypass_blocks: Mutex<Vec<u64>>,
}

impl FetchScheduler {
    /// Creates the scheduler. `init_height` is the cold-start height used
    /// until the dispatcher has buffered anything.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        project: Arc<ProjectService>,
        pool: Arc<ApiPool>,
        dictionary: Option<Arc<DictionaryService>>,
        dispatcher: Arc<dyn BlockDispatcher>,
        unfinalized_tracker: Option<Arc<UnfinalizedTracker>>,
        memory_gate: Option<Arc<MemoryGate>>,
        events: EventBus,
        init_height: u64,
    ) -> Arc<Self> {
        let bypass_blocks = config.bypass_blocks.clone();
        Arc::new(Self {
            config,
            project,
            pool,
            dictionary,
            dispatcher,
            unfinalized_tracker,
            memory_gate,
            events,
            init_height,
            latest_finalized: AtomicU64::new(0),
            latest_best: AtomicU64::new(0),
            batch_scale: Mutex::new(1.0),
            bypass_blocks: Mutex::new(bypass_blocks),
        })
    }

    /// The main scheduling loop; one `fetch_cycle` per iteration until
    /// cancellation.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!(init_height = self.init_height, "Fetch scheduler started.");
        loop {
            if token.is_cancelled() {
                tracing::info!("Fetch scheduler cancellation signal received, shutting down...");
                return;
            }
            self.fetch_cycle().await;
        }
    }

    /// Polls the finalized head on the block-time cadence, feeding the
    /// unfinalized tracker and the target events.
    pub async fn run_finalized_poller(self: Arc<Self>, token: CancellationToken) {
        let interval = block_time_variance(self.config.chain_interval_ms);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.fetch_head(Finality::Final).await {
                Ok((height, hash)) => {
                    self.latest_finalized.store(height, Ordering::Relaxed);
                    if let Some(tracker) = &self.unfinalized_tracker {
                        if let Some(trusted) = tracker.register_finalized(height, &hash).await {
                            if let Err(e) = self.dispatcher.rewind(trusted).await {
                                tracing::error!(error = %e, "Failed to rewind after finalized-head fork.");
                            }
                        }
                    }
                    if !self.config.unfinalized_blocks {
                        self.events.emit(IndexerEvent::BlockTarget { height });
                    }
                }
                // Head polling failures are routine; the next tick retries.
                Err(e) => tracing::warn!(error = %e, "Failed to fetch finalized chain head."),
            }
        }
    }

    /// Polls the best (optimistic) head on the same cadence.
    pub async fn run_best_poller(self: Arc<Self>, token: CancellationToken) {
        let interval = block_time_variance(self.config.chain_interval_ms);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.fetch_head(Finality::Optimistic).await {
                Ok((height, _)) => {
                    self.latest_best.store(height, Ordering::Relaxed);
                    self.events.emit(IndexerEvent::BlockBest { height });
                    if self.config.unfinalized_blocks {
                        self.events.emit(IndexerEvent::BlockTarget { height });
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to fetch best chain head."),
            }
        }
    }

    /// Re-evaluates the batch scale (and the worker memory gate) against
    /// the process RSS every minute.
    pub async fn run_batch_scale_timer(self: Arc<Self>, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(BATCH_SCALE_INTERVAL) => {}
            }

            if let Some(rss) = read_rss_bytes() {
                self.adjust_batch_scale(rss);
            }
        }
    }

    async fn fetch_head(
        &self,
        finality: Finality,
    ) -> Result<(u64, String), crate::rpc::RpcClientError> {
        let api = self.pool.unsafe_api().await.map_err(|e| {
            crate::rpc::RpcClientError::Network { method: "block".into(), message: e.to_string() }
        })?;
        let block = api.block(&BlockReference::finality(finality)).await?;
        Ok((block.header.height, block.header.hash))
    }

    fn start_height(&self) -> u64 {
        self.dispatcher
            .latest_buffered_height()
            .map(|h| h + 1)
            .unwrap_or(self.init_height)
    }

    fn target_height(&self) -> u64 {
        if self.config.unfinalized_blocks {
            self.latest_best.load(Ordering::Relaxed)
        } else {
            self.latest_finalized.load(Ordering::Relaxed)
        }
    }

    pub(crate) fn scaled_batch_size(&self) -> u64 {
        let scale = *self.batch_scale.lock().expect("batch scale lock poisoned");
        let scaled = (scale * self.config.batch_size as f64).round() as u64;
        scaled.max(MINIMUM_BATCH_SIZE.min(self.config.batch_size * 3))
    }

    pub(crate) fn adjust_batch_scale(&self, rss_bytes: u64) {
        let mut scale = self.batch_scale.lock().expect("batch scale lock poisoned");
        let over_budget = rss_bytes > self.config.memory_budget_bytes;
        let next = if over_budget { (*scale - 0.1).max(0.1) } else { (*scale + 0.1).min(1.0) };
        if (next - *scale).abs() > f64::EPSILON {
            tracing::info!(
                rss_bytes,
                budget = self.config.memory_budget_bytes,
                batch_scale = next,
                "Adjusted batch scale."
            );
        }
        *scale = next;

        if let Some(gate) = &self.memory_gate {
            gate.set_locked(over_budget);
        }
    }

    /// One scheduling decision: pick the next heights and hand them to the
    /// dispatcher, or sleep briefly when there is nothing to do.
    pub(crate) async fn fetch_cycle(&self) {
        let start_height = self.start_height();
        let scaled_batch = self.scaled_batch_size();
        let target = self.target_height();

        if target == 0
            || start_height > target
            || (self.dispatcher.free_size() as u64) < scaled_batch
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
            return;
        }

        if let Some(dictionary) = &self.dictionary {
            if dictionary.usable(start_height) {
                self.dictionary_cycle(dictionary, start_height, scaled_batch, target).await;
                return;
            }
        }

        self.sequential_cycle(start_height, scaled_batch, target).await;
    }

    async fn dictionary_cycle(
        &self,
        dictionary: &Arc<DictionaryService>,
        start_height: u64,
        scaled_batch: u64,
        target: u64,
    ) {
        let query_end = start_height + DICTIONARY_MAX_QUERY_SIZE;
        let page = match dictionary
            .scoped_dictionary_entries(start_height, query_end, scaled_batch)
            .await
        {
            Ok(page) => page,
            Err(e @ DictionaryError::GenesisMismatch { .. }) => {
                tracing::warn!(error = %e, "Dictionary disabled; next scan falls back to sequential ranges.");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dictionary unavailable this cycle; using sequential scan.");
                self.sequential_cycle(start_height, scaled_batch, target).await;
                return;
            }
        };

        // A reset may have moved the resume point while the query was in
        // flight; the result no longer describes the right range.
        if self.start_height() != start_height {
            tracing::debug!(
                start_height,
                "Start height moved during dictionary query; discarding result."
            );
            return;
        }

        let range_end = (query_end - 1).min(page.metadata.last_processed_height).min(target);
        let mut merged: BTreeSet<u64> = page
            .batch_blocks
            .iter()
            .copied()
            .filter(|h| *h >= start_height && *h <= range_end)
            .collect();
        merged.extend(self.modulo_heights(start_height, range_end, u64::MAX));

        if merged.is_empty() {
            let advance = (query_end - 1).min(page.metadata.last_processed_height);
            tracing::info!(
                start_height,
                advance,
                "Dictionary scan found no matching heights; advancing."
            );
            self.dispatcher.enqueue_blocks(Vec::new(), advance).await;
            return;
        }

        let free = self.dispatcher.free_size() as u64;
        let heights: Vec<u64> = merged.into_iter().take(free as usize).collect();
        self.enqueue_cleaned(heights).await;
    }

    async fn sequential_cycle(&self, start_height: u64, scaled_batch: u64, target: u64) {
        let heights = if self.project.all_handlers_are_modulo_blocks() {
            let modulos = self.project.block_handler_modulos();
            let max_modulo = modulos.iter().copied().max().unwrap_or(1);
            let range_end = (start_height + self.config.batch_size * max_modulo).min(target);

            let matching =
                self.modulo_heights(start_height, range_end, self.config.batch_size);
            if matching.is_empty() {
                // Nothing matches in the whole expanded window; skip it.
                self.dispatcher.enqueue_blocks(Vec::new(), range_end).await;
                return;
            }
            matching
        } else {
            let end_height = (start_height + scaled_batch - 1).min(target);
            (start_height..=end_height).collect()
        };

        let free = self.dispatcher.free_size();
        let heights: Vec<u64> = heights.into_iter().take(free).collect();
        self.enqueue_cleaned(heights).await;
    }

    fn modulo_heights(&self, start: u64, end: u64, limit: u64) -> Vec<u64> {
        let modulos = self.project.block_handler_modulos();
        if modulos.is_empty() {
            return Vec::new();
        }
        (start..=end)
            .filter(|h| modulos.iter().any(|m| h % m == 0))
            .take(limit as usize)
            .collect()
    }

    /// Applies the bypass list and hands the cleaned heights over. The
    /// advertised resume point is the raw maximum, so bypassing never
    /// re-scans.
    async fn enqueue_cleaned(&self, raw_heights: Vec<u64>) {
        let Some(&raw_latest) = raw_heights.last() else { return };

        let cleaned: Vec<u64> = {
            let mut bypass = self.bypass_blocks.lock().expect("bypass list lock poisoned");
            let cleaned =
                raw_heights.iter().copied().filter(|h| !bypass.contains(h)).collect();
            // Consumed bypass members are dropped; later ones wait their
            // turn.
            bypass.retain(|b| *b > raw_latest);
            cleaned
        };

        if cleaned.len() != raw_heights.len() {
            tracing::info!(
                bypassed = raw_heights.len() - cleaned.len(),
                "Bypassed blocks removed from scan."
            );
        }

        tracing::debug!(
            count = cleaned.len(),
            latest_buffered = raw_latest,
            "Enqueueing block heights."
        );
        self.dispatcher.enqueue_blocks(cleaned, raw_latest).await;
    }
}

/// Resident set size of this process, when the platform exposes it.
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}
