//! The cross-cutting event bus and the metrics snapshot fed from it.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Events emitted across the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerEvent {
    /// An endpoint passed its probe and joined the pool.
    ApiConnected {
        /// Endpoint URL.
        endpoint: String,
    },
    /// An endpoint failed and was quarantined.
    ApiDisconnected {
        /// Endpoint URL.
        endpoint: String,
    },
    /// The scheduler's current target head moved.
    BlockTarget {
        /// New target height.
        height: u64,
    },
    /// The best (optimistic) head moved.
    BlockBest {
        /// New best height.
        height: u64,
    },
    /// A block was indexed and committed.
    BlockProcessed {
        /// Height of the committed block.
        height: u64,
        /// Block timestamp in nanoseconds since the Unix epoch.
        timestamp: u64,
    },
    /// A rewind was requested (dynamic datasource or fork).
    RewindRequested {
        /// First height to re-index.
        height: u64,
    },
}

/// A broadcast bus for [`IndexerEvent`]s.
///
/// Emission never blocks and never fails: events published with no live
/// subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IndexerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Creates a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event.
    pub fn emit(&self, event: IndexerEvent) {
        let _ = self.sender.send(event);
    }

    /// Opens a new subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.sender.subscribe()
    }
}

/// A point-in-time view of indexing progress.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// When the engine started.
    pub start_time: tokio::time::Instant,
    /// The latest height committed to the store.
    pub latest_processed_height: u64,
    /// Timestamp of the latest committed block, seconds since the epoch.
    pub latest_processed_timestamp_secs: u64,
    /// The scheduler's current target head.
    pub target_height: u64,
    /// Total heights enqueued since start.
    pub enqueued_total: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
            latest_processed_height: 0,
            latest_processed_timestamp_secs: 0,
            target_height: 0,
            enqueued_total: 0,
        }
    }
}

/// Shared metrics handle updated by the event collector task.
#[derive(Clone, Default)]
pub struct AppMetrics {
    /// Shared snapshot.
    pub metrics: Arc<RwLock<Metrics>>,
}

impl AppMetrics {
    /// Spawns a task folding bus events into the snapshot until the bus
    /// closes.
    pub fn spawn_collector(&self, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut receiver = bus.subscribe();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(IndexerEvent::BlockProcessed { height, timestamp }) => {
                        let mut m = metrics.write().await;
                        m.latest_processed_height = height;
                        m.latest_processed_timestamp_secs = timestamp / 1_000_000_000;
                    }
                    Ok(IndexerEvent::BlockTarget { height }) => {
                        metrics.write().await.target_height = height;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Metrics collector lagged behind the event bus.");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(IndexerEvent::BlockTarget { height: 10 });
        assert_eq!(rx.recv().await.unwrap(), IndexerEvent::BlockTarget { height: 10 });
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(8);
        bus.emit(IndexerEvent::BlockBest { height: 1 });
    }

    #[tokio::test]
    async fn collector_folds_processed_blocks_into_metrics() {
        let bus = EventBus::new(8);
        let metrics = AppMetrics::default();
        let handle = metrics.spawn_collector(&bus);

        bus.emit(IndexerEvent::BlockProcessed { height: 44, timestamp: 9_000_000_000 });
        bus.emit(IndexerEvent::BlockTarget { height: 50 });

        // Yield until the collector has drained both events.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if metrics.metrics.read().await.latest_processed_height == 44 {
                break;
            }
        }

        let snapshot = metrics.metrics.read().await.clone();
        assert_eq!(snapshot.latest_processed_height, 44);
        assert_eq!(snapshot.latest_processed_timestamp_secs, 9);
        assert_eq!(snapshot.target_height, 50);
        handle.abort();
    }
}
