//! The fetch-schedule-dispatch pipeline: the scheduler decides which
//! heights to process, the dispatchers claim and drive them.

pub mod dispatcher;
pub mod scheduler;
pub mod worker;

use std::time::Duration;

pub use dispatcher::{BlockDispatcher, DispatchError, SingleDispatcher};
pub use scheduler::FetchScheduler;
pub use worker::{MemoryGate, WorkerDispatcher};

/// Floor constant for scaled batch sizes.
pub(crate) const MINIMUM_BATCH_SIZE: u64 = 5;

/// Widest height range a single dictionary query may cover.
pub(crate) const DICTIONARY_MAX_QUERY_SIZE: u64 = 10_000;

/// Upper bound on the chain-head polling interval.
pub(crate) const MAX_BLOCK_TIME_VARIANCE: Duration = Duration::from_millis(5_000);

/// Cadence of the memory-pressure batch scaling check.
pub(crate) const BATCH_SCALE_INTERVAL: Duration = Duration::from_secs(60);

/// The chain-head polling interval: the default variance clamped to 90% of
/// the chain's block interval, so polling never lags a full block behind.
pub fn block_time_variance(chain_interval_ms: u64) -> Duration {
    MAX_BLOCK_TIME_VARIANCE.min(Duration::from_millis(chain_interval_ms * 9 / 10))
}
