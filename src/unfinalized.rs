//! Rollback detection across non-final heights.
//!
//! In unfinalized mode the engine indexes ahead of finality. The tracker
//! caches the headers it has indexed plus the finalized head, and flags a
//! fork as soon as either a new block's `prev_hash` contradicts its cached
//! ancestor or a finalized header contradicts an indexed one. The signal
//! carries the last height still trusted; everything above it is flushed
//! and re-indexed.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::rpc::types::BlockHeaderView;

#[derive(Debug, Clone)]
struct CachedHeader {
    hash: String,
    prev_hash: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Headers of indexed, not-yet-final blocks.
    indexed: BTreeMap<u64, CachedHeader>,
    /// Height and hash of the latest finalized header seen.
    finalized: Option<(u64, String)>,
}

/// Detects forks among indexed-but-unfinalized blocks.
#[derive(Debug, Default)]
pub struct UnfinalizedTracker {
    state: RwLock<TrackerState>,
}

impl UnfinalizedTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a block about to be indexed and checks its parent link.
    ///
    /// Returns the last trusted height when the block's `prev_hash`
    /// contradicts the cached header at `height - 1`; the caller must
    /// rewind everything above it.
    pub async fn register_indexed(&self, header: &BlockHeaderView) -> Option<u64> {
        let mut state = self.state.write().await;

        if let Some(cached) =
            header.height.checked_sub(1).and_then(|parent| state.indexed.get(&parent))
        {
            if cached.hash != header.prev_hash {
                let trusted = state.finalized.as_ref().map(|(h, _)| *h).unwrap_or(0);
                tracing::warn!(
                    height = header.height,
                    cached_parent = %cached.hash,
                    prev_hash = %header.prev_hash,
                    trusted,
                    "Unfinalized chain diverged from indexed ancestors."
                );
                // The stale ancestors get dropped; re-registration happens
                // as the rewound heights are indexed again.
                state.indexed.retain(|h, _| *h <= trusted);
                return Some(trusted);
            }
        }

        state.indexed.insert(
            header.height,
            CachedHeader { hash: header.hash.clone(), prev_hash: header.prev_hash.clone() },
        );
        None
    }

    /// Records the latest finalized header and cross-checks it against
    /// indexed blocks at the same height.
    ///
    /// Returns the last trusted height when the canonical chain disagrees
    /// with what was indexed.
    pub async fn register_finalized(&self, height: u64, hash: &str) -> Option<u64> {
        let mut state = self.state.write().await;

        let divergence = state
            .indexed
            .get(&height)
            .is_some_and(|cached| cached.hash != hash);

        if divergence {
            let trusted = state
                .finalized
                .as_ref()
                .map(|(h, _)| (*h).min(height.saturating_sub(1)))
                .unwrap_or(0);
            tracing::warn!(
                height,
                finalized_hash = %hash,
                trusted,
                "Finalized header contradicts an indexed block."
            );
            state.indexed.retain(|h, _| *h <= trusted);
            state.finalized = Some((height, hash.to_string()));
            return Some(trusted);
        }

        state.finalized = Some((height, hash.to_string()));
        // Settled heights no longer need tracking.
        state.indexed.retain(|h, _| *h > height);
        None
    }
}
