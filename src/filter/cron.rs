//! Cron-based block timestamp filtering.
//!
//! A [`CronFilter`] is compiled at project load from a handler's cron
//! expression and an anchor timestamp (the block at the datasource's start
//! height). It keeps only `{expression, next}` and advances by pure forward
//! iteration: matching a block moves `next` to the first slot strictly
//! after that block's timestamp.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// Failures compiling or evaluating a cron filter.
#[derive(Debug, Error)]
pub enum CronFilterError {
    /// The cron expression did not parse.
    #[error("Invalid cron expression `{expression}`: {message}")]
    InvalidExpression {
        /// The offending expression.
        expression: String,
        /// Parser diagnostic.
        message: String,
    },

    /// The schedule has no occurrence after the anchor timestamp.
    #[error("Cron expression `{0}` has no occurrence after its anchor")]
    NoUpcomingSlot(String),
}

fn nanos_to_datetime(nanos: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos as i64)
}

/// A compiled cron filter with its next matching slot.
#[derive(Debug, Clone)]
pub struct CronFilter {
    expression: String,
    schedule: Schedule,
    next: DateTime<Utc>,
}

impl CronFilter {
    /// Compiles `expression` and seeds `next` with the first slot after the
    /// anchor timestamp (nanoseconds since the Unix epoch).
    pub fn compile(expression: &str, anchor_nanos: u64) -> Result<Self, CronFilterError> {
        let schedule =
            Schedule::from_str(expression).map_err(|e| CronFilterError::InvalidExpression {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;

        let anchor = nanos_to_datetime(anchor_nanos);
        let next = schedule
            .after(&anchor)
            .next()
            .ok_or_else(|| CronFilterError::NoUpcomingSlot(expression.to_string()))?;

        Ok(Self { expression: expression.to_string(), schedule, next })
    }

    /// The next slot this filter will match.
    pub fn next(&self) -> DateTime<Utc> {
        self.next
    }

    /// Evaluates a block timestamp against the current slot.
    ///
    /// Returns `true` and advances `next` past the block timestamp when the
    /// block lies beyond the current slot; otherwise leaves the slot
    /// untouched, so re-queries within the same slot stay idempotent.
    pub fn matches_and_advance(&mut self, block_timestamp_nanos: u64) -> bool {
        let block_time = nanos_to_datetime(block_timestamp_nanos);
        if block_time <= self.next {
            return false;
        }

        tracing::info!(
            expression = %self.expression,
            slot = %self.next,
            block_time = %block_time,
            "Cron filter matched block; advancing slot."
        );
        if let Some(next) = self.schedule.after(&block_time).next() {
            self.next = next;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NANOS_PER_MIN: u64 = 60 * 1_000_000_000;

    // Top of every hour, in the seconds-resolution syntax the `cron` crate
    // expects.
    const HOURLY: &str = "0 0 * * * *";

    // 2021-01-01T00:00:00Z.
    const ANCHOR: u64 = 1_609_459_200 * 1_000_000_000;

    #[test]
    fn compile_rejects_garbage_expressions() {
        let err = CronFilter::compile("not a cron", ANCHOR).unwrap_err();
        assert!(matches!(err, CronFilterError::InvalidExpression { .. }));
    }

    #[test]
    fn block_before_next_slot_does_not_match() {
        let mut filter = CronFilter::compile(HOURLY, ANCHOR).unwrap();
        let next_before = filter.next();

        // 30 minutes past the anchor, still short of the next hourly slot.
        assert!(!filter.matches_and_advance(ANCHOR + 30 * NANOS_PER_MIN));
        assert_eq!(filter.next(), next_before);
    }

    #[test]
    fn block_past_next_slot_matches_and_advances() {
        let mut filter = CronFilter::compile(HOURLY, ANCHOR).unwrap();

        // 90 minutes past the anchor, beyond the first hourly slot.
        let matched_at = ANCHOR + 90 * NANOS_PER_MIN;
        assert!(filter.matches_and_advance(matched_at));

        // `next` now points past the matched block time.
        assert!(filter.next() > nanos_to_datetime(matched_at));
    }

    #[test]
    fn requery_within_the_same_slot_is_idempotent() {
        let mut filter = CronFilter::compile(HOURLY, ANCHOR).unwrap();

        let matched_at = ANCHOR + 90 * NANOS_PER_MIN;
        assert!(filter.matches_and_advance(matched_at));

        // A block just after the matched one, still before the new slot.
        assert!(!filter.matches_and_advance(matched_at + NANOS_PER_MIN));

        // A block beyond the new slot matches again.
        assert!(filter.matches_and_advance(matched_at + 60 * NANOS_PER_MIN));
    }
}
