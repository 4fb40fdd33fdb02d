//! Randomized politeness delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange { min_ms: 0, max_ms: 0 };

    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// Uniform draw in `[min_ms, max_ms]`. An inverted range pins to `min_ms`.
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::rng().random_range(self.min_ms..=self.max_ms))
    }
}

/// Delay distributions applied around extraction calls and between batches.
///
/// Passed by value into the resolver, workers and scheduler so tests can use
/// [`JitterPolicy::none`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterPolicy {
    pub before_extraction: DelayRange,
    pub after_channel_resolution: DelayRange,
    pub after_enumeration: DelayRange,
    pub between_batches: DelayRange,
    pub between_sequential_items: DelayRange,
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self {
            before_extraction: DelayRange::new(500, 1_500),
            after_channel_resolution: DelayRange::new(1_000, 3_000),
            after_enumeration: DelayRange::new(1_000, 2_000),
            between_batches: DelayRange::new(2_000, 5_000),
            between_sequential_items: DelayRange::new(1_000, 3_000),
        }
    }
}

impl JitterPolicy {
    pub const fn none() -> Self {
        Self {
            before_extraction: DelayRange::ZERO,
            after_channel_resolution: DelayRange::ZERO,
            after_enumeration: DelayRange::ZERO,
            between_batches: DelayRange::ZERO,
            between_sequential_items: DelayRange::ZERO,
        }
    }

    pub async fn pause(range: DelayRange) {
        let delay = range.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
