//! Monotonic millisecond clocks.
//!
//! The relay's reference clock and each client's local clock are both
//! `Instant`-anchored millisecond counters. They share no epoch; the clock
//! estimator measures the offset between them, and that offset is the only
//! bridge between the two domains.

use std::time::Instant;

/// Monotonic clock yielding millisecond timestamps since construction.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceClock {
    epoch: Instant,
}

impl ReferenceClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

}

impl Default for ReferenceClock {
    fn default() -> Self {
        Self::new()
    }
}
