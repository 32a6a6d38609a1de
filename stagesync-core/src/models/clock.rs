//! Per-client clock estimate state.

use serde::{Deserialize, Serialize};

/// Qualification state of a client's clock estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Not enough samples yet to judge.
    Converging,
    /// Variance below threshold with enough samples; eligible for
    /// time-critical scheduling.
    Synchronized,
    /// Variance failed to converge within the probe budget. Reported,
    /// non-fatal; the client is excluded from time-critical commands
    /// until a later sample re-qualifies it.
    Unsynchronized,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Converging => "converging",
            Self::Synchronized => "synchronized",
            Self::Unsynchronized => "unsynchronized",
        };
        write!(f, "{value}")
    }
}

/// Smoothed round-trip and offset estimate for one client.
///
/// `offset_ms` is the client's local clock minus relay reference time:
/// `client_local = relay_reference + offset_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockEstimate {
    pub offset_ms: f64,
    /// Smoothed round-trip time.
    pub rtt_ms: f64,
    /// Smoothed round-trip variance (mean deviation, RFC 6298 style).
    pub rtt_var_ms: f64,
    pub samples: u32,
    /// Relay reference time of the last accepted sample.
    pub last_sample_at_ms: i64,
    pub state: SyncState,
}

impl ClockEstimate {
    #[must_use]
    pub const fn is_synchronized(&self) -> bool {
        matches!(self.state, SyncState::Synchronized)
    }

    /// Whether the estimate is recent enough to schedule against.
    #[must_use]
    pub const fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms - self.last_sample_at_ms <= ttl_ms
    }

    /// Translate a relay-reference deadline into this client's clock domain.
    #[must_use]
    pub fn to_client_time(&self, relay_deadline_ms: i64) -> i64 {
        #[allow(clippy::cast_possible_truncation)]
        let offset = self.offset_ms.round() as i64;
        relay_deadline_ms + offset
    }
}
