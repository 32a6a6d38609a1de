//! Per-client round-trip and clock-offset estimation.
//!
//! Classic two-timestamp probe arithmetic: the relay stamps a probe with
//! its reference time, the client echoes with its local time, and the relay
//! stamps the reply on receipt. One probe yields one round-trip sample and
//! one offset sample; smoothing uses the RFC 6298 EWMA constants so a single
//! outlier probe never overwrites the estimate outright.

use dashmap::DashMap;
use stagesync_proto::ClientId;

use crate::models::{ClockEstimate, SyncState};
use crate::{Error, Result};

/// Smoothing gain for offset and round-trip (1/8).
const ALPHA: f64 = 0.125;
/// Smoothing gain for round-trip variance (1/4).
const BETA: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct ClockSyncConfig {
    /// Variance above this keeps a client out of time-critical scheduling.
    pub max_variance_ms: f64,
    /// Samples required before an estimate can qualify.
    pub min_samples: u32,
    /// Probe budget: a client still unconverged after this many samples is
    /// flagged unsynchronized instead of being retried indefinitely.
    pub max_qualification_probes: u32,
    /// Estimates older than this are stale and excluded from scheduling.
    pub estimate_ttl_ms: i64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            max_variance_ms: 25.0,
            min_samples: 3,
            max_qualification_probes: 16,
            estimate_ttl_ms: 10_000,
        }
    }
}

pub struct ClockSyncEstimator {
    estimates: DashMap<ClientId, ClockEstimate>,
    config: ClockSyncConfig,
}

impl ClockSyncEstimator {
    #[must_use]
    pub fn new(config: ClockSyncConfig) -> Self {
        Self {
            estimates: DashMap::new(),
            config,
        }
    }

    /// Fold one probe round-trip into the client's estimate.
    ///
    /// `probe_sent_at_ms` and `reply_received_at_ms` are relay reference
    /// time; `probe_echoed_at_ms` is the client's local clock. Returns the
    /// updated estimate.
    pub fn sample(
        &self,
        client_id: &ClientId,
        probe_sent_at_ms: i64,
        probe_echoed_at_ms: i64,
        reply_received_at_ms: i64,
    ) -> Result<ClockEstimate> {
        if reply_received_at_ms < probe_sent_at_ms {
            return Err(Error::MalformedPayload(format!(
                "probe reply received at {reply_received_at_ms}ms predates send at {probe_sent_at_ms}ms"
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let rtt = (reply_received_at_ms - probe_sent_at_ms) as f64;
        // offset = echoed - midpoint(sent, received), folded into one
        // expression to avoid losing precision on the midpoint division.
        #[allow(clippy::cast_precision_loss)]
        let offset = ((probe_echoed_at_ms - probe_sent_at_ms) as f64
            - (reply_received_at_ms - probe_echoed_at_ms) as f64)
            / 2.0;

        let mut entry = self
            .estimates
            .entry(client_id.clone())
            .or_insert_with(|| ClockEstimate {
                offset_ms: offset,
                rtt_ms: rtt,
                rtt_var_ms: rtt / 2.0,
                samples: 0,
                last_sample_at_ms: reply_received_at_ms,
                state: SyncState::Converging,
            });

        if entry.samples > 0 {
            entry.rtt_var_ms =
                (1.0 - BETA) * entry.rtt_var_ms + BETA * (entry.rtt_ms - rtt).abs();
            entry.rtt_ms = (1.0 - ALPHA) * entry.rtt_ms + ALPHA * rtt;
            entry.offset_ms = (1.0 - ALPHA) * entry.offset_ms + ALPHA * offset;
        }
        entry.samples += 1;
        entry.last_sample_at_ms = reply_received_at_ms;
        entry.state = self.qualify(entry.samples, entry.rtt_var_ms);

        Ok(entry.clone())
    }

    fn qualify(&self, samples: u32, rtt_var_ms: f64) -> SyncState {
        if samples >= self.config.min_samples && rtt_var_ms <= self.config.max_variance_ms {
            SyncState::Synchronized
        } else if samples >= self.config.max_qualification_probes {
            SyncState::Unsynchronized
        } else {
            SyncState::Converging
        }
    }

    #[must_use]
    pub fn get(&self, client_id: &ClientId) -> Option<ClockEstimate> {
        self.estimates.get(client_id).map(|entry| entry.clone())
    }

    /// Synchronized and fresh enough to schedule against right now.
    #[must_use]
    pub fn is_qualified(&self, client_id: &ClientId, now_ms: i64) -> bool {
        self.estimates.get(client_id).is_some_and(|estimate| {
            estimate.is_synchronized() && estimate.is_fresh(now_ms, self.config.estimate_ttl_ms)
        })
    }

    #[must_use]
    pub const fn estimate_ttl_ms(&self) -> i64 {
        self.config.estimate_ttl_ms
    }

    /// Drop a client's estimate. Called on eviction (identity and estimate
    /// leave together) and on reconnect, so a returning client re-qualifies
    /// against fresh probes before receiving time-critical commands.
    pub fn evict(&self, client_id: &ClientId) {
        self.estimates.remove(client_id);
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.estimates.len()
    }
}

impl Default for ClockSyncEstimator {
    fn default() -> Self {
        Self::new(ClockSyncConfig::default())
    }
}
