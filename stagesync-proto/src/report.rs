//! Delivery reports published back toward the operator boundary.

use serde::{Deserialize, Serialize};

use crate::id::ClientId;

/// Why a resolved client was excluded from a command's fan-out.
///
/// Capability mismatches are not listed here: a mixed-capability fleet is
/// expected, so those clients are filtered silently before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// No clock estimate yet, or variance above the qualification threshold.
    Unsynchronized,
    /// Estimate exists but its last sample is older than the freshness TTL.
    StaleEstimate,
    /// The client dropped between resolution and delivery.
    TransportLost,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Unsynchronized => "unsynchronized",
            Self::StaleEstimate => "stale_estimate",
            Self::TransportLost => "transport_lost",
        };
        write!(f, "{value}")
    }
}

/// One excluded client and the reason, carried in partial-delivery reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub client_id: ClientId,
    pub reason: ExclusionReason,
}

/// Terminal outcome of a command at the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Fan-out completed; `scheduled` may be zero (empty target sets
    /// succeed trivially) and `excluded` lists partial-delivery gaps.
    Delivered,
    /// Rejected before fan-out began (bad selector, unreachable deadline).
    Rejected { reason: String },
}

/// Per-command result published on the report channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub command_id: u64,
    pub outcome: CommandOutcome,
    /// Clients that matched the selector and capability filter.
    pub resolved: usize,
    /// Clients an instruction was actually queued for.
    pub scheduled: usize,
    pub excluded: Vec<Exclusion>,
    /// Shared deadline in relay reference time, when one was computed.
    pub deadline_ms: Option<i64>,
}
