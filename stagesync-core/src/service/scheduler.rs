//! Turns one command envelope into per-client scheduled instructions.
//!
//! The shared deadline is `now + max(round-trip over resolved clients) +
//! safety margin`: sized to the *slowest* reachable client, not the average,
//! so every included client can receive and buffer its instruction before
//! the deadline fires. The deadline is then translated into each client's
//! own clock domain via its estimated offset.

use std::collections::HashMap;

use parking_lot::Mutex;
use stagesync_proto::{
    ClientId, CommandEnvelope, CommandKind, Exclusion, ExclusionReason, ScheduledInstruction,
};

use crate::models::ClockEstimate;
use crate::service::clock::ClockSyncEstimator;
use crate::service::registry::ClientRegistry;
use crate::{Error, Result};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fixed margin added on top of the worst observed round-trip.
    pub safety_margin_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            safety_margin_ms: 50,
        }
    }
}

/// A superseded in-flight instruction to cancel on a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub client_id: ClientId,
    pub command_id: u64,
}

/// Everything `schedule` decides, composed before any send begins so the
/// max-latency snapshot is consistent.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub command_id: u64,
    /// Shared deadline in relay reference time; `None` when no client
    /// qualified (empty outcomes succeed trivially).
    pub deadline_ms: Option<i64>,
    pub instructions: Vec<ScheduledInstruction>,
    /// Older same-kind instructions superseded by this command.
    pub cancellations: Vec<Cancellation>,
    /// Partial-delivery gaps, reported but never fatal.
    pub excluded: Vec<Exclusion>,
    /// Clients matching selector and capability, before sync filtering.
    pub resolved: usize,
}

#[derive(Debug, Clone)]
struct Inflight {
    command_id: u64,
    deadline_ms: i64,
}

pub struct CommandScheduler {
    registry: Arc<ClientRegistry>,
    estimator: Arc<ClockSyncEstimator>,
    /// Last in-flight command per (kind, client), for supersede tracking.
    inflight: Mutex<HashMap<(CommandKind, ClientId), Inflight>>,
    config: SchedulerConfig,
}

impl CommandScheduler {
    #[must_use]
    pub fn new(
        registry: Arc<ClientRegistry>,
        estimator: Arc<ClockSyncEstimator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            estimator,
            inflight: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Resolve, qualify, and timestamp a command.
    ///
    /// Per-client failures degrade to exclusions; only structurally invalid
    /// commands (unreachable deadline hint) are rejected outright, before
    /// any fan-out state is touched.
    pub fn schedule(&self, envelope: &CommandEnvelope, now_ms: i64) -> Result<ScheduleOutcome> {
        let kind = envelope.kind();

        // Selector hits, narrowed to clients holding the capability. The
        // capability filter is silent: mixed-capability fleets are expected.
        let candidates: Vec<ClientId> = self
            .registry
            .lookup(&envelope.target)
            .into_iter()
            .filter(|id| {
                self.registry
                    .get(id)
                    .is_some_and(|identity| identity.supports(kind))
            })
            .collect();
        let resolved = candidates.len();

        let mut qualified: Vec<(ClientId, ClockEstimate)> = Vec::with_capacity(resolved);
        let mut excluded = Vec::new();
        for id in candidates {
            match self.estimator.get(&id) {
                Some(estimate) if estimate.is_synchronized() => {
                    if estimate.is_fresh(now_ms, self.estimator.estimate_ttl_ms()) {
                        qualified.push((id, estimate));
                    } else {
                        excluded.push(Exclusion {
                            client_id: id,
                            reason: ExclusionReason::StaleEstimate,
                        });
                    }
                }
                _ => excluded.push(Exclusion {
                    client_id: id,
                    reason: ExclusionReason::Unsynchronized,
                }),
            }
        }

        if qualified.is_empty() {
            return Ok(ScheduleOutcome {
                command_id: envelope.command_id,
                deadline_ms: None,
                instructions: Vec::new(),
                cancellations: Vec::new(),
                excluded,
                resolved,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let max_rtt_ms = qualified
            .iter()
            .map(|(_, estimate)| estimate.rtt_ms)
            .fold(0.0_f64, f64::max)
            .ceil() as i64;
        let computed_deadline = now_ms + max_rtt_ms + self.config.safety_margin_ms;

        // An explicit hint may push the deadline later but never earlier:
        // under-delivering to slow clients silently is worse than rejecting.
        let deadline_ms = match envelope.deadline_hint_ms {
            Some(hint) if hint < computed_deadline => {
                return Err(Error::DeadlineUnreachable {
                    required_ms: computed_deadline,
                    hint_ms: hint,
                });
            }
            Some(hint) => hint,
            None => computed_deadline,
        };

        let instructions: Vec<ScheduledInstruction> = qualified
            .iter()
            .map(|(id, estimate)| ScheduledInstruction {
                command_id: envelope.command_id,
                client_id: id.clone(),
                payload: envelope.payload.clone(),
                execute_at_ms: estimate.to_client_time(deadline_ms),
            })
            .collect();

        let cancellations = self.supersede(kind, &qualified, envelope.command_id, deadline_ms, now_ms);

        Ok(ScheduleOutcome {
            command_id: envelope.command_id,
            deadline_ms: Some(deadline_ms),
            instructions,
            cancellations,
            excluded,
            resolved,
        })
    }

    /// Record the new in-flight instructions and collect older same-kind
    /// instructions that are now superseded on intersecting clients. An
    /// earlier command whose deadline has already passed is left alone;
    /// racing a cancel against an executed cue would be pointless.
    fn supersede(
        &self,
        kind: CommandKind,
        targets: &[(ClientId, ClockEstimate)],
        command_id: u64,
        deadline_ms: i64,
        now_ms: i64,
    ) -> Vec<Cancellation> {
        let mut inflight = self.inflight.lock();
        let mut cancellations = Vec::new();

        inflight.retain(|_, entry| entry.deadline_ms > now_ms);

        for (id, _) in targets {
            let key = (kind, id.clone());
            if let Some(previous) = inflight.insert(
                key,
                Inflight {
                    command_id,
                    deadline_ms,
                },
            ) {
                if previous.command_id != command_id && previous.deadline_ms > now_ms {
                    cancellations.push(Cancellation {
                        client_id: id.clone(),
                        command_id: previous.command_id,
                    });
                }
            }
        }

        cancellations
    }
}
