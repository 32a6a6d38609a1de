//! Bridges scheduler decisions onto live connections.
//!
//! `dispatch` is the relay's single command path: schedule, send the
//! cancels for anything superseded, then queue the instructions, and fold
//! whatever happened into one `DeliveryReport`.

use std::sync::Arc;

use stagesync_core::service::clock::ClockSyncEstimator;
use stagesync_core::service::registry::ClientRegistry;
use stagesync_core::service::scheduler::CommandScheduler;
use stagesync_core::ReferenceClock;
use stagesync_proto::{
    ClientId, CommandEnvelope, CommandOutcome, DeliveryReport, Exclusion, ExclusionReason,
    PROTOCOL_VERSION,
};
use stagesync_core::models::ConnectionState;
use tracing::{info, warn};

use crate::hub::{ClientHub, PushOutcome};

pub struct CommandDispatcher {
    scheduler: Arc<CommandScheduler>,
    registry: Arc<ClientRegistry>,
    estimator: Arc<ClockSyncEstimator>,
    hub: Arc<ClientHub>,
    clock: Arc<ReferenceClock>,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(
        scheduler: Arc<CommandScheduler>,
        registry: Arc<ClientRegistry>,
        estimator: Arc<ClockSyncEstimator>,
        hub: Arc<ClientHub>,
        clock: Arc<ReferenceClock>,
    ) -> Self {
        Self {
            scheduler,
            registry,
            estimator,
            hub,
            clock,
        }
    }

    /// Fan a command out to its resolved clients and report the result.
    ///
    /// Rejections (version mismatch, invalid payload, unreachable deadline)
    /// happen before any client state changes. Per-client queue failures
    /// after that point become `TransportLost` exclusions, never errors.
    pub fn dispatch(&self, envelope: &CommandEnvelope) -> DeliveryReport {
        if envelope.version != PROTOCOL_VERSION {
            return self.rejected(
                envelope.command_id,
                format!(
                    "unsupported protocol version {} (expected {})",
                    envelope.version, PROTOCOL_VERSION
                ),
            );
        }
        if let Err(err) = envelope.payload.validate() {
            return self.rejected(envelope.command_id, err.to_string());
        }

        let now_ms = self.clock.now_ms();
        let outcome = match self.scheduler.schedule(envelope, now_ms) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(command_id = envelope.command_id, error = %err, "Command rejected");
                return self.rejected(envelope.command_id, err.to_string());
            }
        };

        // Cancels go first so a client never executes a superseded cue that
        // raced ahead of its replacement in the queue.
        for cancellation in &outcome.cancellations {
            self.hub
                .cancel(&cancellation.client_id, cancellation.command_id);
        }

        let mut excluded = outcome.excluded;
        let mut scheduled = 0_usize;
        for instruction in outcome.instructions {
            let client_id = instruction.client_id.clone();
            match self.hub.send_instruction(instruction) {
                Some(PushOutcome::Queued) => scheduled += 1,
                Some(PushOutcome::DroppedOldest { dropped_command_id }) => {
                    scheduled += 1;
                    info!(
                        client_id = %client_id,
                        dropped_command_id = dropped_command_id,
                        "Outbound queue full, dropped oldest non-critical instruction"
                    );
                }
                Some(PushOutcome::Overflow) => {
                    self.demote(&client_id);
                    excluded.push(Exclusion {
                        client_id,
                        reason: ExclusionReason::TransportLost,
                    });
                }
                None => {
                    // Registry entry outlived its connection; the sweeper
                    // will walk it down the ladder, report the gap now.
                    excluded.push(Exclusion {
                        client_id,
                        reason: ExclusionReason::TransportLost,
                    });
                }
            }
        }

        info!(
            command_id = envelope.command_id,
            resolved = outcome.resolved,
            scheduled = scheduled,
            excluded = excluded.len(),
            deadline_ms = outcome.deadline_ms,
            "Command dispatched"
        );

        DeliveryReport {
            command_id: envelope.command_id,
            outcome: CommandOutcome::Delivered,
            resolved: outcome.resolved,
            scheduled,
            excluded,
            deadline_ms: outcome.deadline_ms,
        }
    }

    /// Overflowing a full queue of critical traffic means the connection is
    /// not draining. Demote it and drop the stale estimate so the client
    /// re-qualifies once it recovers.
    fn demote(&self, client_id: &ClientId) {
        warn!(client_id = %client_id, "Outbound queue overflow, marking connection degraded");
        if let Err(err) = self
            .registry
            .mark_state(client_id, ConnectionState::Degraded)
        {
            warn!(client_id = %client_id, error = %err, "Failed to demote client");
        }
        self.estimator.evict(client_id);
    }

    fn rejected(&self, command_id: u64, reason: String) -> DeliveryReport {
        DeliveryReport {
            command_id,
            outcome: CommandOutcome::Rejected { reason },
            resolved: 0,
            scheduled: 0,
            excluded: Vec::new(),
            deadline_ms: None,
        }
    }
}
