//! Relay node: accepts client WebSocket connections, measures per-client
//! clock offsets, and fans orchestrator commands out as clock-translated
//! instructions.

pub mod broker;
pub mod connection;
pub mod dedup;
pub mod dispatch;
pub mod hub;
pub mod sweeper;

use std::sync::Arc;

use stagesync_core::service::clock::ClockSyncEstimator;
use stagesync_core::service::registry::ClientRegistry;
use stagesync_core::service::scheduler::CommandScheduler;
use stagesync_core::{Config, ReferenceClock};

use crate::dispatch::CommandDispatcher;
use crate::hub::ClientHub;

/// Shared state behind every connection task and the broker boundary.
pub struct RelayState {
    pub config: Config,
    pub clock: Arc<ReferenceClock>,
    pub registry: Arc<ClientRegistry>,
    pub estimator: Arc<ClockSyncEstimator>,
    pub scheduler: Arc<CommandScheduler>,
    pub hub: Arc<ClientHub>,
    pub dispatcher: Arc<CommandDispatcher>,
}

impl RelayState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let clock = Arc::new(ReferenceClock::new());
        let registry = Arc::new(ClientRegistry::new(config.sync.registry()));
        let estimator = Arc::new(ClockSyncEstimator::new(config.sync.clock_sync()));
        let scheduler = Arc::new(CommandScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&estimator),
            config.sync.scheduler(),
        ));
        let hub = Arc::new(ClientHub::new(config.sync.outbound_queue_capacity));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            Arc::clone(&estimator),
            Arc::clone(&hub),
            Arc::clone(&clock),
        ));

        Self {
            config,
            clock,
            registry,
            estimator,
            scheduler,
            hub,
            dispatcher,
        }
    }
}
