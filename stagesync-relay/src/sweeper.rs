//! Periodic liveness sweep.
//!
//! Walks every registry entry down the silence ladder (Active to Degraded
//! to Disconnected to evicted) and releases the co-owned state of anything
//! evicted: its clock estimate and its outbound queue.

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::RelayState;

pub fn spawn(state: Arc<RelayState>, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(state.config.sync.sweep_interval_ms));
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Registry sweeper cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now_ms = state.clock.now_ms();
            let evicted = state.registry.sweep(now_ms);
            for client_id in evicted {
                state.estimator.evict(&client_id);
                state.hub.detach(&client_id);
                debug!(client_id = %client_id, "Evicted silent client");
            }
        }
    });
}
