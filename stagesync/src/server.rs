//! Server lifecycle: wires the relay state, the broker tasks, and the
//! registry sweeper behind one axum listener, and tears everything down on
//! ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use stagesync_core::Config;
use stagesync_relay::broker::CommandBroker;
use stagesync_relay::connection::websocket_handler;
use stagesync_relay::{sweeper, RelayState};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct StageSyncServer {
    config: Config,
}

impl StageSyncServer {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start every component and serve until a shutdown signal arrives.
    pub async fn start(self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let state = Arc::new(RelayState::new(self.config));
        let cancel_token = CancellationToken::new();

        sweeper::spawn(Arc::clone(&state), cancel_token.clone());

        let broker = Arc::new(CommandBroker::new(
            &state.config.broker.redis_url,
            Arc::clone(&state.dispatcher),
            state.config.broker.command_channel.clone(),
            state.config.broker.report_channel.clone(),
            state.config.broker.dedup_window_secs,
        )?);
        Arc::clone(&broker).start();

        let app = Router::new()
            .route("/ws", get(websocket_handler))
            .route("/healthz", get(healthz))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind {bind_addr}"))?;
        info!(addr = %bind_addr, "Listening for client connections");

        let shutdown_token = cancel_token.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("Shutdown signal received");
                shutdown_token.cancel();
            })
            .await
            .context("Server error")?;

        broker.shutdown();
        info!("StageSync relay stopped");
        Ok(())
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
