//! Redis Pub/Sub boundary toward the orchestrator.
//!
//! One subscriber task consumes command envelopes from the command channel
//! and hands them to the dispatcher; one publisher task pushes delivery
//! reports back on the report channel. Both reconnect with exponential
//! backoff. Commands are fire-at-a-moment cues, so there is deliberately no
//! stream catch-up after an outage: a command the relay never saw in time
//! is already worthless, and the orchestrator reads the gap from the
//! missing reports.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use futures::StreamExt;
use redis::{AsyncCommands, Client as RedisClient};
use stagesync_proto::{CommandEnvelope, DeliveryReport};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::CommandDeduplicator;
use crate::dispatch::CommandDispatcher;

const REDIS_TIMEOUT_SECS: u64 = 5;
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Reports buffered toward Redis. Overflow drops the oldest pressure by
/// rejecting new sends with a warning; the commands themselves were
/// already delivered.
const REPORT_CHANNEL_CAPACITY: usize = 1024;

pub struct CommandBroker {
    redis_client: RedisClient,
    dispatcher: Arc<CommandDispatcher>,
    deduplicator: CommandDeduplicator,
    command_channel: String,
    report_channel: String,
    cancel_token: CancellationToken,
}

impl CommandBroker {
    pub fn new(
        redis_url: &str,
        dispatcher: Arc<CommandDispatcher>,
        command_channel: String,
        report_channel: String,
        dedup_window_secs: u64,
    ) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

        Ok(Self {
            redis_client,
            dispatcher,
            deduplicator: CommandDeduplicator::new(
                StdDuration::from_secs(dedup_window_secs),
                StdDuration::from_secs(30),
            ),
            command_channel,
            report_channel,
            cancel_token: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down command broker");
        self.cancel_token.cancel();
    }

    /// Spawn the subscriber and publisher tasks.
    pub fn start(self: Arc<Self>) {
        let (report_tx, report_rx) = mpsc::channel::<DeliveryReport>(REPORT_CHANNEL_CAPACITY);

        let publisher = Arc::clone(&self);
        tokio::spawn(async move {
            publisher.run_publisher(report_rx).await;
        });

        let subscriber = self;
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;
            loop {
                if subscriber.cancel_token.is_cancelled() {
                    info!("Command subscriber cancelled");
                    return;
                }

                match subscriber.run_subscriber(&report_tx).await {
                    SubscriberExit::Disconnected => {
                        // The connection was healthy before it dropped.
                        error!(
                            "Command subscriber stream ended, reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(err) => {
                        error!(
                            error = %err,
                            backoff_secs = backoff_secs,
                            "Command subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    _ = subscriber.cancel_token.cancelled() => {
                        info!("Command subscriber cancelled during backoff");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });
    }

    async fn run_subscriber(&self, report_tx: &mpsc::Sender<DeliveryReport>) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(err)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(err).context("Failed to get Redis Pub/Sub connection"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out getting Redis Pub/Sub connection"
                ));
            }
        };

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(&self.command_channel),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(err).context(format!(
                    "Failed to subscribe to command channel {}",
                    self.command_channel
                )));
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out subscribing to command channel {}",
                    self.command_channel
                ));
            }
        }

        info!(channel = %self.command_channel, "Command subscriber connected");

        let mut stream = pubsub.on_message();
        loop {
            let message = tokio::select! {
                _ = self.cancel_token.cancelled() => return SubscriberExit::Disconnected,
                message = stream.next() => message,
            };
            let Some(message) = message else {
                return SubscriberExit::Disconnected;
            };

            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "Invalid command payload, dropped");
                    continue;
                }
            };

            let envelope = match serde_json::from_str::<CommandEnvelope>(&payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(error = %err, payload = %payload, "Malformed command envelope, dropped");
                    continue;
                }
            };

            if !self.deduplicator.should_process(envelope.command_id) {
                debug!(
                    command_id = envelope.command_id,
                    "Duplicate command within dedup window, skipped"
                );
                continue;
            }

            let report = self.dispatcher.dispatch(&envelope);
            if let Err(err) = report_tx.try_send(report) {
                warn!(
                    command_id = envelope.command_id,
                    error = %err,
                    "Report channel full or closed, delivery report dropped"
                );
            }
        }
    }

    /// Publish delivery reports with reconnection. A report that fails
    /// mid-publish is retried once after the next reconnect.
    async fn run_publisher(&self, mut report_rx: mpsc::Receiver<DeliveryReport>) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut retry_report: Option<DeliveryReport> = None;

        loop {
            let mut conn = match timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                self.redis_client.get_multiplexed_async_connection(),
            )
            .await
            {
                Ok(Ok(conn)) => {
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    conn
                }
                Ok(Err(err)) => {
                    error!(
                        error = %err,
                        backoff_secs = backoff_secs,
                        "Failed to get Redis connection for reports, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
                Err(_) => {
                    error!(
                        backoff_secs = backoff_secs,
                        "Timed out getting Redis connection for reports, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };

            info!("Report publisher (re)connected");

            if let Some(report) = retry_report.take() {
                if let Err(err) = self.publish_report(&mut conn, &report).await {
                    warn!(
                        command_id = report.command_id,
                        error = %err,
                        "Retry publish failed, will retry after next reconnect"
                    );
                    retry_report = Some(report);
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            }

            loop {
                let report = tokio::select! {
                    _ = self.cancel_token.cancelled() => {
                        info!("Report publisher cancelled");
                        return;
                    }
                    report = report_rx.recv() => report,
                };
                let Some(report) = report else {
                    warn!("Report channel closed, publisher exiting");
                    return;
                };

                if let Err(err) = self.publish_report(&mut conn, &report).await {
                    error!(
                        command_id = report.command_id,
                        error = %err,
                        "Failed to publish report, saving for retry after reconnect"
                    );
                    retry_report = Some(report);
                    break;
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn publish_report(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        report: &DeliveryReport,
    ) -> Result<()> {
        let payload =
            serde_json::to_string(report).context("Failed to serialize delivery report")?;

        let subscribers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(&self.report_channel, &payload),
        )
        .await
        .context("Timed out publishing report")?
        .context("Failed to publish report")?;

        debug!(
            command_id = report.command_id,
            subscribers = subscribers,
            "Delivery report published"
        );
        Ok(())
    }
}

/// How the subscriber loop exited, deciding backoff behavior.
enum SubscriberExit {
    /// Connection was up and then dropped. Backoff resets.
    Disconnected,
    /// Never got connected or subscribed. Backoff keeps growing.
    ConnectFailed(anyhow::Error),
}
