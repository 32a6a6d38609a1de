//! WebSocket session toward the relay.
//!
//! Handles the handshake, answers heartbeats and clock probes, feeds
//! instructions into the runtime, and reconnects with exponential backoff.
//! Resume credentials from the last acknowledged handshake are presented on
//! reconnect so the registry entry (and its tags) survives the outage.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use stagesync_proto::{
    Capability, ClientMessage, ResumeCredentials, ServerMessage, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runtime::SubscriberRuntime;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;
const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Relay WebSocket endpoint, e.g. `ws://relay.local:8080/ws`.
    pub url: String,
    pub tags: Vec<String>,
    pub capabilities: Vec<Capability>,
}

pub struct RelayConnector {
    config: ConnectorConfig,
    runtime: Arc<SubscriberRuntime>,
    credentials: Mutex<Option<ResumeCredentials>>,
}

enum SessionExit {
    /// Session was up and then dropped. Backoff resets.
    Disconnected,
    /// Never completed the handshake. Backoff keeps growing.
    ConnectFailed(anyhow::Error),
}

impl RelayConnector {
    #[must_use]
    pub fn new(config: ConnectorConfig, runtime: Arc<SubscriberRuntime>) -> Self {
        Self {
            config,
            runtime,
            credentials: Mutex::new(None),
        }
    }

    /// Connect-and-serve forever, reconnecting with exponential backoff
    /// until cancelled.
    pub async fn run(&self, cancel_token: CancellationToken) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            if cancel_token.is_cancelled() {
                info!("Relay connector cancelled");
                return;
            }

            match self.run_session(&cancel_token).await {
                SessionExit::Disconnected => {
                    error!(
                        "Relay session ended, reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SessionExit::ConnectFailed(err) => {
                    error!(
                        error = %err,
                        backoff_secs = backoff_secs,
                        "Failed to establish relay session, retrying after backoff"
                    );
                }
            }
            self.runtime.close_gate();

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Relay connector cancelled during backoff");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn run_session(&self, cancel_token: &CancellationToken) -> SessionExit {
        let mut connection = match connect_async(self.config.url.as_str()).await {
            Ok((connection, _response)) => connection,
            Err(err) => {
                return SessionExit::ConnectFailed(
                    anyhow!(err).context("WebSocket connect failed"),
                );
            }
        };

        if let Err(err) = self.handshake(&mut connection).await {
            let _ = connection.close(None).await;
            return SessionExit::ConnectFailed(err);
        }

        self.serve(&mut connection, cancel_token).await;
        SessionExit::Disconnected
    }

    async fn handshake(&self, connection: &mut WsConnection) -> Result<()> {
        let resume = self.credentials.lock().clone();
        let resuming = resume.is_some();
        let hello = ClientMessage::Handshake {
            version: PROTOCOL_VERSION,
            tags: self.config.tags.clone(),
            capabilities: self.config.capabilities.clone(),
            resume,
        };
        send(connection, &hello.encode()?).await?;

        let reply = timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            next_server_message(connection),
        )
        .await
        .context("Timed out waiting for handshake reply")?
        .context("Connection closed during handshake")?;

        match reply {
            ServerMessage::HandshakeAck {
                client_id,
                resume_token,
                heartbeat_interval_ms,
            } => {
                info!(
                    client_id = %client_id,
                    resumed = resuming,
                    heartbeat_interval_ms = heartbeat_interval_ms,
                    "Handshake acknowledged"
                );
                *self.credentials.lock() = Some(ResumeCredentials {
                    client_id,
                    token: resume_token,
                });
                Ok(())
            }
            ServerMessage::HandshakeReject { reason } => {
                if resuming {
                    // Stale token or an evicted entry. Drop the credentials
                    // so the next attempt registers fresh.
                    warn!(reason = %reason, "Resume rejected, discarding credentials");
                    *self.credentials.lock() = None;
                } else {
                    warn!(reason = %reason, "Handshake rejected");
                }
                Err(anyhow!("handshake rejected: {reason}"))
            }
            other => Err(anyhow!("unexpected handshake reply: {other:?}")),
        }
    }

    async fn serve(&self, connection: &mut WsConnection, cancel_token: &CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = cancel_token.cancelled() => {
                    let close = ClientMessage::Close {
                        reason: stagesync_proto::CloseReason::ClientRequest,
                    };
                    if let Ok(text) = close.encode() {
                        let _ = send(connection, &text).await;
                    }
                    let _ = connection.close(None).await;
                    return;
                }
                message = next_server_message(connection) => message,
            };
            let Some(message) = message else { return };

            match message {
                ServerMessage::HeartbeatPing { seq } => {
                    let pong = ClientMessage::HeartbeatPong { seq };
                    if self.reply(connection, &pong).await.is_err() {
                        return;
                    }
                }
                ServerMessage::ClockProbe { probe_id, .. } => {
                    let reply = ClientMessage::ClockProbeReply {
                        probe_id,
                        echoed_at_ms: self.runtime.clock().now_ms(),
                    };
                    if self.reply(connection, &reply).await.is_err() {
                        return;
                    }
                    // First probe of the session: sync is measuring again,
                    // instructions may flow.
                    if !self.runtime.is_accepting() {
                        self.runtime.open_gate();
                    }
                }
                ServerMessage::Instruction(instruction) => {
                    self.runtime.submit(instruction);
                }
                ServerMessage::InstructionCancel { command_id } => {
                    self.runtime.cancel(command_id);
                }
                ServerMessage::HandshakeAck { .. } | ServerMessage::HandshakeReject { .. } => {
                    warn!("Unexpected handshake message mid-session, ignored");
                }
            }
        }
    }

    async fn reply(&self, connection: &mut WsConnection, message: &ClientMessage) -> Result<()> {
        let text = message.encode()?;
        send(connection, &text).await
    }

    /// Stored credentials from the last acknowledged handshake, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<ResumeCredentials> {
        self.credentials.lock().clone()
    }
}

async fn send(connection: &mut WsConnection, text: &str) -> Result<()> {
    connection
        .send(Message::Text(text.to_string().into()))
        .await
        .context("WebSocket send failed")
}

/// Next decodable relay message. Malformed frames are logged and skipped; a
/// closed or errored transport yields `None`.
async fn next_server_message(connection: &mut WsConnection) -> Option<ServerMessage> {
    loop {
        match connection.next().await {
            Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                Ok(message) => return Some(message),
                Err(err) => warn!(error = %err, "Malformed relay frame, dropped"),
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(err)) => {
                debug!(error = %err, "WebSocket receive error");
                return None;
            }
            Some(Ok(_)) => {}
        }
    }
}
