//! Per-connection WebSocket actor.
//!
//! One task per client: handshake first, then a select loop multiplexing
//! inbound frames, the client's outbound queue, and the heartbeat and clock
//! probe timers. Liveness accounting (`touch`) happens here; scheduling
//! never does.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use stagesync_core::models::{ClientIdentity, ConnectionState};
use stagesync_proto::{ClientId, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::hub::{Outbound, OutboundQueue};
use crate::RelayState;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Lifecycle of one client connection. Handshake failure goes straight to
/// `Closed` without entering `Active`; `Active` and `Degraded` toggle with
/// heartbeat liveness; only `Closing -> Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Handshaking,
    Active,
    Degraded,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

pub async fn websocket_handler(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Control-plane frames are small; 64KB is generous.
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sink, mut stream) = socket.split();
    let mut phase = SessionPhase::Connecting;
    debug!(phase = %phase, "Socket upgraded");

    phase = SessionPhase::Handshaking;
    debug!(phase = %phase, "Awaiting handshake");
    let client_id = match handshake(&mut sink, &mut stream, &state).await {
        Some(id) => id,
        None => {
            debug!(phase = %SessionPhase::Closed, "Handshake failed");
            return;
        }
    };

    phase = SessionPhase::Active;
    let queue = state.hub.attach(client_id.clone());
    info!(client_id = %client_id, phase = %phase, "Client connected");

    run_session(&mut sink, &mut stream, &state, &client_id, &queue, &mut phase).await;

    phase = SessionPhase::Closing;
    debug!(client_id = %client_id, phase = %phase, "Tearing down session");
    state.hub.detach(&client_id);
    if let Err(err) = state
        .registry
        .mark_state(&client_id, ConnectionState::Disconnected)
    {
        debug!(client_id = %client_id, error = %err, "Disconnect state update skipped");
    }
    phase = SessionPhase::Closed;
    info!(client_id = %client_id, phase = %phase, "Client disconnected");
}

/// Run the handshake phase. Returns the registered client ID, or `None` if
/// the connection was rejected or dropped before completing.
async fn handshake(sink: &mut WsSink, stream: &mut WsStream, state: &RelayState) -> Option<ClientId> {
    let deadline = Duration::from_millis(state.config.sync.handshake_timeout_ms);
    let first = match timeout(deadline, next_message(stream)).await {
        Ok(Some(message)) => message,
        Ok(None) => return None,
        Err(_) => {
            warn!("Handshake timed out");
            reject(sink, &stagesync_core::Error::HandshakeTimeout.to_string()).await;
            return None;
        }
    };

    let ClientMessage::Handshake {
        version,
        tags,
        capabilities,
        resume,
    } = first
    else {
        reject(sink, "expected handshake as first message").await;
        return None;
    };

    if version != PROTOCOL_VERSION {
        reject(
            sink,
            &format!("unsupported protocol version {version} (expected {PROTOCOL_VERSION})"),
        )
        .await;
        return None;
    }

    let now_ms = state.clock.now_ms();
    let identity = if let Some(credentials) = resume {
        match state
            .registry
            .resume(&credentials.client_id, &credentials.token, now_ms)
        {
            Ok(identity) => {
                // A resumed client re-qualifies from scratch; its network
                // path may have changed across the reconnect.
                state.estimator.evict(&identity.id);
                info!(client_id = %identity.id, "Client resumed");
                identity
            }
            Err(err) => {
                warn!(client_id = %credentials.client_id, error = %err, "Resume refused");
                reject(sink, &err.to_string()).await;
                return None;
            }
        }
    } else {
        let identity = ClientIdentity::new(
            tags.into_iter().collect(),
            capabilities.into_iter().collect(),
            now_ms,
        );
        if let Err(err) = state.registry.register(identity.clone()) {
            warn!(client_id = %identity.id, error = %err, "Registration refused");
            reject(sink, &err.to_string()).await;
            return None;
        }
        identity
    };

    let ack = ServerMessage::HandshakeAck {
        client_id: identity.id.clone(),
        resume_token: identity.resume_token.clone(),
        heartbeat_interval_ms: state.config.sync.heartbeat_interval_ms,
    };
    if send(sink, &ack).await.is_err() {
        state
            .registry
            .mark_state(&identity.id, ConnectionState::Disconnected)
            .ok();
        return None;
    }
    Some(identity.id)
}

async fn run_session(
    sink: &mut WsSink,
    stream: &mut WsStream,
    state: &RelayState,
    client_id: &ClientId,
    queue: &OutboundQueue,
    phase: &mut SessionPhase,
) {
    let mut heartbeat = interval(Duration::from_millis(state.config.sync.heartbeat_interval_ms));
    let mut probe = interval(Duration::from_millis(state.config.sync.probe_interval_ms));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let probe_timeout_ms = state.config.sync.probe_timeout_ms as i64;
    let mut heartbeat_seq: u64 = 0;
    let mut probe_id: u64 = 0;
    // probe_id -> relay send time, purged when the reply window lapses.
    let mut pending_probes: HashMap<u64, i64> = HashMap::new();

    loop {
        tokio::select! {
            inbound = next_message(stream) => {
                let Some(message) = inbound else { return };
                match message {
                    ClientMessage::HeartbeatPong { seq } => {
                        debug!(client_id = %client_id, seq = seq, "Heartbeat pong");
                        state.registry.touch(client_id, state.clock.now_ms()).ok();
                    }
                    ClientMessage::ClockProbeReply { probe_id, echoed_at_ms } => {
                        let now_ms = state.clock.now_ms();
                        state.registry.touch(client_id, now_ms).ok();
                        match pending_probes.remove(&probe_id) {
                            Some(sent_at_ms) if now_ms - sent_at_ms <= probe_timeout_ms => {
                                match state.estimator.sample(client_id, sent_at_ms, echoed_at_ms, now_ms) {
                                    Ok(estimate) => debug!(
                                        client_id = %client_id,
                                        probe_id = probe_id,
                                        rtt_ms = estimate.rtt_ms,
                                        offset_ms = estimate.offset_ms,
                                        state = ?estimate.state,
                                        "Clock sample accepted"
                                    ),
                                    Err(err) => warn!(
                                        client_id = %client_id,
                                        probe_id = probe_id,
                                        error = %err,
                                        "Clock sample rejected"
                                    ),
                                }
                            }
                            Some(_) => debug!(
                                client_id = %client_id,
                                probe_id = probe_id,
                                "Probe reply past its window, discarded"
                            ),
                            None => debug!(
                                client_id = %client_id,
                                probe_id = probe_id,
                                "Unknown probe reply, discarded"
                            ),
                        }
                    }
                    ClientMessage::UpdateTags { tags } => {
                        state.registry.touch(client_id, state.clock.now_ms()).ok();
                        match state.registry.update_tags(client_id, tags.into_iter().collect()) {
                            Ok(()) => info!(client_id = %client_id, "Tags updated"),
                            Err(err) => warn!(client_id = %client_id, error = %err, "Tag update refused"),
                        }
                    }
                    ClientMessage::Close { reason } => {
                        info!(client_id = %client_id, reason = ?reason, "Client requested close");
                        return;
                    }
                    ClientMessage::Handshake { .. } => {
                        warn!(client_id = %client_id, "Duplicate handshake, closing");
                        return;
                    }
                }
            }
            outbound = queue.recv() => {
                let message = match outbound {
                    Outbound::Instruction(instruction) => ServerMessage::Instruction(instruction),
                    Outbound::Cancel { command_id } => ServerMessage::InstructionCancel { command_id },
                };
                if send(sink, &message).await.is_err() {
                    return;
                }
            }
            _ = heartbeat.tick() => {
                // Mirror the registry's liveness verdict into the session
                // phase; the sweeper owns the actual transitions.
                let registry_state = state.registry.get(client_id).map(|identity| identity.state);
                let next_phase = match registry_state {
                    Some(ConnectionState::Degraded) => SessionPhase::Degraded,
                    Some(_) => SessionPhase::Active,
                    None => {
                        info!(client_id = %client_id, "Registry entry evicted, closing connection");
                        return;
                    }
                };
                if next_phase != *phase {
                    info!(client_id = %client_id, from = %phase, to = %next_phase, "Session phase changed");
                    *phase = next_phase;
                }

                heartbeat_seq += 1;
                if send(sink, &ServerMessage::HeartbeatPing { seq: heartbeat_seq }).await.is_err() {
                    return;
                }
            }
            _ = probe.tick() => {
                let now_ms = state.clock.now_ms();
                pending_probes.retain(|_, sent_at_ms| now_ms - *sent_at_ms <= probe_timeout_ms);
                probe_id += 1;
                pending_probes.insert(probe_id, now_ms);
                let message = ServerMessage::ClockProbe { probe_id, sent_at_ms: now_ms };
                if send(sink, &message).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Await the next decodable client message. Malformed frames are logged and
/// skipped; a closed or errored transport yields `None`.
async fn next_message(stream: &mut WsStream) -> Option<ClientMessage> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match ClientMessage::decode(&text) {
                Ok(message) => return Some(message),
                Err(err) => {
                    warn!(error = %err, "Malformed client frame, dropped");
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(err)) => {
                debug!(error = %err, "WebSocket receive error");
                return None;
            }
            // Ping/pong/binary frames carry no protocol meaning here.
            Some(Ok(_)) => {}
        }
    }
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = message
        .encode()
        .map_err(|err| axum::Error::new(Box::new(err)))?;
    sink.send(Message::Text(text.into())).await
}

async fn reject(sink: &mut WsSink, reason: &str) {
    let message = ServerMessage::HandshakeReject {
        reason: reason.to_string(),
    };
    if let Ok(text) = message.encode() {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}
