//! Handshake behavior over a real WebSocket: the first frame decides
//! whether a session opens at all, and a live session accepts tag updates.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use stagesync_core::Config;
use stagesync_proto::{Capability, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use stagesync_relay::connection::websocket_handler;
use stagesync_relay::RelayState;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_relay(config: Config) -> (Arc<RelayState>, SocketAddr) {
    let state = Arc::new(RelayState::new(config));
    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn send(socket: &mut WsClient, message: &ClientMessage) {
    socket
        .send(Message::Text(message.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Next decodable server frame, or `None` once the relay hangs up.
async fn next_server_message(socket: &mut WsClient) -> Option<ServerMessage> {
    loop {
        match socket.next().await? {
            Ok(Message::Text(text)) => return ServerMessage::decode(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn handshake_message(version: u32) -> ClientMessage {
    ClientMessage::Handshake {
        version,
        tags: vec!["zone-center".to_string()],
        capabilities: vec![Capability::Color],
        resume: None,
    }
}

#[tokio::test]
async fn test_non_handshake_first_frame_rejected() {
    let (_state, addr) = spawn_relay(Config::default()).await;
    let mut socket = connect(addr).await;

    send(&mut socket, &ClientMessage::HeartbeatPong { seq: 0 }).await;

    match next_server_message(&mut socket).await {
        Some(ServerMessage::HandshakeReject { reason }) => {
            assert!(reason.contains("handshake"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(next_server_message(&mut socket).await.is_none());
}

#[tokio::test]
async fn test_stale_protocol_version_rejected() {
    let (state, addr) = spawn_relay(Config::default()).await;
    let mut socket = connect(addr).await;

    send(&mut socket, &handshake_message(PROTOCOL_VERSION + 1)).await;

    match next_server_message(&mut socket).await {
        Some(ServerMessage::HandshakeReject { reason }) => {
            assert!(reason.contains("version"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(next_server_message(&mut socket).await.is_none());
    assert_eq!(state.registry.client_count(), 0);
}

#[tokio::test]
async fn test_silent_client_times_out_of_handshake() {
    let mut config = Config::default();
    config.sync.handshake_timeout_ms = 100;
    let (state, addr) = spawn_relay(config).await;
    let mut socket = connect(addr).await;

    // Send nothing; the relay must give up on its own.
    let reply = tokio::time::timeout(Duration::from_secs(2), next_server_message(&mut socket))
        .await
        .expect("relay never rejected the idle connection");
    assert!(matches!(reply, Some(ServerMessage::HandshakeReject { .. })));
    assert!(next_server_message(&mut socket).await.is_none());
    assert_eq!(state.registry.client_count(), 0);
}

#[tokio::test]
async fn test_session_applies_tag_updates() {
    let (state, addr) = spawn_relay(Config::default()).await;
    let mut socket = connect(addr).await;

    send(&mut socket, &handshake_message(PROTOCOL_VERSION)).await;
    let client_id = match next_server_message(&mut socket).await {
        Some(ServerMessage::HandshakeAck { client_id, .. }) => client_id,
        other => panic!("expected ack, got {other:?}"),
    };
    assert!(state
        .registry
        .get(&client_id)
        .unwrap()
        .tags
        .contains("zone-center"));

    send(
        &mut socket,
        &ClientMessage::UpdateTags {
            tags: vec!["zone-left".to_string()],
        },
    )
    .await;

    // The update is applied by the connection task; poll briefly.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let tags = state.registry.get(&client_id).unwrap().tags;
        if tags.contains("zone-left") {
            assert!(!tags.contains("zone-center"));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "tag update never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
