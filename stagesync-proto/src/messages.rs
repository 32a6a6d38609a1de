//! Message set for the persistent client transport channel.
//!
//! Everything crossing the relay/client WebSocket is one of these two
//! tagged enums, JSON-encoded. Timestamps are millisecond counts on the
//! sender's own clock domain: the relay stamps probes with relay reference
//! time, the client echoes with its local time, and the offset between the
//! two is exactly what the clock estimator measures.

use serde::{Deserialize, Serialize};

use crate::command::Capability;
use crate::id::ClientId;
use crate::instruction::ScheduledInstruction;

/// Credentials presented by a reconnecting client to resume its prior
/// registry entry (tags and capabilities intact, same client ID).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCredentials {
    pub client_id: ClientId,
    pub token: String,
}

/// Why a client is closing its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientRequest,
    RelayRequest,
    Unexpected,
}

/// Messages sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first message on a fresh connection. Declares the
    /// client's group tags and capability set; carries resume credentials
    /// when reconnecting within the grace period.
    Handshake {
        version: u32,
        tags: Vec<String>,
        capabilities: Vec<Capability>,
        resume: Option<ResumeCredentials>,
    },
    HeartbeatPong {
        seq: u64,
    },
    /// Echo of a clock probe, stamped with the client's local clock.
    ClockProbeReply {
        probe_id: u64,
        echoed_at_ms: i64,
    },
    /// Replace the client's group tags, e.g. when a device moves zones
    /// mid-show. Capabilities are fixed for the life of the registration.
    UpdateTags {
        tags: Vec<String>,
    },
    Close {
        reason: CloseReason,
    },
}

/// Messages sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HandshakeAck {
        client_id: ClientId,
        /// Presented on reconnect to atomically replace the prior entry.
        resume_token: String,
        heartbeat_interval_ms: u64,
    },
    HandshakeReject {
        reason: String,
    },
    HeartbeatPing {
        seq: u64,
    },
    /// Round-trip probe, stamped with relay reference time.
    ClockProbe {
        probe_id: u64,
        sent_at_ms: i64,
    },
    Instruction(ScheduledInstruction),
    /// The named command was superseded; purge its buffered instruction.
    InstructionCancel {
        command_id: u64,
    },
}

impl ClientMessage {
    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PROTOCOL_VERSION;

    #[test]
    fn test_handshake_roundtrip() {
        let msg = ClientMessage::Handshake {
            version: PROTOCOL_VERSION,
            tags: vec!["lighting".to_string(), "zone-center".to_string()],
            capabilities: vec![Capability::Color, Capability::Text],
            resume: None,
        };

        let json = msg.encode().unwrap();
        assert!(json.contains("\"type\":\"handshake\""));

        let back = ClientMessage::decode(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_probe_reply_roundtrip() {
        let msg = ClientMessage::ClockProbeReply {
            probe_id: 9,
            echoed_at_ms: 123_456,
        };
        let back = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(ClientMessage::decode("{\"type\":\"nonsense\"}").is_err());
        assert!(ServerMessage::decode("not json at all").is_err());
    }
}
