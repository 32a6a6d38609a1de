//! Command types published by the orchestrator onto the upstream broker.
//!
//! A [`CommandEnvelope`] is the unit of intent: one operator decision that
//! fans out to zero or more per-client scheduled instructions. Envelopes are
//! immutable once created and consumed exactly once by the scheduler.

use serde::{Deserialize, Serialize};

use crate::id::ClientId;

/// Wire protocol version carried in every envelope. Receivers reject
/// envelopes with a version they do not understand.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length, in characters, accepted for broadcast text payloads.
pub const MAX_TEXT_LEN: usize = 64;

/// Actions a client can declare support for at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Color,
    Sound,
    Text,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Color => "color",
            Self::Sound => "sound",
            Self::Text => "text",
        };
        write!(f, "{value}")
    }
}

/// Command kind discriminator, derived from the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SendColor,
    SendAudioCue,
    BroadcastText,
}

impl CommandKind {
    /// Capability a client must declare to receive this kind of command.
    #[must_use]
    pub const fn required_capability(self) -> Capability {
        match self {
            Self::SendColor => Capability::Color,
            Self::SendAudioCue => Capability::Sound,
            Self::BroadcastText => Capability::Text,
        }
    }

    /// Time-critical kinds are never dropped by backpressure; cosmetic
    /// kinds (text) are dropped first when a client's buffer overflows.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        !matches!(self, Self::BroadcastText)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::SendColor => "send_color",
            Self::SendAudioCue => "send_audio_cue",
            Self::BroadcastText => "broadcast_text",
        };
        write!(f, "{value}")
    }
}

/// Color value for lighting commands. Named palette entries cover the
/// common stage cues; `Rgb` carries arbitrary values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorValue {
    Red,
    Blue,
    White,
    Black,
    Rgb(u8, u8, u8),
}

/// Kind-specific command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    SendColor {
        color: ColorValue,
        /// Optional zone label, forwarded to the client's renderer.
        zone: Option<String>,
    },
    SendAudioCue {
        cue_id: String,
        gain_db: f32,
    },
    BroadcastText {
        text: String,
    },
}

impl CommandPayload {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::SendColor { .. } => CommandKind::SendColor,
            Self::SendAudioCue { .. } => CommandKind::SendAudioCue,
            Self::BroadcastText { .. } => CommandKind::BroadcastText,
        }
    }

    /// Structural validation applied at the broker boundary.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::BroadcastText { text } => {
                let chars = text.chars().count();
                if chars > MAX_TEXT_LEN {
                    return Err(format!(
                        "text payload exceeds {MAX_TEXT_LEN} characters ({chars})"
                    ));
                }
                Ok(())
            }
            Self::SendAudioCue { cue_id, .. } => {
                if cue_id.is_empty() {
                    return Err("audio cue id must not be empty".to_string());
                }
                Ok(())
            }
            Self::SendColor { .. } => Ok(()),
        }
    }
}

/// Which clients a command addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Every client in state Active or Degraded.
    All,
    /// Clients carrying the given group tag.
    ByTag { tag: String },
    /// An explicit set of client IDs.
    ByIdSet { ids: Vec<ClientId> },
}

/// A single control decision from the orchestrator.
///
/// `command_id` is monotonic per orchestrator session and used for
/// idempotence (the relay deduplicates redeliveries) and logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub version: u32,
    pub command_id: u64,
    pub payload: CommandPayload,
    pub target: TargetSelector,
    /// Optional absolute deadline in relay reference time (millis). When
    /// set and earlier than the relay-computed deadline, the command is
    /// rejected rather than silently under-delivered to slow clients.
    pub deadline_hint_ms: Option<i64>,
}

impl CommandEnvelope {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.payload.kind()
    }
}
