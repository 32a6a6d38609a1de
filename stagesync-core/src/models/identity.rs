//! Client identity as held by the registry.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use stagesync_proto::{Capability, ClientId, CommandKind};

/// Connection lifecycle state. Only the registry mutates this; connection
/// tasks request transitions through `mark_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Active,
    Degraded,
    Disconnected,
}

impl ConnectionState {
    /// States eligible for command targeting.
    #[must_use]
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{value}")
    }
}

/// A connected (or recently connected) client and its declared shape.
///
/// Owned exclusively by the registry; the scheduler and relay reference
/// entries by ID and receive clones, never shared mutable access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: ClientId,
    pub tags: HashSet<String>,
    pub capabilities: HashSet<Capability>,
    pub state: ConnectionState,
    /// Last heartbeat or probe answer, relay reference millis.
    pub last_seen_ms: i64,
    /// Presented by a reconnecting client to reclaim this entry.
    pub resume_token: String,
}

impl ClientIdentity {
    /// Build a fresh identity from a handshake declaration.
    #[must_use]
    pub fn new(tags: Vec<String>, capabilities: Vec<Capability>, now_ms: i64) -> Self {
        Self {
            id: ClientId::new(),
            tags: tags.into_iter().collect(),
            capabilities: capabilities.into_iter().collect(),
            state: ConnectionState::Active,
            last_seen_ms: now_ms,
            resume_token: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    #[must_use]
    pub fn supports(&self, kind: CommandKind) -> bool {
        self.capabilities.contains(&kind.required_capability())
    }
}
