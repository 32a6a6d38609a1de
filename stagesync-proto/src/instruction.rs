//! Per-client scheduled instructions derived from a command envelope.

use serde::{Deserialize, Serialize};

use crate::command::{CommandKind, CommandPayload};
use crate::id::ClientId;

/// A command translated into one client's clock domain.
///
/// `execute_at_ms` is an absolute timestamp on the *client's* local clock
/// (relay reference deadline + the client's estimated offset). The client
/// buffers the instruction and fires it when its own clock reaches that
/// instant, which is what lets physically separate devices act together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledInstruction {
    pub command_id: u64,
    pub client_id: ClientId,
    pub payload: CommandPayload,
    /// Absolute execution time in the client's clock domain (millis).
    pub execute_at_ms: i64,
}

impl ScheduledInstruction {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    #[must_use]
    pub const fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ColorValue;

    #[test]
    fn test_instruction_roundtrip() {
        let instruction = ScheduledInstruction {
            command_id: 7,
            client_id: ClientId::from_string("client-000001".to_string()),
            payload: CommandPayload::SendColor {
                color: ColorValue::Rgb(255, 128, 0),
                zone: None,
            },
            execute_at_ms: 1_234_567,
        };

        let json = serde_json::to_string(&instruction).unwrap();
        let back: ScheduledInstruction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instruction);
        assert!(back.is_critical());
    }
}
