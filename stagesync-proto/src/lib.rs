//! Wire and data types shared by the relay and the subscriber runtime.
//!
//! Pure data: no I/O, no clocks. Encoding is JSON with explicit kind
//! discriminators so payloads can be validated and rejected at the boundary
//! they arrive on.

pub mod command;
pub mod id;
pub mod instruction;
pub mod messages;
pub mod report;

pub use command::{
    Capability, ColorValue, CommandEnvelope, CommandKind, CommandPayload, TargetSelector,
    MAX_TEXT_LEN, PROTOCOL_VERSION,
};
pub use id::ClientId;
pub use instruction::ScheduledInstruction;
pub use messages::{ClientMessage, CloseReason, ResumeCredentials, ServerMessage};
pub use report::{CommandOutcome, DeliveryReport, Exclusion, ExclusionReason};
