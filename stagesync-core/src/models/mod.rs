pub mod clock;
pub mod identity;

pub use clock::{ClockEstimate, SyncState};
pub use identity::{ClientIdentity, ConnectionState};

// Wire-level IDs live in the proto crate; re-exported here so domain code
// has a single import path.
pub use stagesync_proto::ClientId;
