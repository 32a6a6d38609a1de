//! Subscriber-side runtime: connects to a relay, keeps clock sync alive,
//! and executes scheduled instructions at their client-local timestamps.

pub mod connection;
pub mod queue;
pub mod runtime;

pub use connection::{ConnectorConfig, RelayConnector};
pub use runtime::{LocalBus, SubscriberRuntime};
