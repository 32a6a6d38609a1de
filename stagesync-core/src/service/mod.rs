pub mod clock;
pub mod registry;
pub mod scheduler;

pub use clock::{ClockSyncConfig, ClockSyncEstimator};
pub use registry::{ClientRegistry, RegistryConfig, RegistryEvent};
pub use scheduler::{Cancellation, CommandScheduler, ScheduleOutcome, SchedulerConfig};
