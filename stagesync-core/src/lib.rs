//! Domain logic for the StageSync relay and client runtime: the client
//! registry, per-client clock estimation, and command scheduling, plus the
//! shared configuration, error, and logging plumbing.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod service;
pub mod time;

pub use config::Config;
pub use error::{Error, Result};
pub use time::ReferenceClock;
