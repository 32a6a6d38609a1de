use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::service::clock::ClockSyncConfig;
use crate::service::registry::RegistryConfig;
use crate::service::scheduler::SchedulerConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub redis_url: String,
    /// Channel the orchestrator publishes command envelopes on.
    pub command_channel: String,
    /// Channel delivery reports are published back on.
    pub report_channel: String,
    /// Window for dropping redelivered command IDs.
    pub dedup_window_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            command_channel: "stagesync:commands".to_string(),
            report_channel: "stagesync:reports".to_string(),
            dedup_window_secs: 30,
        }
    }
}

/// Timing budgets for handshake, heartbeat, clock probing, and scheduling.
/// Each timeout is independent: expiry demotes or evicts the one connection
/// rather than propagating a fatal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Probing cadence, independent of command traffic, so an estimate is
    /// always fresh enough when a command arrives.
    pub probe_interval_ms: u64,
    /// A probe unanswered for this long is discarded, not folded in.
    pub probe_timeout_ms: u64,
    pub degraded_after_ms: u64,
    pub disconnected_after_ms: u64,
    pub evicted_after_ms: u64,
    /// How often the registry sweeper walks the timeout ladder.
    pub sweep_interval_ms: u64,
    pub safety_margin_ms: i64,
    pub max_variance_ms: f64,
    pub min_samples: u32,
    pub max_qualification_probes: u32,
    pub estimate_ttl_ms: i64,
    /// Per-client outbound buffer bound before backpressure kicks in.
    pub outbound_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            probe_interval_ms: 3_000,
            probe_timeout_ms: 2_000,
            degraded_after_ms: 5_000,
            disconnected_after_ms: 15_000,
            evicted_after_ms: 60_000,
            sweep_interval_ms: 1_000,
            safety_margin_ms: 50,
            max_variance_ms: 25.0,
            min_samples: 3,
            max_qualification_probes: 16,
            estimate_ttl_ms: 10_000,
            outbound_queue_capacity: 64,
        }
    }
}

impl SyncConfig {
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            degraded_after_ms: self.degraded_after_ms as i64,
            disconnected_after_ms: self.disconnected_after_ms as i64,
            evicted_after_ms: self.evicted_after_ms as i64,
        }
    }

    #[must_use]
    pub fn clock_sync(&self) -> ClockSyncConfig {
        ClockSyncConfig {
            max_variance_ms: self.max_variance_ms,
            min_samples: self.min_samples,
            max_qualification_probes: self.max_qualification_probes,
            estimate_ttl_ms: self.estimate_ttl_ms,
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            safety_margin_ms: self.safety_margin_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// "json" for production, "pretty" for development
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then environment overrides
    /// (`STAGESYNC__SERVER__PORT=9090` style), on top of defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(Environment::with_prefix("STAGESYNC").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Fail fast on values that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.broker.redis_url.is_empty() {
            errors.push("broker.redis_url must be set".to_string());
        }
        if self.sync.safety_margin_ms < 0 {
            errors.push("sync.safety_margin_ms must be non-negative".to_string());
        }
        if self.sync.min_samples == 0 {
            errors.push("sync.min_samples must be at least 1".to_string());
        }
        if self.sync.min_samples > self.sync.max_qualification_probes {
            errors.push(
                "sync.min_samples must not exceed sync.max_qualification_probes".to_string(),
            );
        }
        if self.sync.degraded_after_ms >= self.sync.disconnected_after_ms
            || self.sync.disconnected_after_ms >= self.sync.evicted_after_ms
        {
            errors.push(
                "sync timeout ladder must be strictly increasing: degraded < disconnected < evicted"
                    .to_string(),
            );
        }
        if self.sync.outbound_queue_capacity == 0 {
            errors.push("sync.outbound_queue_capacity must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_timeout_ladder_rejected() {
        let mut config = Config::default();
        config.sync.degraded_after_ms = 20_000;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("timeout ladder")));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = Config::default();
        config.sync.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
