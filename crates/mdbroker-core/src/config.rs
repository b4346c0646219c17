//! Configuration types for mdbroker

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{BrokerError, BrokerResult};

/// Default number of heartbeat windows a worker may miss
pub const DEFAULT_MAX_LIVENESS: u32 = 3;

/// Default heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2500;

/// Suffix appended to a peer address to reach its receiving socket
pub const DEFAULT_RECEIVER_SUFFIX: &str = "_receiver";

/// Longest accepted heartbeat interval (one hour)
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Main broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker loop configuration
    pub broker: BrokerSettings,
    /// Service discovery registration
    pub registrator: RegistratorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> BrokerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("Failed to read config file: {}", e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BrokerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the liveness algorithm cannot work with
    pub fn validate(&self) -> BrokerResult<()> {
        if self.broker.max_liveness == 0 {
            return Err(BrokerError::Config(
                "max_liveness must be at least 1".to_string(),
            ));
        }
        if self.broker.heartbeat_interval_ms == 0 {
            return Err(BrokerError::Config(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.broker.heartbeat_interval_ms > MAX_HEARTBEAT_INTERVAL_MS {
            return Err(BrokerError::Config(format!(
                "heartbeat_interval_ms must be at most {}",
                MAX_HEARTBEAT_INTERVAL_MS
            )));
        }
        Ok(())
    }
}

/// Broker loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Endpoint the broker binds, e.g. `tcp://0.0.0.0:5555`
    pub endpoint: String,
    /// Heartbeat interval in milliseconds; also the poll timeout
    pub heartbeat_interval_ms: u64,
    /// Liveness a worker starts with and must hold to receive work
    pub max_liveness: u32,
    /// Suffix of the address peers receive on
    pub receiver_suffix: String,
}

impl BrokerSettings {
    /// Poll timeout and heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Window a worker has to heartbeat before losing a liveness point
    pub fn heartbeat_expiry(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .saturating_mul(u64::from(self.max_liveness)),
        )
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp://0.0.0.0:5555".to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_liveness: DEFAULT_MAX_LIVENESS,
            receiver_suffix: DEFAULT_RECEIVER_SUFFIX.to_string(),
        }
    }
}

/// Service discovery registration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistratorConfig {
    /// Discovery URL to announce to; registration is disabled when unset
    pub url: Option<String>,
    /// Minimum seconds between announcements
    pub interval_secs: u64,
    /// Endpoint advertised to the discovery service (defaults to the bind endpoint)
    pub advertised_endpoint: Option<String>,
}

impl Default for RegistratorConfig {
    fn default() -> Self {
        Self {
            url: None,
            interval_secs: 10,
            advertised_endpoint: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
