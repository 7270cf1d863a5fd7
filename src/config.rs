//! Fleetlink configuration management.
//!
//! Handles the configuration file at:
//! - Linux: ~/.config/fleetlink/config.toml
//! - macOS: ~/Library/Application Support/fleetlink/config.toml
//! - Windows: %APPDATA%\fleetlink\config.toml
//!
//! Every field is optional; a missing file means all defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FleetError;

/// Default aggregator port
pub const DEFAULT_PORT: u16 = 12345;

/// Fleetlink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    /// Aggregator settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Device agent settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_server_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_server_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_port(),
        }
    }
}

/// Device agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Aggregator host to connect to
    #[serde(default = "default_agent_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Fixed delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Lower bound of the randomized send interval
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
    /// Upper bound of the randomized send interval
    #[serde(default = "default_max_send_interval_ms")]
    pub max_send_interval_ms: u64,
    /// Initial critical latency threshold
    #[serde(default = "default_crit_latency_ms")]
    pub crit_latency_ms: i64,
    /// Initial critical packet loss threshold
    #[serde(default = "default_crit_packet_loss")]
    pub crit_packet_loss: f64,
}

fn default_agent_host() -> String {
    "127.0.0.1".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_min_send_interval_ms() -> u64 {
    10
}

fn default_max_send_interval_ms() -> u64 {
    100
}

fn default_crit_latency_ms() -> i64 {
    100
}

fn default_crit_packet_loss() -> f64 {
    0.05
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: default_agent_host(),
            port: default_port(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            min_send_interval_ms: default_min_send_interval_ms(),
            max_send_interval_ms: default_max_send_interval_ms(),
            crit_latency_ms: default_crit_latency_ms(),
            crit_packet_loss: default_crit_packet_loss(),
        }
    }
}

impl AgentConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    fn validate(&self) -> Result<(), FleetError> {
        if self.host.trim().is_empty() || self.host.contains(char::is_whitespace) {
            return Err(FleetError::InvalidAddress {
                value: self.host.clone(),
            });
        }
        if self.reconnect_interval_ms == 0 {
            return Err(FleetError::Config {
                message: "agent.reconnect_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.min_send_interval_ms > self.max_send_interval_ms {
            return Err(FleetError::Config {
                message: format!(
                    "agent.min_send_interval_ms ({}) exceeds agent.max_send_interval_ms ({})",
                    self.min_send_interval_ms, self.max_send_interval_ms
                ),
            });
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FleetConfig {
    /// Default configuration file location, if the platform has one
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fleetlink").join("config.toml"))
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self, FleetError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, FleetError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| FleetError::ConfigIo {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| FleetError::Config {
            message: format!("Failed to parse config: {}", e),
        })?;
        config.agent.validate()?;
        Ok(config)
    }
}
