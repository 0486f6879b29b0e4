//! Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for the dispatcher server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Heartbeat timeout in seconds; a collector silent this long is lost
    pub heartbeat_timeout_secs: u64,

    /// Expected collector heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Assignment matching pass period in seconds
    pub assignment_period_secs: u64,

    /// Completion sweep period in seconds
    pub completion_period_secs: u64,

    /// Per-subscription result buffer capacity
    pub subscriber_buffer: usize,

    /// Path to the source catalog JSON file
    pub catalog_path: String,

    /// Enable CORS for the API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".parse().expect("static address"),
            heartbeat_timeout_secs: 90,
            heartbeat_interval_secs: 30,
            assignment_period_secs: 5,
            completion_period_secs: 5,
            subscriber_buffer: 256,
            catalog_path: "sources.json".to_string(),
            enable_cors: true,
            enable_request_logging: true,
        }
    }
}

impl DispatcherConfig {
    /// Create a new config builder
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_timeout_secs".to_string(),
                reason: "Timeout must be greater than the heartbeat interval".to_string(),
            });
        }

        if self.subscriber_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "subscriber_buffer".to_string(),
                reason: "Buffer must hold at least 1 record".to_string(),
            });
        }

        if self.assignment_period_secs == 0 || self.completion_period_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "assignment_period_secs".to_string(),
                reason: "Sweep periods must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Liveness sweep period: half the timeout, so the Suspect stage is
    /// always observed before Offline.
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs((self.heartbeat_timeout_secs / 2).max(1))
    }

    pub fn assignment_period(&self) -> Duration {
        Duration::from_secs(self.assignment_period_secs)
    }

    pub fn completion_period(&self) -> Duration {
        Duration::from_secs(self.completion_period_secs)
    }
}

/// Builder for DispatcherConfig
#[derive(Debug, Default)]
pub struct DispatcherConfigBuilder {
    bind_address: Option<SocketAddr>,
    heartbeat_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    assignment_period_secs: Option<u64>,
    completion_period_secs: Option<u64>,
    subscriber_buffer: Option<usize>,
    catalog_path: Option<String>,
    enable_cors: Option<bool>,
    enable_request_logging: Option<bool>,
}

impl DispatcherConfigBuilder {
    /// Set bind address from string
    pub fn bind_address_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.bind_address = Some(addr.parse().map_err(|_| ConfigError::InvalidValue {
            field: "bind_address".to_string(),
            reason: format!("Invalid address: {}", addr),
        })?);
        Ok(self)
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    pub fn heartbeat_timeout_secs(mut self, secs: u64) -> Self {
        self.heartbeat_timeout_secs = Some(secs);
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = Some(secs);
        self
    }

    pub fn assignment_period_secs(mut self, secs: u64) -> Self {
        self.assignment_period_secs = Some(secs);
        self
    }

    pub fn completion_period_secs(mut self, secs: u64) -> Self {
        self.completion_period_secs = Some(secs);
        self
    }

    pub fn subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = Some(capacity);
        self
    }

    pub fn catalog_path(mut self, path: impl Into<String>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn enable_cors(mut self, enable: bool) -> Self {
        self.enable_cors = Some(enable);
        self
    }

    pub fn enable_request_logging(mut self, enable: bool) -> Self {
        self.enable_request_logging = Some(enable);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<DispatcherConfig, ConfigError> {
        let defaults = DispatcherConfig::default();
        let config = DispatcherConfig {
            bind_address: self.bind_address.unwrap_or(defaults.bind_address),
            heartbeat_timeout_secs: self
                .heartbeat_timeout_secs
                .unwrap_or(defaults.heartbeat_timeout_secs),
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            assignment_period_secs: self
                .assignment_period_secs
                .unwrap_or(defaults.assignment_period_secs),
            completion_period_secs: self
                .completion_period_secs
                .unwrap_or(defaults.completion_period_secs),
            subscriber_buffer: self.subscriber_buffer.unwrap_or(defaults.subscriber_buffer),
            catalog_path: self.catalog_path.unwrap_or(defaults.catalog_path),
            enable_cors: self.enable_cors.unwrap_or(defaults.enable_cors),
            enable_request_logging: self
                .enable_request_logging
                .unwrap_or(defaults.enable_request_logging),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue { field: String, reason: String },
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            Self::Io(msg) => write!(f, "Failed to read config file: {msg}"),
            Self::Parse(msg) => write!(f, "Failed to parse config file: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_timeout_secs, 90);
        assert_eq!(config.sweep_period(), Duration::from_secs(45));
    }

    #[test]
    fn test_config_builder() {
        let config = DispatcherConfig::builder()
            .heartbeat_timeout_secs(120)
            .heartbeat_interval_secs(60)
            .subscriber_buffer(32)
            .build()
            .unwrap();

        assert_eq!(config.heartbeat_timeout_secs, 120);
        assert_eq!(config.subscriber_buffer, 32);
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let result = DispatcherConfig::builder()
            .heartbeat_timeout_secs(30)
            .heartbeat_interval_secs(60)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let result = DispatcherConfig::builder().subscriber_buffer(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bind_address = "127.0.0.1:9000"
heartbeat_timeout_secs = 60
heartbeat_interval_secs = 20
assignment_period_secs = 5
completion_period_secs = 5
subscriber_buffer = 128
catalog_path = "catalog.json"
enable_cors = false
enable_request_logging = true
"#
        )
        .unwrap();

        let config = DispatcherConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_address.port(), 9000);
        assert_eq!(config.heartbeat_timeout_secs, 60);
        assert!(!config.enable_cors);
    }
}
