//! Collector configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::dispatcher::config::ConfigError;

/// Configuration for a collector process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Dispatcher base URL
    pub dispatcher_url: String,

    /// Collector name (unique per dispatcher)
    pub name: String,

    /// Shared secret used for login
    pub secret: String,

    /// Register on startup if the name is not yet known
    pub register_on_start: bool,

    /// Declared category capabilities
    pub categories: Vec<String>,

    /// Declared location capabilities
    pub locations: Vec<String>,

    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Assignment poll interval in seconds
    pub poll_interval_secs: u64,

    /// Source refresh period in seconds (per task)
    pub refresh_secs: u64,

    /// Feed requests per minute across all workers
    pub requests_per_minute: u32,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            dispatcher_url: "http://localhost:8080".to_string(),
            name: "collector".to_string(),
            secret: String::new(),
            register_on_start: true,
            categories: Vec::new(),
            locations: Vec::new(),
            heartbeat_interval_secs: 30,
            poll_interval_secs: 5,
            refresh_secs: 60,
            requests_per_minute: 30,
            request_timeout_secs: 15,
        }
    }
}

impl CollectorConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                reason: "Collector name must not be empty".to_string(),
            });
        }

        if self.secret.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "secret".to_string(),
                reason: "Secret must not be empty".to_string(),
            });
        }

        if let Err(e) = url::Url::parse(&self.dispatcher_url) {
            return Err(ConfigError::InvalidValue {
                field: "dispatcher_url".to_string(),
                reason: format!("Not a valid URL: {e}"),
            });
        }

        if self.heartbeat_interval_secs == 0 || self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval_secs".to_string(),
                reason: "Intervals must be non-zero".to_string(),
            });
        }

        if self.refresh_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "refresh_secs".to_string(),
                reason: "Refresh period must be non-zero".to_string(),
            });
        }

        if self.requests_per_minute == 0 {
            return Err(ConfigError::InvalidValue {
                field: "requests_per_minute".to_string(),
                reason: "Rate limit must allow at least 1 request per minute".to_string(),
            });
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> CollectorConfig {
        CollectorConfig {
            secret: "s3cret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let config = CollectorConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = CollectorConfig {
            name: "  ".to_string(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_dispatcher_url_rejected() {
        let config = CollectorConfig {
            dispatcher_url: "not a url".to_string(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_refresh_rejected() {
        let config = CollectorConfig {
            refresh_secs: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
dispatcher_url = "http://dispatcher:8080"
name = "edge-1"
secret = "s3cret"
register_on_start = true
categories = ["news"]
locations = ["europe"]
heartbeat_interval_secs = 20
poll_interval_secs = 5
refresh_secs = 30
requests_per_minute = 60
request_timeout_secs = 10
"#
        )
        .unwrap();

        let config = CollectorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "edge-1");
        assert_eq!(config.refresh_secs, 30);
        assert_eq!(config.categories, vec!["news".to_string()]);
    }
}
