/// Configuration management for the veleta client
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::{Endpoint, ReadPreference, WriteConcern};

/// Main client configuration. Immutable after construction; owned by the
/// client for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSetConfig {
    /// Replica set identity and seed list
    pub set: SetConfig,
    /// Read/write routing defaults
    pub routing: RoutingConfig,
    /// Probe cadence and connection timeouts
    pub monitor: MonitorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Replica set identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfig {
    /// Name of the set; probes reporting a different name are discarded
    pub name: String,
    /// Seed endpoints; further members are discovered from probe responses
    pub seeds: Vec<Endpoint>,
}

/// Routing defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Default read preference; a per-operation override takes precedence
    pub read_preference: ReadPreference,
    /// Default write concern
    pub write_concern: WriteConcern,
    /// How long a select() call may wait for a usable member
    pub operation_wait_timeout_ms: u64,
}

/// Probe cadence and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between probes of each member
    pub probe_interval_ms: u64,
    /// Timeout applied to connect, probe and execute calls on a member
    pub connection_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for ReplicaSetConfig {
    fn default() -> Self {
        Self {
            set: SetConfig {
                name: "rs0".to_string(),
                seeds: vec![Endpoint::new("127.0.0.1", 27017)],
            },
            routing: RoutingConfig {
                read_preference: ReadPreference::Primary,
                write_concern: WriteConcern::default(),
                operation_wait_timeout_ms: 10_000,
            },
            monitor: MonitorConfig {
                probe_interval_ms: 1_000,
                connection_timeout_ms: 5_000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl ReplicaSetConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: ReplicaSetConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.set.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "set name cannot be empty".to_string(),
            ));
        }

        if self.set.seeds.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one seed endpoint is required".to_string(),
            ));
        }

        if self.monitor.probe_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.connection_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connection_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.routing.operation_wait_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_wait_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.routing.write_concern.required_acks(1) == 0 {
            return Err(ConfigError::ValidationError(
                "write concern must require at least one acknowledgment".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = ReplicaSetConfig {
            set: SetConfig {
                name: "rs0".to_string(),
                seeds: vec![
                    Endpoint::new("10.0.1.10", 27017),
                    Endpoint::new("10.0.1.11", 27017),
                    Endpoint::new("10.0.1.12", 27017),
                ],
            },
            routing: RoutingConfig {
                read_preference: ReadPreference::Secondary,
                write_concern: WriteConcern::members(2, 10_000),
                operation_wait_timeout_ms: 10_000,
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.probe_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.connection_timeout_ms)
    }

    pub fn operation_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.routing.operation_wait_timeout_ms)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AckLevel;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ReplicaSetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.read_preference, ReadPreference::Primary);
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_config_validation_empty_seeds() {
        let mut config = ReplicaSetConfig::default();
        config.set.seeds.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_set_name() {
        let mut config = ReplicaSetConfig::default();
        config.set.name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_intervals() {
        let mut config = ReplicaSetConfig::default();
        config.monitor.probe_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ReplicaSetConfig::default();
        config.routing.operation_wait_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_ack_write_concern() {
        let mut config = ReplicaSetConfig::default();
        config.routing.write_concern = WriteConcern::members(0, 1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = ReplicaSetConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ReplicaSetConfig = toml::from_str(&toml_str).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.set.name, config.set.name);
        assert_eq!(parsed.set.seeds, config.set.seeds);
    }

    #[test]
    fn test_config_parses_majority_and_count_ack() {
        let toml_str = r#"
            [set]
            name = "rs0"
            seeds = ["127.0.0.1:27017", "127.0.0.1:27018"]

            [routing]
            read_preference = "secondary"
            write_concern = { ack = "majority", timeout_ms = 10000 }
            operation_wait_timeout_ms = 10000

            [monitor]
            probe_interval_ms = 1000
            connection_timeout_ms = 5000

            [logging]
            level = "info"
        "#;
        let config: ReplicaSetConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.write_concern.ack, AckLevel::Majority);
        assert_eq!(config.routing.read_preference, ReadPreference::Secondary);
        assert_eq!(config.set.seeds.len(), 2);

        let toml_str = toml_str.replace("\"majority\"", "2");
        let config: ReplicaSetConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.routing.write_concern.ack, AckLevel::Members(2));
    }

    #[test]
    fn test_config_file_operations() {
        let config = ReplicaSetConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded = ReplicaSetConfig::load_from_file(temp_file.path()).unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.set.seeds, config.set.seeds);
    }

    #[test]
    fn test_example_config_is_valid() {
        let temp_file = NamedTempFile::new().unwrap();
        ReplicaSetConfig::create_example_config(temp_file.path()).unwrap();
        let loaded = ReplicaSetConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.set.seeds.len(), 3);
        assert_eq!(loaded.routing.read_preference, ReadPreference::Secondary);
    }
}
