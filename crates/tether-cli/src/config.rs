//! Configuration file for the tether CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tether_core::{ConnectorConfig, ServerConfig};

/// Contents of `tether.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client connector settings (`tether ping`)
    pub connector: ConnectorConfig,
    /// Controller endpoint settings (`tether controller`)
    pub server: ServerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG` and `--verbose`
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

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load `path` if it exists, otherwise use defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.connector.validate()?;
        self.server.validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connector.session_timeout_secs, 900);
        assert_eq!(config.server.heartbeat_interval_secs, 15.0);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let config = Config::parse(
            r#"
            [connector]
            reconnect_delay_secs = 0.5

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.connector.reconnect_delay_secs, 0.5);
        assert_eq!(config.connector.session_timeout_secs, 900);
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.heartbeat_interval_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized = Config::parse(&toml_str).unwrap();
        assert_eq!(config.connector, deserialized.connector);
        assert_eq!(config.server, deserialized.server);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_or_default("/nonexistent/tether.toml").unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
