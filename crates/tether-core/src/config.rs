//! Connector and server configuration.
//!
//! Both structures deserialize from the `[connector]` and `[server]` tables of
//! a TOML configuration file; every field has a default so partial files are
//! fine.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;

use crate::envelope::MAX_INTERVAL;
use crate::error::{LinkError, Result};

/// Default seconds a detached session is kept for resumption
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 900;

/// Client-side connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Upper bound of the jittered delay before a reconnect attempt (seconds)
    pub reconnect_delay_secs: f64,

    /// Give up reconnecting after this long without a session (seconds)
    pub session_timeout_secs: u64,

    /// How long `connect()` waits for the first session (seconds)
    pub connect_timeout_secs: u64,

    /// How long a fresh socket may take to reach `ready`/`continue` before
    /// it is dropped and redialed (seconds)
    pub handshake_timeout_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5.0,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            connect_timeout_secs: 30,
            handshake_timeout_secs: 10,
        }
    }
}

impl ConnectorConfig {
    /// Validate value ranges
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !self.reconnect_delay_secs.is_finite()
            || self.reconnect_delay_secs < 0.0
            || self.reconnect_delay_secs > MAX_INTERVAL.as_secs_f64()
        {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "reconnect_delay_secs must be between 0 and 86400",
            )));
        }
        if self.session_timeout_secs == 0 {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "session_timeout_secs must be greater than zero",
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "connect_timeout_secs must be greater than zero",
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "handshake_timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Reconnect delay upper bound
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        let secs = self.reconnect_delay_secs.clamp(0.0, MAX_INTERVAL.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// Reconnect give-up timeout
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Initial connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Deadline for a fresh socket to complete the handshake
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Accept-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Seconds between heartbeats, issued to clients in `ready`/`continue`
    pub heartbeat_interval_secs: f64,

    /// Seconds a detached session is kept for resumption
    pub session_timeout_secs: u64,

    /// Seconds a new socket has to complete the handshake
    pub handshake_timeout_secs: u64,

    /// Version announced in `hello`
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15.0,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            handshake_timeout_secs: 10,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate value ranges
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !self.heartbeat_interval_secs.is_finite()
            || self.heartbeat_interval_secs <= 0.0
            || self.heartbeat_interval_secs > MAX_INTERVAL.as_secs_f64()
        {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "heartbeat_interval_secs must be positive and at most 86400",
            )));
        }
        if self.session_timeout_secs == 0 {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "session_timeout_secs must be greater than zero",
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "handshake_timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Heartbeat interval
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        let secs = self.heartbeat_interval_secs.min(MAX_INTERVAL.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_INTERVAL)
    }

    /// Detached session lifetime
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Handshake deadline for new sockets
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ConnectorConfig::default().validate().unwrap();
        ServerConfig::default().validate().unwrap();
        assert_eq!(
            ConnectorConfig::default().session_timeout(),
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ConnectorConfig =
            serde_json::from_str(r#"{"reconnect_delay_secs": 0.5}"#).unwrap();
        assert_eq!(config.reconnect_delay(), Duration::from_millis(500));
        assert_eq!(config.session_timeout_secs, DEFAULT_SESSION_TIMEOUT_SECS);
    }

    #[test]
    fn test_invalid_values() {
        let config = ConnectorConfig {
            reconnect_delay_secs: -1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LinkError::InvalidConfig(_))));

        let config = ServerConfig {
            heartbeat_interval_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ConnectorConfig {
            handshake_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_intervals_rejected() {
        let config = ConnectorConfig {
            reconnect_delay_secs: 1e300,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LinkError::InvalidConfig(_))));
        assert_eq!(config.reconnect_delay(), MAX_INTERVAL);

        let config = ServerConfig {
            heartbeat_interval_secs: 1e300,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LinkError::InvalidConfig(_))));
        assert_eq!(config.heartbeat_interval(), MAX_INTERVAL);

        let config = ServerConfig {
            heartbeat_interval_secs: 86_400.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
