//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must not panic the connector or server configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::{ConnectorConfig, ServerConfig};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<ConnectorConfig>(s) {
            if config.validate().is_ok() {
                let _ = config.reconnect_delay();
            }
        }
        if let Ok(config) = toml::from_str::<ServerConfig>(s) {
            if config.validate().is_ok() {
                let _ = config.heartbeat_interval();
            }
        }
    }
});
