//! Relay configuration
//!
//! Settings come from an optional TOML file; anything not set there falls back
//! to a default, and CLI flags override the file (handled in main).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Upgrade path clients must request
    pub endpoint: String,
    /// Capacity of each connection's outbound fan-out queue
    pub queue_capacity: usize,
    /// Seconds between server heartbeat pings
    pub heartbeat_interval_secs: u64,
    /// Seconds without any inbound frame before a connection is closed
    pub idle_timeout_secs: u64,
    /// Seconds one outbound frame send may take before the peer is dropped
    pub send_timeout_secs: u64,
    /// Seconds to wait for open connections to finish during shutdown
    pub drain_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
            endpoint: "/ws/admin/meal_updates/".to_string(),
            queue_capacity: 64,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 120,
            send_timeout_secs: 5,
            drain_timeout_secs: 5,
        }
    }
}

impl RelayConfig {
    /// Load configuration
    ///
    /// With no path this is just the defaults. With a path the file must exist
    /// and parse; a config file the operator asked for should not fail silently.
    /// Values the server cannot run with are rejected here, at startup.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime panics on at connection time: a channel
    /// needs a non-zero capacity, an interval a non-zero period. Zero for
    /// the remaining duration knobs is aggressive but runnable.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Check whether a request path targets the relay endpoint
    ///
    /// Trailing slashes are not significant.
    pub fn endpoint_matches(&self, path: &str) -> bool {
        path.trim_end_matches('/') == self.endpoint.trim_end_matches('/')
    }

    /// Heartbeat ping interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Idle cutoff for a silent connection
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Cap on a single outbound frame send
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// How long shutdown waits for connections to drain
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
