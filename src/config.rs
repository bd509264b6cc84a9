//! Forwarding configuration and opaque key-value option parsing.

use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capacity requested for the shared notification buffer.
pub const BUFFER_SIZE_KEY: &str = "notification.buffer.size";
/// Upper bound on notifications returned by one fetch.
pub const FETCH_MAX_KEY: &str = "notification.fetch.max";
/// Long-poll timeout in milliseconds.
pub const FETCH_TIMEOUT_KEY: &str = "notification.fetch.timeout";
/// Idle time in milliseconds after which a connection is stopped; `0` disables.
pub const IDLE_TIMEOUT_KEY: &str = "connection.idle.timeout";
/// Liveness probe period in milliseconds.
pub const PROBE_PERIOD_KEY: &str = "connection.probe.period";

/// Largest accepted buffer capacity or fetch count.
pub const MAX_COUNT: usize = 1 << 24;

/// Errors raised while building a [`ForwarderConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A key carried a value that does not parse or is out of range.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Option key.
        key: String,
        /// Raw value.
        value: String,
    },
    /// JSON document could not be read.
    #[error("config document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables shared by the server session and the client pump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Capacity each session requests from the shared buffer.
    pub buffer_capacity: usize,
    /// Most notifications returned by one fetch.
    pub max_fetch_count: usize,
    /// Long-poll timeout; also the server-side clamp.
    pub fetch_timeout_ms: u64,
    /// Idle timeout for a monitored connection, if any.
    pub connection_idle_timeout_ms: Option<u64>,
    /// Period between liveness probes.
    pub probe_period_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            max_fetch_count: 1000,
            fetch_timeout_ms: 60_000,
            connection_idle_timeout_ms: Some(120_000),
            probe_period_ms: 60_000,
        }
    }
}

impl ForwarderConfig {
    /// Reads a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlays recognised keys from `options` on the defaults. Unknown keys
    /// are ignored; they belong to other layers of the connector.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = options.get(BUFFER_SIZE_KEY) {
            cfg.buffer_capacity = parse(BUFFER_SIZE_KEY, v)?;
        }
        if let Some(v) = options.get(FETCH_MAX_KEY) {
            cfg.max_fetch_count = parse(FETCH_MAX_KEY, v)?;
        }
        if let Some(v) = options.get(FETCH_TIMEOUT_KEY) {
            cfg.fetch_timeout_ms = parse(FETCH_TIMEOUT_KEY, v)?;
        }
        if let Some(v) = options.get(IDLE_TIMEOUT_KEY) {
            let ms: u64 = parse(IDLE_TIMEOUT_KEY, v)?;
            cfg.connection_idle_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(v) = options.get(PROBE_PERIOD_KEY) {
            cfg.probe_period_ms = parse(PROBE_PERIOD_KEY, v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects zero or oversized counts and a zero probe period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (BUFFER_SIZE_KEY, self.buffer_capacity as u64, MAX_COUNT as u64),
            (FETCH_MAX_KEY, self.max_fetch_count as u64, MAX_COUNT as u64),
            (PROBE_PERIOD_KEY, self.probe_period_ms, u64::MAX),
        ];
        for (key, value, max) in checks {
            if value == 0 || value > max {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Long-poll timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.connection_idle_timeout_ms.map(Duration::from_millis)
    }

    /// Liveness probe period.
    pub fn probe_period(&self) -> Duration {
        Duration::from_millis(self.probe_period_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
