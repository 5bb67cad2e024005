//! Engine configuration: static defaults, JSON deserialization, and
//! environment variable overrides (spec §6, ambient "Configuration" stack
//! supplementing `os_aio_pod_channel.settings` — a `pydantic.BaseSettings`
//! subclass in the original).
//!
//! Grounded on the teacher's `DEFAULT_PORT`/CLI-constant style in
//! `src/bin/server.rs`, with `serde`/`serde_json` standing in for pydantic.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::channel::ChannelVariant;
use crate::error::ConfigError;
use crate::manager::CloseChannelMode;

/// Per-read buffer size used when no override is configured (spec §6,
/// "64 KiB·5").
pub const DEFAULT_READ_MAX: usize = 327_680;

const ENV_PREFIX: &str = "OS_AIO_POD_CHANNEL_";

fn default_read_max() -> usize {
    DEFAULT_READ_MAX
}

fn default_channel_variant() -> ChannelVariant {
    ChannelVariant::SerialStart
}

/// `close_wait`'s documented default: a 60 second grace period for
/// draining in-flight channels when the caller doesn't override it
/// (spec §6).
fn default_shutdown_timeout_ms() -> Option<u64> {
    Some(60_000)
}

/// `dumb_connect_timeout`'s documented default (spec §6): how long
/// `Channel::do_build_connection` will wait for a backend to be supplied
/// before giving up on the handshake.
fn default_dumb_connect_timeout_ms() -> Option<u64> {
    Some(3_000)
}

fn default_close_channel_mode() -> CloseChannelMode {
    CloseChannelMode::Serial
}

impl<'de> Deserialize<'de> for ChannelVariant {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "serial" | "serial_start" => Ok(ChannelVariant::SerialStart),
            "parallel" | "parallel_start" => Ok(ChannelVariant::ParallelStart),
            other => Err(serde::de::Error::custom(format!("unknown channel variant {other:?}"))),
        }
    }
}

impl<'de> Deserialize<'de> for CloseChannelMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "serial" => Ok(CloseChannelMode::Serial),
            "parallel" => Ok(CloseChannelMode::Parallel),
            other => Err(serde::de::Error::custom(format!("unknown close channel mode {other:?}"))),
        }
    }
}

/// One configured middleware entry, as read from JSON (spec §4.2, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareConfigEntry {
    pub id: Option<u8>,
    pub cls: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// One configured extension entry (spec §6, supplemented from
/// `original_source/os_aio_pod_channel/extension.py`).
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionConfigEntry {
    pub name: String,
    pub cls: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_read_max")]
    pub read_max: usize,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_channel_variant")]
    pub channel_variant: ChannelVariant,
    /// Deadline used by `Engine::on_stop` when the caller doesn't supply
    /// one explicitly, in milliseconds (spec §6 `close_wait`, default 60s).
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: Option<u64>,
    /// How long `Channel::do_build_connection` waits for a backend before
    /// giving up (spec §6 `dumb_connect_timeout`, default 3s), in
    /// milliseconds.
    #[serde(default = "default_dumb_connect_timeout_ms")]
    pub dumb_connect_timeout_ms: Option<u64>,
    /// Fleet-close strategy used by `ChannelManager::close` (spec §6
    /// `close_channel_mode`).
    #[serde(default = "default_close_channel_mode")]
    pub close_channel_mode: CloseChannelMode,
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfigEntry>,
    #[serde(default)]
    pub extensions: Vec<ExtensionConfigEntry>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            read_max: DEFAULT_READ_MAX,
            debug: false,
            channel_variant: ChannelVariant::SerialStart,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            dumb_connect_timeout_ms: default_dumb_connect_timeout_ms(),
            close_channel_mode: CloseChannelMode::Serial,
            middlewares: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        let mut config: EngineConfig = serde_json::from_str(source)?;
        config.apply_env_overrides(&std::env::vars().collect())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `OS_AIO_POD_CHANNEL_`-prefixed overrides on top of values
    /// already read from JSON. Kept as a plain `HashMap` parameter so tests
    /// can exercise it without touching the process environment.
    pub fn apply_env_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(raw) = vars.get(&format!("{ENV_PREFIX}READ_MAX")) {
            self.read_max = raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
                key: "READ_MAX".into(),
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = vars.get(&format!("{ENV_PREFIX}DEBUG")) {
            self.debug = matches!(raw.as_str(), "1" | "true" | "True" | "TRUE");
        }
        if let Some(raw) = vars.get(&format!("{ENV_PREFIX}CHANNEL_VARIANT")) {
            self.channel_variant = match raw.as_str() {
                "serial" | "serial_start" => ChannelVariant::SerialStart,
                "parallel" | "parallel_start" => ChannelVariant::ParallelStart,
                _ => {
                    return Err(ConfigError::InvalidEnvValue {
                        key: "CHANNEL_VARIANT".into(),
                        value: raw.clone(),
                    })
                }
            };
        }
        if let Some(raw) = vars.get(&format!("{ENV_PREFIX}SHUTDOWN_TIMEOUT_MS")) {
            self.shutdown_timeout_ms = Some(raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
                key: "SHUTDOWN_TIMEOUT_MS".into(),
                value: raw.clone(),
            })?);
        }
        if let Some(raw) = vars.get(&format!("{ENV_PREFIX}DUMB_CONNECT_TIMEOUT_MS")) {
            self.dumb_connect_timeout_ms = Some(raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
                key: "DUMB_CONNECT_TIMEOUT_MS".into(),
                value: raw.clone(),
            })?);
        }
        if let Some(raw) = vars.get(&format!("{ENV_PREFIX}CLOSE_CHANNEL_MODE")) {
            self.close_channel_mode = match raw.as_str() {
                "serial" => CloseChannelMode::Serial,
                "parallel" => CloseChannelMode::Parallel,
                _ => {
                    return Err(ConfigError::InvalidEnvValue {
                        key: "CLOSE_CHANNEL_MODE".into(),
                        value: raw.clone(),
                    })
                }
            };
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.middlewares {
            if let Some(id) = entry.id {
                if id > 100 {
                    return Err(ConfigError::PriorityOutOfRange { field: "middlewares[].id", value: id as i64 });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_empty_json() {
        let config = EngineConfig::from_json_unchecked("{}");
        assert_eq!(config.read_max, DEFAULT_READ_MAX);
        assert!(!config.debug);
        assert_eq!(config.channel_variant, ChannelVariant::SerialStart);
        assert_eq!(config.shutdown_timeout_ms, Some(60_000));
        assert_eq!(config.dumb_connect_timeout_ms, Some(3_000));
        assert_eq!(config.close_channel_mode, CloseChannelMode::Serial);
    }

    #[test]
    fn env_override_wins_over_json_default() {
        let mut config = EngineConfig::from_json_unchecked("{\"debug\": false}");
        let mut vars = HashMap::new();
        vars.insert(format!("{ENV_PREFIX}DEBUG"), "true".to_string());
        config.apply_env_overrides(&vars).unwrap();
        assert!(config.debug);
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let config = EngineConfig::from_json_unchecked(
            r#"{"middlewares": [{"id": 200, "cls": "Foo"}]}"#,
        );
        assert!(matches!(config.validate(), Err(ConfigError::PriorityOutOfRange { .. })));
    }

    impl EngineConfig {
        fn from_json_unchecked(source: &str) -> Self {
            serde_json::from_str(source).unwrap()
        }
    }
}
