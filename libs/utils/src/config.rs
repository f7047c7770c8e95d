//! Typed configuration for the spooling producer.
//!
//! The original plugin configured itself from an arbitrary
//! `map[string]interface{}` override table. Here the recognized keys are
//! closed and enumerated: unrecognized keys are a hard [`ConfigError`]
//! at construction time rather than a silently-ignored override.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognized configuration key: {0}")]
    UnknownKey(String),

    #[error("missing required configuration key: {0}")]
    MissingKey(&'static str),

    #[error("invalid value for key {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("failed to parse configuration document: {0}")]
    Toml(#[from] toml_edit::TomlError),
}

const RECOGNIZED_KEYS: &[&str] = &[
    "path",
    "batch_max_count",
    "buffer_size_byte",
    "max_file_size",
    "max_file_age",
    "shutdown_timeout",
];

/// Rotation, batching and shutdown parameters for a [`SpoolingProducer`]
/// (defined in the `spool` crate; kept here so both the producer and the
/// CLI can depend on a single typed config surface).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpoolConfig {
    /// Base directory under which each stream gets its own subdirectory
    /// of numbered `.spl` segment files.
    pub path: String,
    /// Per-batch message cap before a flush is forced.
    pub batch_max_count: usize,
    /// `FramedReader` buffer size, in bytes, used while draining
    /// segment files.
    pub buffer_size_byte: usize,
    /// Byte threshold past which the active segment is rotated.
    pub max_file_size: u64,
    /// Age threshold (of a non-empty active segment) past which it is
    /// rotated, serialized in `humantime` form (e.g. `"5m"`).
    #[serde(with = "humantime_serde")]
    pub max_file_age: Duration,
    /// Maximum time a batch is given to drain during shutdown or
    /// rotation, serialized in `humantime` form.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: "./spool".to_string(),
            batch_max_count: 4096,
            buffer_size_byte: 8192,
            max_file_size: 512 * 1024 * 1024,
            max_file_age: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl SpoolConfig {
    /// Parses a TOML document under a `[spool]` table. Every key under
    /// that table must be recognized; any field the document omits
    /// falls back to [`Default::default`].
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        let doc = document.parse::<toml_edit::Document>()?;
        let mut overrides = HashMap::new();
        if let Some(table) = doc.get("spool").and_then(|item| item.as_table()) {
            for (key, value) in table.iter() {
                overrides.insert(key.to_string(), value.to_string().trim_matches('"').to_string());
            }
        }
        Self::from_map(&overrides)
    }

    /// Builds a config from a string-keyed override map, as used by
    /// tests and by callers embedding the crate without a config file.
    /// Rejects any key not in [`RECOGNIZED_KEYS`].
    pub fn from_map(overrides: &HashMap<String, String>) -> Result<Self, ConfigError> {
        for key in overrides.keys() {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
        }

        let mut config = Self::default();

        if let Some(v) = overrides.get("path") {
            config.path = v.clone();
        }
        if let Some(v) = overrides.get("batch_max_count") {
            config.batch_max_count = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "batch_max_count",
                reason: format!("{v:?} is not a non-negative integer"),
            })?;
        }
        if let Some(v) = overrides.get("buffer_size_byte") {
            config.buffer_size_byte = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "buffer_size_byte",
                reason: format!("{v:?} is not a non-negative integer"),
            })?;
        }
        if let Some(v) = overrides.get("max_file_size") {
            config.max_file_size = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "max_file_size",
                reason: format!("{v:?} is not a non-negative integer"),
            })?;
        }
        if let Some(v) = overrides.get("max_file_age") {
            config.max_file_age = humantime::parse_duration(v).map_err(|e| ConfigError::InvalidValue {
                key: "max_file_age",
                reason: e.to_string(),
            })?;
        }
        if let Some(v) = overrides.get("shutdown_timeout") {
            config.shutdown_timeout =
                humantime::parse_duration(v).map_err(|e| ConfigError::InvalidValue {
                    key: "shutdown_timeout",
                    reason: e.to_string(),
                })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_empty_map() {
        let config = SpoolConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(config, SpoolConfig::default());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("totally_made_up".to_string(), "1".to_string());
        let err = SpoolConfig::from_map(&overrides).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn durations_parse_humantime() {
        let mut overrides = HashMap::new();
        overrides.insert("max_file_age".to_string(), "5m".to_string());
        let config = SpoolConfig::from_map(&overrides).unwrap();
        assert_eq!(config.max_file_age, Duration::from_secs(300));
    }
}
