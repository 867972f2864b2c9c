//! Session layer configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the session manager, stream readers and discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Channel indices run from 0 to `max_channels - 1`. At most 32; larger
    /// values are clamped.
    pub max_channels: u8,

    /// Session limit pushed to the engine before it is initialized.
    pub max_sessions: Option<u32>,

    /// Upper bound on a connect call, on top of the engine's own timeout.
    /// A handle the engine hands out after this expires is closed as soon
    /// as it arrives and never registered.
    #[serde(with = "millis_serde")]
    pub connect_timeout: Duration,

    /// Bytes requested per stream reader read.
    pub read_buffer_size: usize,

    /// Timeout of each stream reader read. Bounds cancellation latency.
    #[serde(with = "millis_serde")]
    pub reader_poll_timeout: Duration,

    /// Capacity of each subscription queue.
    pub reader_queue_depth: usize,

    /// How long close waits for a reader to exit before aborting it.
    #[serde(with = "millis_serde")]
    pub shutdown_grace: Duration,

    /// Timeout used by `scan_default`.
    #[serde(with = "millis_serde")]
    pub scan_timeout: Duration,

    /// Close the session when its reader hits a fatal engine error.
    pub close_on_reader_failure: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_channels: 32,
            max_sessions: None,
            connect_timeout: Duration::from_millis(10_000),
            read_buffer_size: 1024,
            reader_poll_timeout: Duration::from_millis(500),
            reader_queue_depth: 64,
            shutdown_grace: Duration::from_millis(250),
            scan_timeout: Duration::from_millis(5_000),
            close_on_reader_failure: true,
        }
    }
}

impl LinkConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<LinkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.max_channels, 32);
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.reader_poll_timeout < config.connect_timeout);
        assert!(config.close_on_reader_failure);
        assert!(config.max_sessions.is_none());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let json = serde_json::to_value(LinkConfig::default()).unwrap();
        assert_eq!(json["reader_poll_timeout"], 500);
        assert_eq!(json["shutdown_grace"], 250);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{"max_channels": 8, "scan_timeout": 1500}"#).unwrap();
        assert_eq!(config.max_channels, 8);
        assert_eq!(config.scan_timeout, Duration::from_millis(1500));
        assert_eq!(config.read_buffer_size, 1024);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("link.json");

        let mut original = LinkConfig::default();
        original.max_sessions = Some(4);
        original.reader_queue_depth = 8;
        original.save_to_file(&path).unwrap();

        let loaded = LinkConfig::load_or_default(&path);
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_corrupt_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(LinkConfig::load_or_default(&path), LinkConfig::default());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkConfig::load_or_default(&dir.path().join("absent.json"));
        assert_eq!(config.max_channels, 32);
    }
}
