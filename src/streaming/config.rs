//! Streaming configuration
//!
//! Serialized as JSON. Every field has a default, so a config file only
//! needs the values it overrides.

use crate::streaming::buffer_pool::DEFAULT_IDLE_TICKS;
use crate::streaming::cache::DEFAULT_MAX_PINNED;
use crate::streaming::lod::LodPolicy;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables of the streaming subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// GPU byte budget of the residency cache
    pub memory_budget_bytes: u64,
    /// Frames ahead of the playback position to keep resident
    pub prefetch_window: u32,
    /// Concurrent decode jobs
    pub worker_count: usize,
    /// How long a failed key waits before it may be requested again
    #[serde(with = "duration_millis", rename = "retry_cooldown_ms")]
    pub retry_cooldown: Duration,
    /// Simultaneously pinned cache entries
    pub max_pinned: usize,
    pub lod_policy: LodPolicy,
    /// Frames behind the playback position to keep resident
    pub frames_behind: u32,
    /// Frames that must be decoded before playback starts
    pub buffering_frames: u32,
    /// Pipeline ticks before an unused buffer is released to the device
    pub buffer_idle_ticks: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 512 * 1024 * 1024,
            prefetch_window: 8,
            worker_count: 4,
            retry_cooldown: Duration::from_secs(2),
            max_pinned: DEFAULT_MAX_PINNED,
            lod_policy: LodPolicy::default(),
            frames_behind: 0,
            buffering_frames: 2,
            buffer_idle_ticks: DEFAULT_IDLE_TICKS,
        }
    }
}

impl StreamingConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: StreamingConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_budget_bytes == 0 {
            return Err(ConfigError::Invalid("memory_budget_bytes must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.max_pinned == 0 {
            return Err(ConfigError::Invalid("max_pinned must be at least 1".into()));
        }
        if self.buffering_frames > self.prefetch_window + 1 {
            return Err(ConfigError::Invalid(format!(
                "buffering_frames ({}) exceeds the prefetch window ({} frames)",
                self.buffering_frames,
                self.prefetch_window + 1
            )));
        }
        Ok(())
    }

    /// Frames competing for the budget at any time
    pub fn resident_frames(&self) -> u32 {
        self.prefetch_window + 1 + self.frames_behind
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        let config = StreamingConfig::default();
        config.validate().expect("default config is valid");
        assert_eq!(config.max_pinned, 2);
        assert_eq!(config.buffer_idle_ticks, 30);
        assert_eq!(config.resident_frames(), 9);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "prefetch_window": 3, "retry_cooldown_ms": 250, "lod_policy": { "policy": "fixed", "level": 1 } }"#;
        let config: StreamingConfig = serde_json::from_str(json).expect("parses");
        assert_eq!(config.prefetch_window, 3);
        assert_eq!(config.retry_cooldown, Duration::from_millis(250));
        assert_eq!(config.lod_policy, LodPolicy::Fixed { level: 1 });
        assert_eq!(config.worker_count, StreamingConfig::default().worker_count);
    }

    #[test]
    fn test_validate_rejects() {
        let config = StreamingConfig { worker_count: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = StreamingConfig { prefetch_window: 1, buffering_frames: 3, ..Default::default() };
        assert!(config.validate().is_err());

        let config = StreamingConfig { memory_budget_bytes: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("streaming.json");

        let config = StreamingConfig {
            memory_budget_bytes: 64 * 1024 * 1024,
            frames_behind: 1,
            ..Default::default()
        };
        config.save(&path).expect("save failed");

        let loaded = StreamingConfig::load(&path).expect("load failed");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "worker_count": 0 }"#).expect("write failed");
        assert!(matches!(StreamingConfig::load(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "not json").expect("write failed");
        assert!(matches!(StreamingConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
