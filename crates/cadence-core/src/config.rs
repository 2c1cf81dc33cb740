//! Engine configuration
//!
//! One `EngineConfig` is created at host startup and passed explicitly into
//! the `EngineContext`; nothing here is global.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Buffer sizing presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferProfile {
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

impl BufferProfile {
    /// Media a loader may prefetch ahead of the playhead
    pub fn max_buffer(&self) -> Duration {
        Duration::from_secs(match self {
            BufferProfile::Low => 15,
            BufferProfile::Medium => 50,
            BufferProfile::High => 60,
            BufferProfile::Highest => 300,
        })
    }
}

/// Thresholds for `DefaultLoadPolicy` and `ThrottleAwarePolicy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Cooldown applied to an excluded representation
    pub exclusion_ms: u64,
    /// Linear backoff step per failed attempt
    pub backoff_step_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
    /// Attempts after which a transient failure escalates to exclusion
    pub max_retry_attempts: u32,
    /// Pattern extracting a server "wait N seconds" hint; group 1 is N
    pub throttle_pattern: String,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            exclusion_ms: 60_000,
            backoff_step_ms: 1_000,
            max_backoff_ms: 5_000,
            max_retry_attempts: 10,
            throttle_pattern: r"(?i)wait\s+(\d+)\s*sec".to_string(),
        }
    }
}

/// Track selection preferences applied when no explicit choice exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionPreferences {
    /// Preferred audio language (BCP-47)
    pub preferred_audio_language: Option<String>,
    /// Cap for automatic video selection (bps)
    pub max_video_bitrate: Option<u64>,
}

/// Process-wide engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// User agent sent by the HTTP transport
    pub user_agent: String,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Initial bandwidth estimate in bps
    pub initial_bitrate_estimate: u64,
    /// Segments fetched per media-playlist load
    pub max_segments_per_load: usize,
    /// Buffer sizing preset
    pub buffer_profile: BufferProfile,
    /// Load failure thresholds
    pub resilience: ResilienceConfig,
    /// Selection preferences
    pub selection: SelectionPreferences,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("cadence/{}", crate::VERSION),
            connect_timeout_ms: 8_000,
            read_timeout_ms: 8_000,
            initial_bitrate_estimate: 25_000_000,
            max_segments_per_load: 5,
            buffer_profile: BufferProfile::default(),
            resilience: ResilienceConfig::default(),
            selection: SelectionPreferences::default(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from JSON; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.max_segments_per_load == 0 {
            return Err(Error::InvalidConfig(
                "max_segments_per_load must be at least 1".into(),
            ));
        }
        if self.resilience.max_backoff_ms < self.resilience.backoff_step_ms {
            return Err(Error::InvalidConfig(format!(
                "max_backoff_ms ({}) is below backoff_step_ms ({})",
                self.resilience.max_backoff_ms, self.resilience.backoff_step_ms
            )));
        }
        regex::Regex::new(&self.resilience.throttle_pattern)
            .map_err(|e| Error::InvalidConfig(format!("throttle_pattern: {}", e)))?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.initial_bitrate_estimate, 25_000_000);
        assert_eq!(config.max_segments_per_load, 5);
        assert_eq!(config.resilience.exclusion_ms, 60_000);
        assert_eq!(config.resilience.max_backoff_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "buffer_profile": "highest", "resilience": { "exclusion_ms": 30000 } }"#,
        )
        .unwrap();
        assert_eq!(config.buffer_profile, BufferProfile::Highest);
        assert_eq!(config.resilience.exclusion_ms, 30_000);
        assert_eq!(config.resilience.backoff_step_ms, 1_000);
        assert_eq!(config.read_timeout_ms, 8_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = EngineConfig::from_json_str(
            r#"{ "resilience": { "backoff_step_ms": 2000, "max_backoff_ms": 1000 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = EngineConfig::from_json_str(r#"{ "max_segments_per_load": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_buffer_profiles() {
        assert_eq!(BufferProfile::Low.max_buffer(), Duration::from_secs(15));
        assert_eq!(BufferProfile::default().max_buffer(), Duration::from_secs(50));
        assert_eq!(BufferProfile::Highest.max_buffer(), Duration::from_secs(300));
    }
}
