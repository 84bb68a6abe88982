//! Engine configuration with load-time validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum idle threshold most idle sensors can honor.
const MIN_IDLE_THRESHOLD_SECS: u32 = 15;

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration or threshold was zero.
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    /// The idle threshold is below what the sensor can detect.
    #[error("idle_threshold_secs must be at least 15, got {value}")]
    IdleThresholdTooShort { value: u32 },
    /// Every tick would be classified as a gap.
    #[error(
        "tick_interval_secs ({tick_interval_secs}s) must be shorter than max_trusted_gap_ms ({max_trusted_gap_ms}ms)"
    )]
    TickExceedsGapThreshold {
        tick_interval_secs: u64,
        max_trusted_gap_ms: u64,
    },
}

/// Engine settings.
///
/// Read at initialization and on explicit settings changes. A change to
/// `epoch_duration_minutes` only affects epochs opened afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Width of each epoch.
    pub epoch_duration_minutes: u32,
    /// Seconds without input before the host counts as idle.
    pub idle_threshold_secs: u32,
    /// Elapsed time above which an interval is recorded as a gap.
    pub max_trusted_gap_ms: u64,
    /// Period of the reconciliation tick.
    pub tick_interval_secs: u64,
    /// How often the busy-state listener polls the idle source.
    pub busy_poll_interval_secs: u64,
    /// Liveness age after which the engine is considered stalled.
    pub stale_threshold_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epoch_duration_minutes: 15,
            idle_threshold_secs: 60,
            max_trusted_gap_ms: 120_000,
            tick_interval_secs: 60,
            busy_poll_interval_secs: 5,
            stale_threshold_secs: 180,
        }
    }
}

impl EngineConfig {
    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epoch_duration_minutes == 0 {
            return Err(ConfigError::Zero {
                field: "epoch_duration_minutes",
            });
        }
        if self.max_trusted_gap_ms == 0 {
            return Err(ConfigError::Zero {
                field: "max_trusted_gap_ms",
            });
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "tick_interval_secs",
            });
        }
        if self.busy_poll_interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "busy_poll_interval_secs",
            });
        }
        if self.stale_threshold_secs == 0 {
            return Err(ConfigError::Zero {
                field: "stale_threshold_secs",
            });
        }
        if self.idle_threshold_secs < MIN_IDLE_THRESHOLD_SECS {
            return Err(ConfigError::IdleThresholdTooShort {
                value: self.idle_threshold_secs,
            });
        }
        if self.tick_interval_secs.saturating_mul(1000) >= self.max_trusted_gap_ms {
            return Err(ConfigError::TickExceedsGapThreshold {
                tick_interval_secs: self.tick_interval_secs,
                max_trusted_gap_ms: self.max_trusted_gap_ms,
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    #[must_use]
    pub const fn busy_poll_interval(&self) -> Duration {
        Duration::from_secs(self.busy_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.epoch_duration_minutes, 15);
        assert_eq!(config.max_trusted_gap_ms, 120_000);
        assert_eq!(config.stale_threshold_secs, 180);
    }

    #[test]
    fn rejects_zero_epoch_duration() {
        let config = EngineConfig {
            epoch_duration_minutes: 0,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "epoch_duration_minutes"
            })
        );
    }

    #[test]
    fn rejects_short_idle_threshold() {
        let config = EngineConfig {
            idle_threshold_secs: 5,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::IdleThresholdTooShort { value: 5 })
        );
    }

    #[test]
    fn rejects_tick_that_always_looks_like_a_gap() {
        let config = EngineConfig {
            tick_interval_secs: 120,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TickExceedsGapThreshold { .. })
        ));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"epoch_duration_minutes": 5}"#).unwrap();
        assert_eq!(config.epoch_duration_minutes, 5);
        assert_eq!(config.idle_threshold_secs, 60);
    }
}
