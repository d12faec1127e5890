//! Store configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{ChronoError, Result};

const MS_PER_DAY: i64 = 86_400_000;

/// Upper bound for every duration setting (100 years).
pub const MAX_PERIOD_MS: i64 = 100 * 365 * MS_PER_DAY;

/// Tuning knobs for the bi-temporal store and its maintenance cycle.
///
/// Every field is optional when deserializing; missing fields take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// Revisions kept per edge after a maintenance cycle.
    pub max_revision_history: usize,
    /// Confidence lost per day of edge age, per maintenance cycle.
    pub confidence_decay_rate: f32,
    /// Tolerance applied to context-window bounds when matching instants.
    pub context_window_overlap_ms: i64,
    /// Invalidate edges automatically when their files change.
    pub automatic_invalidation: bool,
    /// How long a closed edge is kept after its valid time ended.
    pub retention_period_ms: i64,
    /// Minimum spacing between maintenance snapshots.
    pub snapshot_interval_ms: i64,
    /// Period of the background maintenance task.
    pub maintenance_interval_ms: u64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            max_revision_history: 50,
            confidence_decay_rate: 0.01,
            context_window_overlap_ms: 300_000,
            automatic_invalidation: true,
            retention_period_ms: 365 * MS_PER_DAY,
            snapshot_interval_ms: MS_PER_DAY,
            maintenance_interval_ms: 3_600_000,
        }
    }
}

impl TemporalConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: TemporalConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChronoError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_revision_history == 0 {
            return Err(ChronoError::Validation(
                "max_revision_history must be >= 1".to_string(),
            ));
        }
        if !self.confidence_decay_rate.is_finite() || self.confidence_decay_rate < 0.0 {
            return Err(ChronoError::Validation(format!(
                "confidence_decay_rate must be a finite non-negative number, got {}",
                self.confidence_decay_rate
            )));
        }
        if self.context_window_overlap_ms < 0 {
            return Err(ChronoError::Validation(
                "context_window_overlap_ms must be >= 0".to_string(),
            ));
        }
        if self.retention_period_ms <= 0 {
            return Err(ChronoError::Validation(
                "retention_period_ms must be > 0".to_string(),
            ));
        }
        if self.snapshot_interval_ms <= 0 {
            return Err(ChronoError::Validation(
                "snapshot_interval_ms must be > 0".to_string(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ChronoError::Validation(
                "maintenance_interval_ms must be > 0".to_string(),
            ));
        }
        let periods = [
            ("context_window_overlap_ms", self.context_window_overlap_ms),
            ("retention_period_ms", self.retention_period_ms),
            ("snapshot_interval_ms", self.snapshot_interval_ms),
            (
                "maintenance_interval_ms",
                i64::try_from(self.maintenance_interval_ms).unwrap_or(i64::MAX),
            ),
        ];
        for (name, value) in periods {
            if value > MAX_PERIOD_MS {
                return Err(ChronoError::Validation(format!(
                    "{name} must be <= {MAX_PERIOD_MS}, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn retention_period(&self) -> Duration {
        Duration::milliseconds(self.retention_period_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::milliseconds(self.snapshot_interval_ms)
    }

    pub fn context_window_overlap(&self) -> Duration {
        Duration::milliseconds(self.context_window_overlap_ms)
    }

    pub fn maintenance_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.maintenance_interval_ms)
    }
}
