//! Detection configuration
//!
//! All thresholds used by the engine live here so that a deployment can tune
//! them from a single JSON document.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum number of daily samples before a baseline may be used
pub const MIN_BASELINE_DAYS: u32 = 7;

/// Recommended rolling window for baseline computation (days)
pub const DEFAULT_BASELINE_WINDOW_DAYS: u32 = 30;

/// Standard deviations beyond which a value is anomalous
pub const THRESHOLD_STD_DEV: f64 = 2.0;

/// Relative tolerance for metrics whose baseline shows no variance
pub const DEFAULT_ZERO_VARIANCE_TOLERANCE: f64 = 0.01;

/// ML results below this confidence fall back to threshold detection
pub const DEFAULT_ML_MIN_CONFIDENCE: f64 = 0.7;

/// Default bound on the ML signal call
pub const DEFAULT_ML_TIMEOUT_MS: u64 = 2_000;

/// Stored baselines older than this are recomputed (nightly)
pub const DEFAULT_BASELINE_MAX_AGE_HOURS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_baseline_days: u32,
    pub baseline_window_days: u32,
    pub threshold_std_dev: f64,
    pub zero_variance_tolerance: f64,
    pub ml_min_confidence: f64,
    pub ml_timeout_ms: u64,
    pub baseline_max_age_hours: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_baseline_days: MIN_BASELINE_DAYS,
            baseline_window_days: DEFAULT_BASELINE_WINDOW_DAYS,
            threshold_std_dev: THRESHOLD_STD_DEV,
            zero_variance_tolerance: DEFAULT_ZERO_VARIANCE_TOLERANCE,
            ml_min_confidence: DEFAULT_ML_MIN_CONFIDENCE,
            ml_timeout_ms: DEFAULT_ML_TIMEOUT_MS,
            baseline_max_age_hours: DEFAULT_BASELINE_MAX_AGE_HOURS,
        }
    }
}

impl DetectionConfig {
    pub fn ml_timeout(&self) -> Duration {
        Duration::from_millis(self.ml_timeout_ms)
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.min_baseline_days < MIN_BASELINE_DAYS {
            return Err(EngineError::InvalidConfig(format!(
                "min_baseline_days must be at least {}, got {}",
                MIN_BASELINE_DAYS, self.min_baseline_days
            )));
        }
        if self.baseline_window_days < self.min_baseline_days {
            return Err(EngineError::InvalidConfig(format!(
                "baseline_window_days ({}) is smaller than min_baseline_days ({})",
                self.baseline_window_days, self.min_baseline_days
            )));
        }
        if !(self.threshold_std_dev.is_finite() && self.threshold_std_dev > 0.0) {
            return Err(EngineError::InvalidConfig(
                "threshold_std_dev must be positive".to_string(),
            ));
        }
        if !(self.zero_variance_tolerance.is_finite() && self.zero_variance_tolerance >= 0.0) {
            return Err(EngineError::InvalidConfig(
                "zero_variance_tolerance must be non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ml_min_confidence) {
            return Err(EngineError::InvalidConfig(
                "ml_min_confidence must be within 0-1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from JSON; missing keys take their defaults
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DetectionConfig::default();
        assert_eq!(config.min_baseline_days, 7);
        assert_eq!(config.baseline_window_days, 30);
        assert_eq!(config.threshold_std_dev, 2.0);
        assert_eq!(config.ml_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = DetectionConfig::from_json(r#"{"baseline_window_days": 14}"#).unwrap();
        assert_eq!(config.baseline_window_days, 14);
        assert_eq!(config.min_baseline_days, 7);
        assert_eq!(config.ml_min_confidence, 0.7);
    }

    #[test]
    fn test_rejects_window_smaller_than_minimum() {
        let result = DetectionConfig::from_json(r#"{"baseline_window_days": 3}"#);
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_minimum_below_seven_days() {
        let result = DetectionConfig::from_json(r#"{"min_baseline_days": 3}"#);
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));

        let config = DetectionConfig {
            min_baseline_days: 14,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_confidence_out_of_range() {
        let config = DetectionConfig {
            ml_min_confidence: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
