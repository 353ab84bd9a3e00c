//! Baseline computation
//!
//! This module derives a per-user baseline (mean and population standard
//! deviation per metric) from a window of historical daily samples.
//! Baselines enable relative interpretation of each new day.

use crate::config::{DetectionConfig, MIN_BASELINE_DAYS};
use crate::error::EngineError;
use crate::types::{MetricSample, MetricType, UserBaseline};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Result of a baseline computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BaselineOutcome {
    /// Enough history; the baseline may be used for detection
    Ready(UserBaseline),
    /// Not enough history yet; keep collecting
    InsufficientData { available: usize, required: u32 },
}

impl BaselineOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, BaselineOutcome::Ready(_))
    }

    /// The baseline, if one could be computed
    pub fn into_baseline(self) -> Option<UserBaseline> {
        match self {
            BaselineOutcome::Ready(baseline) => Some(baseline),
            BaselineOutcome::InsufficientData { .. } => None,
        }
    }
}

/// Computes baselines from historical samples
#[derive(Debug, Clone, Copy)]
pub struct BaselineCalculator {
    min_baseline_days: u32,
}

impl Default for BaselineCalculator {
    fn default() -> Self {
        Self::new(MIN_BASELINE_DAYS)
    }
}

impl BaselineCalculator {
    /// Create a calculator requiring at least `min_baseline_days` samples
    /// (never fewer than `MIN_BASELINE_DAYS`)
    pub fn new(min_baseline_days: u32) -> Self {
        Self {
            min_baseline_days: min_baseline_days.max(MIN_BASELINE_DAYS),
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.min_baseline_days)
    }

    /// Compute a baseline stamped with the current time
    pub fn compute(&self, samples: &[MetricSample]) -> Result<BaselineOutcome, EngineError> {
        self.compute_at(samples, Utc::now())
    }

    /// Compute a baseline from `samples`, stamping it with `calculated_at`.
    ///
    /// All samples must belong to the same user. Fewer than
    /// `min_baseline_days` samples yields `InsufficientData`.
    pub fn compute_at(
        &self,
        samples: &[MetricSample],
        calculated_at: DateTime<Utc>,
    ) -> Result<BaselineOutcome, EngineError> {
        let Some(first) = samples.first() else {
            return Ok(self.insufficient(0));
        };
        let user_id = first.user_id.as_str();

        if let Some(other) = samples.iter().find(|s| s.user_id != user_id) {
            return Err(EngineError::PreconditionViolation(format!(
                "baseline window mixes users {} and {}",
                user_id, other.user_id
            )));
        }

        if samples.len() < self.min_baseline_days as usize {
            debug!(
                user_id = %user_id,
                available = samples.len(),
                required = self.min_baseline_days,
                "Insufficient history for baseline"
            );
            return Ok(self.insufficient(samples.len()));
        }

        let mut per_metric_mean = BTreeMap::new();
        let mut per_metric_std_dev = BTreeMap::new();
        let mut per_metric_count = BTreeMap::new();

        for metric in MetricType::ALL {
            let values: Vec<f64> = samples.iter().filter_map(|s| s.value(metric)).collect();

            // Sparse metrics (e.g. a heart rate monitor worn twice a month)
            // are left out rather than modelled from a handful of days
            if values.len() < self.min_baseline_days as usize {
                continue;
            }

            if let Some((mean, std_dev)) = mean_and_std_dev(&values) {
                per_metric_mean.insert(metric, mean);
                per_metric_std_dev.insert(metric, std_dev);
                per_metric_count.insert(metric, values.len() as u32);
            }
        }

        debug!(
            user_id = %user_id,
            samples = samples.len(),
            metrics = per_metric_mean.len(),
            "Baseline computed"
        );

        Ok(BaselineOutcome::Ready(UserBaseline {
            user_id: user_id.to_string(),
            per_metric_mean,
            per_metric_std_dev,
            per_metric_count,
            sample_count: samples.len() as u32,
            window_end: samples.iter().map(|s| s.date).max(),
            calculated_at,
        }))
    }

    fn insufficient(&self, available: usize) -> BaselineOutcome {
        BaselineOutcome::InsufficientData {
            available,
            required: self.min_baseline_days,
        }
    }
}

/// Arithmetic mean and population standard deviation.
///
/// Identical values give exactly `(value, 0.0)` so that the zero-variance
/// rule in the detector is not defeated by rounding noise.
fn mean_and_std_dev(values: &[f64]) -> Option<(f64, f64)> {
    let first = *values.first()?;
    if values.iter().all(|v| *v == first) {
        return Some((first, 0.0));
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn make_sample(day: u32, steps: u32) -> MetricSample {
        MetricSample {
            user_id: "user-1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            steps,
            distance_meters: steps as f64 * 0.75,
            calories_burned: 2100.0,
            screen_time_minutes: 180,
            sleep_duration_minutes: 420,
            average_heart_rate: 62.0,
            average_hrv: 55.0,
            mood_score: Some(7),
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 3, 0, 0).unwrap()
    }

    #[test]
    fn test_fewer_than_minimum_is_insufficient() {
        let calculator = BaselineCalculator::default();

        for n in 0..7u32 {
            let samples: Vec<_> = (1..=n).map(|d| make_sample(d, 6000)).collect();
            let outcome = calculator.compute_at(&samples, fixed_time()).unwrap();
            assert_eq!(
                outcome,
                BaselineOutcome::InsufficientData {
                    available: n as usize,
                    required: 7
                }
            );
        }
    }

    #[test]
    fn test_minimum_cannot_go_below_seven_days() {
        let calculator = BaselineCalculator::new(3);
        let samples: Vec<_> = (1..=3).map(|d| make_sample(d, 6000)).collect();

        let outcome = calculator.compute_at(&samples, fixed_time()).unwrap();
        assert_eq!(
            outcome,
            BaselineOutcome::InsufficientData {
                available: 3,
                required: 7
            }
        );
    }

    #[test]
    fn test_window_end_is_latest_sample_date() {
        let samples: Vec<_> = [4, 2, 9, 1, 3, 5, 6]
            .into_iter()
            .map(|d| make_sample(d, 6000))
            .collect();
        let baseline = BaselineCalculator::default()
            .compute_at(&samples, fixed_time())
            .unwrap()
            .into_baseline()
            .unwrap();

        assert_eq!(baseline.window_end, NaiveDate::from_ymd_opt(2024, 1, 9));
        assert!(baseline.precedes(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()));
        assert!(!baseline.precedes(NaiveDate::from_ymd_opt(2024, 1, 9).unwrap()));
    }

    #[test]
    fn test_constant_values_have_zero_std_dev() {
        let samples: Vec<_> = (1..=7).map(|d| make_sample(d, 6000)).collect();
        let baseline = BaselineCalculator::default()
            .compute_at(&samples, fixed_time())
            .unwrap()
            .into_baseline()
            .unwrap();

        assert_eq!(baseline.sample_count, 7);
        assert_eq!(baseline.stats(MetricType::Steps), Some((6000.0, 0.0)));
        assert_eq!(baseline.stats(MetricType::Sleep), Some((420.0, 0.0)));
        assert_eq!(baseline.stats(MetricType::Distance), Some((4500.0, 0.0)));
        assert_eq!(baseline.calculated_at, fixed_time());
    }

    #[test]
    fn test_mean_and_population_std_dev() {
        let steps = [2000, 4000, 4000, 4000, 5000, 5000, 7000, 9000];
        let samples: Vec<_> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| make_sample(i as u32 + 1, *s))
            .collect();

        let baseline = BaselineCalculator::default()
            .compute_at(&samples, fixed_time())
            .unwrap()
            .into_baseline()
            .unwrap();

        let (mean, std_dev) = baseline.stats(MetricType::Steps).unwrap();
        assert!((mean - 5000.0).abs() < 1e-9);
        assert!((std_dev - 2000.0).abs() < 1e-9);
        assert_eq!(baseline.per_metric_count[&MetricType::Steps], 8);
    }

    #[test]
    fn test_unrecorded_heart_rate_excluded() {
        let mut samples: Vec<_> = (1..=10).map(|d| make_sample(d, 6000)).collect();
        samples[0].average_heart_rate = 0.0;
        samples[1].average_heart_rate = 0.0;
        samples[2].average_heart_rate = 80.0;

        let baseline = BaselineCalculator::default()
            .compute_at(&samples, fixed_time())
            .unwrap()
            .into_baseline()
            .unwrap();

        // 7 days at 62 and one at 80; the two missing days are not zeros
        let expected_mean = (7.0 * 62.0 + 80.0) / 8.0;
        let (mean, _) = baseline.stats(MetricType::HeartRate).unwrap();
        assert!((mean - expected_mean).abs() < 1e-9);
        assert_eq!(baseline.per_metric_count[&MetricType::HeartRate], 8);
    }

    #[test]
    fn test_sparse_metric_is_absent() {
        let mut samples: Vec<_> = (1..=10).map(|d| make_sample(d, 6000)).collect();
        for sample in samples.iter_mut().skip(3) {
            sample.average_hrv = 0.0;
            sample.mood_score = None;
        }

        let baseline = BaselineCalculator::default()
            .compute_at(&samples, fixed_time())
            .unwrap()
            .into_baseline()
            .unwrap();

        assert!(baseline.stats(MetricType::Hrv).is_none());
        assert!(baseline.stats(MetricType::Mood).is_none());
        assert!(baseline.stats(MetricType::Steps).is_some());
    }

    #[test]
    fn test_zero_steps_are_real_values() {
        let mut samples: Vec<_> = (1..=7).map(|d| make_sample(d, 7000)).collect();
        samples[6].steps = 0;

        let baseline = BaselineCalculator::default()
            .compute_at(&samples, fixed_time())
            .unwrap()
            .into_baseline()
            .unwrap();

        let (mean, _) = baseline.stats(MetricType::Steps).unwrap();
        assert!((mean - 6000.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_users_rejected() {
        let mut samples: Vec<_> = (1..=7).map(|d| make_sample(d, 6000)).collect();
        samples[3].user_id = "user-2".to_string();

        let result = BaselineCalculator::default().compute_at(&samples, fixed_time());
        assert!(matches!(result, Err(EngineError::PreconditionViolation(_))));
    }

    #[test]
    fn test_baseline_serialization() {
        let steps = [2000, 4000, 4000, 4000, 5000, 5000, 7000, 9000];
        let samples: Vec<_> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| make_sample(i as u32 + 1, *s))
            .collect();
        let baseline = BaselineCalculator::default()
            .compute_at(&samples, fixed_time())
            .unwrap()
            .into_baseline()
            .unwrap();

        let json = baseline.to_json().unwrap();
        assert!(json.contains("\"STEPS\""));

        let loaded = UserBaseline::from_json(&json).unwrap();
        assert_eq!(loaded, baseline);
    }
}
