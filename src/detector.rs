//! Threshold anomaly detection
//!
//! Compares one day's sample against the user's baseline:
//! - metrics with variance use a z-score test (`|z| > threshold`)
//! - metrics without observed variance use an absolute tolerance around the mean
//! - the direction of a deviation selects its category and message

use crate::config::{
    DetectionConfig, DEFAULT_ZERO_VARIANCE_TOLERANCE, MIN_BASELINE_DAYS, THRESHOLD_STD_DEV,
};
use crate::error::EngineError;
use crate::severity::classify;
use crate::types::{
    Anomaly, AnomalyCategory, Direction, MetricSample, MetricType, Severity, UserBaseline,
};
use chrono::{DateTime, Utc};

/// Rule-based detector used directly or as the ML fallback
#[derive(Debug, Clone, Copy)]
pub struct ThresholdAnomalyDetector {
    threshold_std_dev: f64,
    zero_variance_tolerance: f64,
    min_baseline_days: u32,
}

impl Default for ThresholdAnomalyDetector {
    fn default() -> Self {
        Self {
            threshold_std_dev: THRESHOLD_STD_DEV,
            zero_variance_tolerance: DEFAULT_ZERO_VARIANCE_TOLERANCE,
            min_baseline_days: MIN_BASELINE_DAYS,
        }
    }
}

/// A deviation found for one metric, before it becomes an `Anomaly`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Deviation {
    expected_min: f64,
    expected_max: f64,
    severity: Severity,
    category: AnomalyCategory,
}

impl ThresholdAnomalyDetector {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            threshold_std_dev: config.threshold_std_dev,
            zero_variance_tolerance: config.zero_variance_tolerance,
            min_baseline_days: config.min_baseline_days.max(MIN_BASELINE_DAYS),
        }
    }

    /// Detect anomalies, stamping them with the current time
    pub fn detect(
        &self,
        sample: &MetricSample,
        baseline: &UserBaseline,
    ) -> Result<Vec<Anomaly>, EngineError> {
        self.detect_at(sample, baseline, Utc::now())
    }

    /// Detect anomalies in `sample` relative to `baseline`.
    ///
    /// Returns at most one anomaly per metric, in `MetricType::ALL` order.
    /// Identical inputs always produce identical output.
    pub fn detect_at(
        &self,
        sample: &MetricSample,
        baseline: &UserBaseline,
        detected_at: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>, EngineError> {
        if !baseline.is_valid(self.min_baseline_days) {
            return Err(EngineError::PreconditionViolation(format!(
                "baseline for {} has {} samples, need {}",
                baseline.user_id, baseline.sample_count, self.min_baseline_days
            )));
        }
        if baseline.user_id != sample.user_id {
            return Err(EngineError::PreconditionViolation(format!(
                "sample for {} checked against baseline of {}",
                sample.user_id, baseline.user_id
            )));
        }

        let mut anomalies = Vec::new();

        for metric in MetricType::ALL {
            let Some(actual) = sample.value(metric) else {
                continue;
            };
            let Some((mean, std_dev)) = baseline.stats(metric) else {
                continue;
            };

            let Some(deviation) = self.evaluate(metric, actual, mean, std_dev) else {
                continue;
            };

            let anomaly = Anomaly {
                id: Anomaly::key_id(&sample.user_id, sample.date, metric),
                user_id: sample.user_id.clone(),
                date: sample.date,
                metric_type: metric,
                detected_at,
                actual_value: actual,
                expected_min: deviation.expected_min,
                expected_max: deviation.expected_max,
                severity: deviation.severity,
                category: deviation.category,
                message: describe(
                    metric,
                    actual,
                    deviation.expected_min,
                    deviation.expected_max,
                    deviation.category,
                ),
                acknowledged: false,
            };

            if anomaly.is_well_formed() {
                anomalies.push(anomaly);
            }
        }

        Ok(anomalies)
    }

    fn evaluate(&self, metric: MetricType, actual: f64, mean: f64, std_dev: f64) -> Option<Deviation> {
        let category = category_for(metric, Direction::of(actual, mean));

        if std_dev < f64::EPSILON {
            let tolerance = (self.zero_variance_tolerance * mean.abs()).max(metric.absolute_tolerance());
            if (actual - mean).abs() <= tolerance {
                return None;
            }
            return Some(Deviation {
                expected_min: mean,
                expected_max: mean,
                severity: if category.is_favourable() {
                    Severity::Info
                } else {
                    Severity::Warning
                },
                category,
            });
        }

        let z_score = (actual - mean) / std_dev;
        if z_score.abs() <= self.threshold_std_dev {
            return None;
        }

        let severity = if category.is_favourable() {
            Severity::Info
        } else {
            classify(z_score)
        };

        Some(Deviation {
            expected_min: mean - self.threshold_std_dev * std_dev,
            expected_max: mean + self.threshold_std_dev * std_dev,
            severity,
            category,
        })
    }
}

/// Category for a deviation of `metric` in `direction`
pub fn category_for(metric: MetricType, direction: Direction) -> AnomalyCategory {
    use AnomalyCategory::*;

    match (metric, direction) {
        (MetricType::Steps, Direction::Below) => LowActivity,
        (MetricType::Steps, Direction::Above) => HighActivity,
        (MetricType::Distance, Direction::Below) => ReducedMovement,
        (MetricType::Distance, Direction::Above) => IncreasedMovement,
        (MetricType::Calories, Direction::Below) => LowEnergyExpenditure,
        (MetricType::Calories, Direction::Above) => HighEnergyExpenditure,
        (MetricType::ScreenTime, Direction::Above) => ExcessiveScreenTime,
        (MetricType::ScreenTime, Direction::Below) => ReducedScreenTime,
        (MetricType::Sleep, Direction::Below) => SleepDeficit,
        (MetricType::Sleep, Direction::Above) => Oversleeping,
        (MetricType::HeartRate, Direction::Above) => ElevatedHeartRate,
        (MetricType::HeartRate, Direction::Below) => LowHeartRate,
        (MetricType::Hrv, Direction::Below) => ReducedHrv,
        (MetricType::Hrv, Direction::Above) => ElevatedHrv,
        (MetricType::Mood, Direction::Below) => LowMood,
        (MetricType::Mood, Direction::Above) => ElevatedMood,
    }
}

/// Human-readable description of an anomaly
pub fn describe(
    metric: MetricType,
    actual: f64,
    expected_min: f64,
    expected_max: f64,
    category: AnomalyCategory,
) -> String {
    let unit = metric.unit();
    let relation = if actual < expected_min { "below" } else { "above" };

    if expected_min == expected_max {
        format!(
            "{} of {} {} is {} your steady {} {} ({})",
            metric.label(),
            format_value(metric, actual),
            unit,
            relation,
            format_value(metric, expected_min),
            unit,
            category.as_str()
        )
    } else {
        format!(
            "{} of {} {} is {} your usual range of {}-{} {} ({})",
            metric.label(),
            format_value(metric, actual),
            unit,
            relation,
            format_value(metric, expected_min),
            format_value(metric, expected_max),
            unit,
            category.as_str()
        )
    }
}

fn format_value(metric: MetricType, value: f64) -> String {
    match metric {
        MetricType::HeartRate | MetricType::Hrv | MetricType::Mood => format!("{:.1}", value),
        _ => format!("{:.0}", value),
    }
}
