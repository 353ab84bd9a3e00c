//! Core types for the Synheart Sentinel engine
//!
//! This module defines the data structures that flow through detection:
//! daily metric samples, per-user baselines, anomaly records, and the
//! transient outcome of a detection run.

use crate::config::MIN_BASELINE_DAYS;
use crate::error::ValidationError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Maximum minutes of sleep that fit in a calendar day
pub const MINUTES_PER_DAY: u32 = 1440;

/// Metric types tracked per day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    Steps,
    Distance,
    Calories,
    ScreenTime,
    Sleep,
    HeartRate,
    Hrv,
    Mood,
}

impl MetricType {
    /// Every metric, in detection order
    pub const ALL: [MetricType; 8] = [
        MetricType::Steps,
        MetricType::Distance,
        MetricType::Calories,
        MetricType::ScreenTime,
        MetricType::Sleep,
        MetricType::HeartRate,
        MetricType::Hrv,
        MetricType::Mood,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Steps => "STEPS",
            MetricType::Distance => "DISTANCE",
            MetricType::Calories => "CALORIES",
            MetricType::ScreenTime => "SCREEN_TIME",
            MetricType::Sleep => "SLEEP",
            MetricType::HeartRate => "HEART_RATE",
            MetricType::Hrv => "HRV",
            MetricType::Mood => "MOOD",
        }
    }

    /// Human-readable label used in anomaly messages
    pub fn label(&self) -> &'static str {
        match self {
            MetricType::Steps => "Steps",
            MetricType::Distance => "Distance",
            MetricType::Calories => "Calories burned",
            MetricType::ScreenTime => "Screen time",
            MetricType::Sleep => "Sleep duration",
            MetricType::HeartRate => "Average heart rate",
            MetricType::Hrv => "Heart rate variability",
            MetricType::Mood => "Mood score",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricType::Steps => "steps",
            MetricType::Distance => "m",
            MetricType::Calories => "kcal",
            MetricType::ScreenTime | MetricType::Sleep => "min",
            MetricType::HeartRate => "bpm",
            MetricType::Hrv => "ms",
            MetricType::Mood => "pts",
        }
    }

    /// Smallest absolute change that counts as a deviation when the baseline
    /// has observed no variance for this metric
    pub fn absolute_tolerance(&self) -> f64 {
        match self {
            MetricType::Steps => 10.0,
            MetricType::Distance => 10.0,
            MetricType::Calories => 10.0,
            MetricType::ScreenTime => 5.0,
            MetricType::Sleep => 5.0,
            MetricType::HeartRate => 1.0,
            MetricType::Hrv => 1.0,
            MetricType::Mood => 1.0,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal severity of a deviation (INFO < WARNING < ALERT)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Alert,
}

/// Which side of the expected range a value fell on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    pub fn of(actual: f64, mean: f64) -> Self {
        if actual >= mean {
            Direction::Above
        } else {
            Direction::Below
        }
    }
}

/// Direction-aware category attached to every anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCategory {
    LowActivity,
    HighActivity,
    ReducedMovement,
    IncreasedMovement,
    LowEnergyExpenditure,
    HighEnergyExpenditure,
    ExcessiveScreenTime,
    ReducedScreenTime,
    SleepDeficit,
    Oversleeping,
    ElevatedHeartRate,
    LowHeartRate,
    ReducedHrv,
    ElevatedHrv,
    LowMood,
    ElevatedMood,
}

impl AnomalyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyCategory::LowActivity => "low activity",
            AnomalyCategory::HighActivity => "unusually high activity",
            AnomalyCategory::ReducedMovement => "reduced movement",
            AnomalyCategory::IncreasedMovement => "increased movement",
            AnomalyCategory::LowEnergyExpenditure => "low energy expenditure",
            AnomalyCategory::HighEnergyExpenditure => "high energy expenditure",
            AnomalyCategory::ExcessiveScreenTime => "excessive screen use",
            AnomalyCategory::ReducedScreenTime => "reduced screen use",
            AnomalyCategory::SleepDeficit => "sleep deficit",
            AnomalyCategory::Oversleeping => "oversleeping",
            AnomalyCategory::ElevatedHeartRate => "elevated heart rate",
            AnomalyCategory::LowHeartRate => "low heart rate",
            AnomalyCategory::ReducedHrv => "reduced heart rate variability",
            AnomalyCategory::ElevatedHrv => "elevated heart rate variability",
            AnomalyCategory::LowMood => "low mood",
            AnomalyCategory::ElevatedMood => "elevated mood",
        }
    }

    /// Whether a deviation in this category is a change for the better
    pub fn is_favourable(&self) -> bool {
        matches!(
            self,
            AnomalyCategory::HighActivity
                | AnomalyCategory::IncreasedMovement
                | AnomalyCategory::ReducedScreenTime
                | AnomalyCategory::ElevatedHrv
                | AnomalyCategory::ElevatedMood
        )
    }
}

/// One day of measurements for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub user_id: String,
    /// Calendar date this sample represents
    pub date: NaiveDate,
    pub steps: u32,
    #[serde(default)]
    pub distance_meters: f64,
    #[serde(default)]
    pub calories_burned: f64,
    pub screen_time_minutes: u32,
    pub sleep_duration_minutes: u32,
    /// Average heart rate (bpm), 0 when unavailable
    #[serde(default)]
    pub average_heart_rate: f64,
    /// Average HRV (ms), 0 when unavailable
    #[serde(default)]
    pub average_hrv: f64,
    /// Self-reported mood (1-10)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood_score: Option<u8>,
}

impl MetricSample {
    /// Create a sample with every optional measurement unset
    pub fn new(user_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            date,
            steps: 0,
            distance_meters: 0.0,
            calories_burned: 0.0,
            screen_time_minutes: 0,
            sleep_duration_minutes: 0,
            average_heart_rate: 0.0,
            average_hrv: 0.0,
            mood_score: None,
        }
    }

    /// Value of a metric for this day, or `None` when it was not recorded.
    ///
    /// Heart rate and HRV use 0 as "not recorded"; steps, sleep, screen time,
    /// distance and calories zeros are real measurements.
    pub fn value(&self, metric: MetricType) -> Option<f64> {
        match metric {
            MetricType::Steps => Some(self.steps as f64),
            MetricType::Distance => Some(self.distance_meters),
            MetricType::Calories => Some(self.calories_burned),
            MetricType::ScreenTime => Some(self.screen_time_minutes as f64),
            MetricType::Sleep => Some(self.sleep_duration_minutes as f64),
            MetricType::HeartRate => recorded(self.average_heart_rate),
            MetricType::Hrv => recorded(self.average_hrv),
            MetricType::Mood => self.mood_score.map(f64::from),
        }
    }

    /// Check field ranges
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingUserId);
        }

        for (field, value) in [
            ("distance_meters", self.distance_meters),
            ("calories_burned", self.calories_burned),
            ("average_heart_rate", self.average_heart_rate),
            ("average_hrv", self.average_hrv),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::NegativeOrNonFinite { field, value });
            }
        }

        if self.sleep_duration_minutes > MINUTES_PER_DAY {
            return Err(ValidationError::SleepOutOfRange(self.sleep_duration_minutes));
        }

        if let Some(mood) = self.mood_score {
            if !(1..=10).contains(&mood) {
                return Err(ValidationError::MoodOutOfRange(mood));
            }
        }

        Ok(())
    }
}

fn recorded(value: f64) -> Option<f64> {
    if value > 0.0 {
        Some(value)
    } else {
        None
    }
}

/// Per-user statistical reference computed from a window of samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBaseline {
    pub user_id: String,
    pub per_metric_mean: BTreeMap<MetricType, f64>,
    pub per_metric_std_dev: BTreeMap<MetricType, f64>,
    /// Number of recorded values behind each metric's statistics
    #[serde(default)]
    pub per_metric_count: BTreeMap<MetricType, u32>,
    /// Number of daily samples in the window
    pub sample_count: u32,
    /// Date of the latest sample in the window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end: Option<NaiveDate>,
    pub calculated_at: DateTime<Utc>,
}

impl UserBaseline {
    /// Whether enough days back this baseline for it to be used in detection.
    ///
    /// The requirement never drops below `MIN_BASELINE_DAYS`.
    pub fn is_valid(&self, min_baseline_days: u32) -> bool {
        self.sample_count >= min_baseline_days.max(MIN_BASELINE_DAYS)
    }

    /// Whether every sample behind this baseline is dated before `date`.
    ///
    /// A baseline with an unknown window is never assumed to precede a day.
    pub fn precedes(&self, date: NaiveDate) -> bool {
        self.window_end.is_some_and(|end| end < date)
    }

    /// Mean and standard deviation for a metric, if both are known
    pub fn stats(&self, metric: MetricType) -> Option<(f64, f64)> {
        let mean = self.per_metric_mean.get(&metric)?;
        let std_dev = self.per_metric_std_dev.get(&metric)?;
        Some((*mean, *std_dev))
    }

    /// Load a baseline from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the baseline to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A single metric value on a single day outside the user's expected range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub user_id: String,
    /// Calendar date of the sample that produced this anomaly
    pub date: NaiveDate,
    pub metric_type: MetricType,
    pub detected_at: DateTime<Utc>,
    pub actual_value: f64,
    pub expected_min: f64,
    pub expected_max: f64,
    pub severity: Severity,
    pub category: AnomalyCategory,
    pub message: String,
    #[serde(default)]
    pub acknowledged: bool,
}

impl Anomaly {
    /// Stable id for the anomaly of `metric` on `date` for `user_id`.
    ///
    /// Re-running detection for the same day yields the same ids, so a
    /// metric can only ever produce one record per user and date.
    pub fn key_id(user_id: &str, date: NaiveDate, metric: MetricType) -> Uuid {
        let key = format!("sentinel:{}:{}:{}", user_id, date, metric.as_str());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }

    /// Whether `actual_value` lies strictly outside a well-formed range
    pub fn is_well_formed(&self) -> bool {
        self.expected_min <= self.expected_max
            && (self.actual_value < self.expected_min || self.actual_value > self.expected_max)
    }
}

/// Result of one detection run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub anomalies: Vec<Anomaly>,
    pub used_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_unrecorded_heart_metrics_are_absent() {
        let sample = MetricSample::new("user-1", date(1));

        assert_eq!(sample.value(MetricType::Steps), Some(0.0));
        assert_eq!(sample.value(MetricType::Sleep), Some(0.0));
        assert_eq!(sample.value(MetricType::HeartRate), None);
        assert_eq!(sample.value(MetricType::Hrv), None);
        assert_eq!(sample.value(MetricType::Mood), None);
    }

    #[test]
    fn test_validate_rejects_out_of_range_fields() {
        let mut sample = MetricSample::new("user-1", date(1));
        sample.sleep_duration_minutes = 1500;
        assert_eq!(sample.validate(), Err(ValidationError::SleepOutOfRange(1500)));

        sample.sleep_duration_minutes = 480;
        sample.mood_score = Some(11);
        assert_eq!(sample.validate(), Err(ValidationError::MoodOutOfRange(11)));

        sample.mood_score = Some(7);
        sample.distance_meters = f64::NAN;
        assert!(matches!(
            sample.validate(),
            Err(ValidationError::NegativeOrNonFinite { field: "distance_meters", .. })
        ));

        sample.distance_meters = 1200.0;
        assert!(sample.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_user_id() {
        let sample = MetricSample::new("  ", date(1));
        assert_eq!(sample.validate(), Err(ValidationError::MissingUserId));
    }

    #[test]
    fn test_key_id_is_stable_per_user_date_metric() {
        let a = Anomaly::key_id("user-1", date(1), MetricType::Steps);
        let b = Anomaly::key_id("user-1", date(1), MetricType::Steps);
        let c = Anomaly::key_id("user-1", date(1), MetricType::Sleep);
        let d = Anomaly::key_id("user-1", date(2), MetricType::Steps);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_sample_deserializes_with_defaults() {
        let json = r#"{
            "user_id": "user-1",
            "date": "2024-03-01",
            "steps": 8500,
            "screen_time_minutes": 180,
            "sleep_duration_minutes": 430
        }"#;

        let sample: MetricSample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.steps, 8500);
        assert_eq!(sample.average_heart_rate, 0.0);
        assert_eq!(sample.mood_score, None);
    }

    #[test]
    fn test_metric_type_serializes_screaming_case() {
        let json = serde_json::to_string(&MetricType::ScreenTime).unwrap();
        assert_eq!(json, "\"SCREEN_TIME\"");
        assert!(Severity::Info < Severity::Warning && Severity::Warning < Severity::Alert);
    }
}
