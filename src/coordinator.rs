//! Detection coordination
//!
//! Runs one detection for one user-day:
//! 1. Refuse to detect without a valid baseline (`no_baseline`)
//! 2. Use a confident ML result as-is
//! 3. Otherwise fall back to the threshold detector and record why
//!
//! Nothing from the ML path is ever propagated to the caller.

use crate::config::{DetectionConfig, DEFAULT_ML_MIN_CONFIDENCE, MIN_BASELINE_DAYS};
use crate::detector::{category_for, describe, ThresholdAnomalyDetector};
use crate::error::EngineError;
use crate::ml::{MlCandidate, MlDetection, MlError, MlSignal, MlSignalProvider};
use crate::types::{Anomaly, DetectionOutcome, Direction, MetricSample, UserBaseline};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Why the threshold path was used (or nothing was detected)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    NoBaseline,
    MlUnavailable,
    MlError(String),
    MlLowConfidence,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoBaseline => f.write_str("no_baseline"),
            FallbackReason::MlUnavailable => f.write_str("ml_unavailable"),
            FallbackReason::MlError(details) => write!(f, "ml_error: {}", details),
            FallbackReason::MlLowConfidence => f.write_str("ml_low_confidence"),
        }
    }
}

/// Chooses between the ML signal and threshold detection
#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetectionCoordinator {
    detector: ThresholdAnomalyDetector,
    min_baseline_days: u32,
    ml_min_confidence: f64,
}

impl Default for AnomalyDetectionCoordinator {
    fn default() -> Self {
        Self {
            detector: ThresholdAnomalyDetector::default(),
            min_baseline_days: MIN_BASELINE_DAYS,
            ml_min_confidence: DEFAULT_ML_MIN_CONFIDENCE,
        }
    }
}

impl AnomalyDetectionCoordinator {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            detector: ThresholdAnomalyDetector::from_config(config),
            min_baseline_days: config.min_baseline_days.max(MIN_BASELINE_DAYS),
            ml_min_confidence: config.ml_min_confidence,
        }
    }

    /// Run detection, stamping anomalies with the current time
    pub fn run(
        &self,
        sample: &MetricSample,
        baseline: Option<&UserBaseline>,
        ml_signal: Option<MlSignal>,
    ) -> Result<DetectionOutcome, EngineError> {
        self.run_at(sample, baseline, ml_signal, Utc::now())
    }

    /// Run detection for `sample`.
    ///
    /// The only error is a caller bug (sample and baseline belong to
    /// different users); ML problems always end in the fallback path.
    pub fn run_at(
        &self,
        sample: &MetricSample,
        baseline: Option<&UserBaseline>,
        ml_signal: Option<MlSignal>,
        detected_at: DateTime<Utc>,
    ) -> Result<DetectionOutcome, EngineError> {
        let Some(baseline) = baseline.filter(|b| b.is_valid(self.min_baseline_days)) else {
            debug!(user_id = %sample.user_id, date = %sample.date, "No valid baseline, skipping detection");
            return Ok(fallback(Vec::new(), FallbackReason::NoBaseline));
        };

        if baseline.user_id != sample.user_id {
            return Err(EngineError::PreconditionViolation(format!(
                "sample for {} checked against baseline of {}",
                sample.user_id, baseline.user_id
            )));
        }

        let reason = match ml_signal {
            None => FallbackReason::MlUnavailable,
            Some(MlSignal::Failure(details)) => FallbackReason::MlError(details),
            Some(MlSignal::Success(detection)) if !self.is_confident(&detection) => {
                debug!(
                    user_id = %sample.user_id,
                    confidence = detection.confidence,
                    min_confidence = self.ml_min_confidence,
                    "ML confidence below threshold"
                );
                FallbackReason::MlLowConfidence
            }
            Some(MlSignal::Success(detection)) => {
                return Ok(DetectionOutcome {
                    anomalies: normalize_candidates(sample, detection.candidates, detected_at),
                    used_fallback: false,
                    fallback_reason: None,
                });
            }
        };

        match &reason {
            FallbackReason::MlError(details) => {
                warn!(user_id = %sample.user_id, error = %details, "ML signal failed, using threshold detection")
            }
            _ => debug!(user_id = %sample.user_id, reason = %reason, "Using threshold detection"),
        }

        let anomalies = self.detector.detect_at(sample, baseline, detected_at)?;
        Ok(fallback(anomalies, reason))
    }

    /// Ask `provider` for a signal (bounded by `timeout`), then run detection.
    ///
    /// The provider is not consulted when there is no valid baseline.
    pub async fn run_with_provider(
        &self,
        provider: Arc<dyn MlSignalProvider>,
        sample: &MetricSample,
        history: &[MetricSample],
        baseline: Option<&UserBaseline>,
        timeout: Duration,
    ) -> Result<DetectionOutcome, EngineError> {
        self.run_with_provider_at(provider, sample, history, baseline, timeout, Utc::now())
            .await
    }

    pub async fn run_with_provider_at(
        &self,
        provider: Arc<dyn MlSignalProvider>,
        sample: &MetricSample,
        history: &[MetricSample],
        baseline: Option<&UserBaseline>,
        timeout: Duration,
        detected_at: DateTime<Utc>,
    ) -> Result<DetectionOutcome, EngineError> {
        let has_baseline = baseline.is_some_and(|b| b.is_valid(self.min_baseline_days));
        if !has_baseline {
            return self.run_at(sample, baseline, None, detected_at);
        }

        let result = evaluate_bounded(provider, sample.clone(), history.to_vec(), timeout).await;
        self.run_at(sample, baseline, MlSignal::from_result(result), detected_at)
    }

    fn is_confident(&self, detection: &MlDetection) -> bool {
        detection.confidence.is_finite() && detection.confidence >= self.ml_min_confidence
    }
}

/// Call the provider on its own task so that a slow model is abandoned at
/// `timeout` and a panicking one is reported rather than unwinding here.
pub async fn evaluate_bounded(
    provider: Arc<dyn MlSignalProvider>,
    sample: MetricSample,
    history: Vec<MetricSample>,
    timeout: Duration,
) -> Result<MlDetection, MlError> {
    let mut handle = tokio::spawn(async move { provider.evaluate(&sample, &history).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) if join_error.is_panic() => {
            Err(MlError::Panicked(panic_message(join_error.into_panic())))
        }
        Ok(Err(join_error)) => Err(MlError::Failed(join_error.to_string())),
        Err(_) => {
            handle.abort();
            Err(MlError::Timeout(timeout))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn fallback(anomalies: Vec<Anomaly>, reason: FallbackReason) -> DetectionOutcome {
    DetectionOutcome {
        anomalies,
        used_fallback: true,
        fallback_reason: Some(reason.to_string()),
    }
}

/// Turn ML candidates into anomaly records for this sample.
///
/// Candidates keep the model's values and severity. Only the first well-formed
/// candidate per metric is kept.
fn normalize_candidates(
    sample: &MetricSample,
    candidates: Vec<MlCandidate>,
    detected_at: DateTime<Utc>,
) -> Vec<Anomaly> {
    let mut seen = BTreeSet::new();
    let mut anomalies = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let metric = candidate.metric_type;
        let midpoint = (candidate.expected_min + candidate.expected_max) / 2.0;
        let category = category_for(metric, Direction::of(candidate.actual_value, midpoint));
        let message = candidate.message.unwrap_or_else(|| {
            describe(
                metric,
                candidate.actual_value,
                candidate.expected_min,
                candidate.expected_max,
                category,
            )
        });

        let anomaly = Anomaly {
            id: Anomaly::key_id(&sample.user_id, sample.date, metric),
            user_id: sample.user_id.clone(),
            date: sample.date,
            metric_type: metric,
            detected_at,
            actual_value: candidate.actual_value,
            expected_min: candidate.expected_min,
            expected_max: candidate.expected_max,
            severity: candidate.severity,
            category,
            message,
            acknowledged: false,
        };

        if !anomaly.is_well_formed() {
            warn!(
                user_id = %sample.user_id,
                metric = %metric,
                actual = anomaly.actual_value,
                expected_min = anomaly.expected_min,
                expected_max = anomaly.expected_max,
                "Discarding ML candidate inside or with an inverted expected range"
            );
            continue;
        }
        if !seen.insert(metric) {
            debug!(user_id = %sample.user_id, metric = %metric, "Dropping duplicate ML candidate");
            continue;
        }

        anomalies.push(anomaly);
    }

    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{BaselineCalculator, BaselineOutcome};
    use crate::types::{AnomalyCategory, MetricType, Severity};
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn detected_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap()
    }

    fn make_baseline(sample_count: u32) -> UserBaseline {
        let mut per_metric_mean = BTreeMap::new();
        let mut per_metric_std_dev = BTreeMap::new();
        per_metric_mean.insert(MetricType::Steps, 6000.0);
        per_metric_std_dev.insert(MetricType::Steps, 1000.0);
        per_metric_mean.insert(MetricType::Sleep, 420.0);
        per_metric_std_dev.insert(MetricType::Sleep, 30.0);

        UserBaseline {
            user_id: "user-1".to_string(),
            per_metric_mean,
            per_metric_std_dev,
            per_metric_count: BTreeMap::new(),
            sample_count,
            window_end: None,
            calculated_at: detected_at(),
        }
    }

    fn make_sample() -> MetricSample {
        MetricSample {
            steps: 2000,
            sleep_duration_minutes: 300,
            ..MetricSample::new("user-1", NaiveDate::from_ymd_opt(2024, 2, 1).unwrap())
        }
    }

    fn candidate(metric: MetricType, actual: f64, min: f64, max: f64) -> MlCandidate {
        MlCandidate {
            metric_type: metric,
            actual_value: actual,
            expected_min: min,
            expected_max: max,
            severity: Severity::Warning,
            message: None,
        }
    }

    fn threshold_only(sample: &MetricSample, baseline: &UserBaseline) -> Vec<Anomaly> {
        ThresholdAnomalyDetector::default()
            .detect_at(sample, baseline, detected_at())
            .unwrap()
    }

    #[test]
    fn test_ml_failure_falls_back_to_threshold() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let baseline = make_baseline(30);
        let sample = make_sample();

        let outcome = coordinator
            .run_at(
                &sample,
                Some(&baseline),
                Some(MlSignal::Failure("model crashed".to_string())),
                detected_at(),
            )
            .unwrap();

        assert!(outcome.used_fallback);
        assert_eq!(outcome.fallback_reason.as_deref(), Some("ml_error: model crashed"));
        assert_eq!(outcome.anomalies, threshold_only(&sample, &baseline));
        assert_eq!(outcome.anomalies.len(), 2);
    }

    #[test]
    fn test_absent_ml_signal_falls_back() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let baseline = make_baseline(30);
        let sample = make_sample();

        let outcome = coordinator
            .run_at(&sample, Some(&baseline), None, detected_at())
            .unwrap();

        assert!(outcome.used_fallback);
        assert_eq!(outcome.fallback_reason.as_deref(), Some("ml_unavailable"));
        assert_eq!(outcome.anomalies, threshold_only(&sample, &baseline));
    }

    #[test]
    fn test_low_confidence_falls_back() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let baseline = make_baseline(30);
        let sample = make_sample();
        let signal = MlSignal::Success(MlDetection {
            candidates: vec![candidate(MetricType::Mood, 2.0, 5.0, 8.0)],
            confidence: 0.69,
            model_version: None,
        });

        let outcome = coordinator
            .run_at(&sample, Some(&baseline), Some(signal), detected_at())
            .unwrap();

        assert!(outcome.used_fallback);
        assert_eq!(outcome.fallback_reason.as_deref(), Some("ml_low_confidence"));
        assert_eq!(outcome.anomalies, threshold_only(&sample, &baseline));
    }

    #[test]
    fn test_confident_ml_result_used_as_is() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let baseline = make_baseline(30);
        let sample = make_sample();
        let signal = MlSignal::Success(MlDetection {
            candidates: vec![MlCandidate {
                message: Some("Resting trend shifted".to_string()),
                ..candidate(MetricType::HeartRate, 88.0, 55.0, 75.0)
            }],
            confidence: 0.91,
            model_version: Some("v3".to_string()),
        });

        let outcome = coordinator
            .run_at(&sample, Some(&baseline), Some(signal), detected_at())
            .unwrap();

        assert!(!outcome.used_fallback);
        assert_eq!(outcome.fallback_reason, None);
        assert_eq!(outcome.anomalies.len(), 1);

        let anomaly = &outcome.anomalies[0];
        assert_eq!(anomaly.metric_type, MetricType::HeartRate);
        assert_eq!(anomaly.severity, Severity::Warning);
        assert_eq!(anomaly.category, AnomalyCategory::ElevatedHeartRate);
        assert_eq!(anomaly.message, "Resting trend shifted");
        assert_eq!(anomaly.id, Anomaly::key_id("user-1", sample.date, MetricType::HeartRate));
    }

    #[test]
    fn test_ml_candidates_deduplicated_and_validated() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let baseline = make_baseline(30);
        let signal = MlSignal::Success(MlDetection {
            candidates: vec![
                // inside its own range
                candidate(MetricType::Steps, 6000.0, 4000.0, 8000.0),
                candidate(MetricType::Steps, 2000.0, 4000.0, 8000.0),
                candidate(MetricType::Steps, 1000.0, 4000.0, 8000.0),
                // inverted range
                candidate(MetricType::Sleep, 300.0, 470.0, 370.0),
            ],
            confidence: 0.8,
            model_version: None,
        });

        let outcome = coordinator
            .run_at(&make_sample(), Some(&baseline), Some(signal), detected_at())
            .unwrap();

        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(outcome.anomalies[0].actual_value, 2000.0);
        assert_eq!(outcome.anomalies[0].category, AnomalyCategory::LowActivity);
    }

    #[test]
    fn test_insufficient_history_yields_no_baseline() {
        let samples: Vec<_> = (1..=5)
            .map(|d| MetricSample {
                steps: 6000,
                ..MetricSample::new("user-1", NaiveDate::from_ymd_opt(2024, 1, d).unwrap())
            })
            .collect();

        let outcome = BaselineCalculator::default()
            .compute_at(&samples, detected_at())
            .unwrap();
        assert!(matches!(outcome, BaselineOutcome::InsufficientData { available: 5, required: 7 }));

        let coordinator = AnomalyDetectionCoordinator::default();
        let result = coordinator
            .run_at(&make_sample(), outcome.into_baseline().as_ref(), None, detected_at())
            .unwrap();

        assert_eq!(
            result,
            DetectionOutcome {
                anomalies: vec![],
                used_fallback: true,
                fallback_reason: Some("no_baseline".to_string()),
            }
        );
    }

    #[test]
    fn test_invalid_baseline_never_used() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let baseline = make_baseline(6);
        let signal = MlSignal::Success(MlDetection {
            candidates: vec![candidate(MetricType::Steps, 2000.0, 4000.0, 8000.0)],
            confidence: 0.99,
            model_version: None,
        });

        let outcome = coordinator
            .run_at(&make_sample(), Some(&baseline), Some(signal), detected_at())
            .unwrap();

        assert!(outcome.anomalies.is_empty());
        assert_eq!(outcome.fallback_reason.as_deref(), Some("no_baseline"));
    }

    #[test]
    fn test_user_mismatch_is_an_error() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let mut baseline = make_baseline(30);
        baseline.user_id = "user-2".to_string();

        let result = coordinator.run_at(&make_sample(), Some(&baseline), None, detected_at());
        assert!(matches!(result, Err(EngineError::PreconditionViolation(_))));
    }

    enum Behaviour {
        Succeed(f64),
        Fail,
        Unavailable,
        Hang,
        Panic,
    }

    struct FakeProvider(Behaviour);

    #[async_trait]
    impl MlSignalProvider for FakeProvider {
        async fn evaluate(
            &self,
            _sample: &MetricSample,
            _history: &[MetricSample],
        ) -> Result<MlDetection, MlError> {
            match self.0 {
                Behaviour::Succeed(confidence) => Ok(MlDetection {
                    candidates: vec![candidate(MetricType::Sleep, 300.0, 360.0, 480.0)],
                    confidence,
                    model_version: None,
                }),
                Behaviour::Fail => Err(MlError::Failed("tensor shape mismatch".to_string())),
                Behaviour::Unavailable => Err(MlError::Unavailable),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(MlError::Unavailable)
                }
                Behaviour::Panic => panic!("model exploded"),
            }
        }
    }

    async fn run_provider(behaviour: Behaviour) -> DetectionOutcome {
        let coordinator = AnomalyDetectionCoordinator::default();
        let baseline = make_baseline(30);
        coordinator
            .run_with_provider(
                Arc::new(FakeProvider(behaviour)),
                &make_sample(),
                &[],
                Some(&baseline),
                Duration::from_millis(50),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_provider_success() {
        let outcome = run_provider(Behaviour::Succeed(0.9)).await;
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(outcome.anomalies[0].metric_type, MetricType::Sleep);
    }

    #[tokio::test]
    async fn test_provider_failure_modes_fall_back() {
        let outcome = run_provider(Behaviour::Fail).await;
        assert_eq!(
            outcome.fallback_reason.as_deref(),
            Some("ml_error: model failed: tensor shape mismatch")
        );
        assert_eq!(outcome.anomalies.len(), 2);

        let outcome = run_provider(Behaviour::Unavailable).await;
        assert_eq!(outcome.fallback_reason.as_deref(), Some("ml_unavailable"));

        let outcome = run_provider(Behaviour::Succeed(0.4)).await;
        assert_eq!(outcome.fallback_reason.as_deref(), Some("ml_low_confidence"));
    }

    #[tokio::test]
    async fn test_provider_timeout_falls_back() {
        let outcome = run_provider(Behaviour::Hang).await;
        assert!(outcome.used_fallback);
        assert_eq!(
            outcome.fallback_reason.as_deref(),
            Some("ml_error: timed out after 50ms")
        );
        assert_eq!(outcome.anomalies.len(), 2);
    }

    #[tokio::test]
    async fn test_provider_panic_is_contained() {
        let outcome = run_provider(Behaviour::Panic).await;
        assert!(outcome.used_fallback);
        assert_eq!(
            outcome.fallback_reason.as_deref(),
            Some("ml_error: provider panicked: model exploded")
        );
        assert_eq!(outcome.anomalies.len(), 2);
    }

    #[tokio::test]
    async fn test_provider_skipped_without_baseline() {
        let coordinator = AnomalyDetectionCoordinator::default();
        let outcome = coordinator
            .run_with_provider(
                Arc::new(FakeProvider(Behaviour::Panic)),
                &make_sample(),
                &[],
                None,
                Duration::from_millis(50),
            )
            .await
            .unwrap();

        assert_eq!(outcome.fallback_reason.as_deref(), Some("no_baseline"));
    }
}
