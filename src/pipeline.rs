//! Pipeline orchestration
//!
//! This module provides the public API for Synheart Sentinel. It runs the
//! full daily flow over the persistence collaborators:
//! history → baseline (recomputed when missing or stale) → coordinator →
//! anomalies recorded as new.

use crate::acknowledgement::AcknowledgementTracker;
use crate::baseline::{BaselineCalculator, BaselineOutcome};
use crate::config::DetectionConfig;
use crate::coordinator::AnomalyDetectionCoordinator;
use crate::error::EngineError;
use crate::ml::{MlSignal, MlSignalProvider};
use crate::store::{AnomalyRepository, BaselineRepository, InMemoryStore, SampleFeed};
use crate::types::{DetectionOutcome, MetricSample, UserBaseline};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Compute a baseline from a JSON array of samples (stateless, one-shot).
///
/// # Returns
/// JSON of the `BaselineOutcome`: `{"status": "ready", ...baseline}` or
/// `{"status": "insufficient_data", "available": n, "required": 7}`
///
/// # Example
/// ```ignore
/// let outcome_json = compute_baseline_json(&history_json)?;
/// ```
pub fn compute_baseline_json(history_json: &str) -> Result<String, EngineError> {
    let samples: Vec<MetricSample> = serde_json::from_str(history_json)?;
    for sample in &samples {
        sample.validate()?;
    }

    let outcome = BaselineCalculator::default().compute(&samples)?;
    Ok(serde_json::to_string(&outcome)?)
}

/// Detect anomalies for one sample (stateless, one-shot).
///
/// # Arguments
/// * `sample_json` - The day's `MetricSample`
/// * `baseline_json` - Previously stored `UserBaseline`, if any
/// * `ml_signal_json` - Result of the host's ML model, if any
///
/// # Returns
/// JSON of the `DetectionOutcome`
pub fn detect_json(
    sample_json: &str,
    baseline_json: Option<&str>,
    ml_signal_json: Option<&str>,
) -> Result<String, EngineError> {
    let sample: MetricSample = serde_json::from_str(sample_json)?;
    sample.validate()?;

    let baseline = baseline_json.map(UserBaseline::from_json).transpose()?;
    let ml_signal = ml_signal_json
        .map(serde_json::from_str::<MlSignal>)
        .transpose()?;

    let outcome = AnomalyDetectionCoordinator::default().run(&sample, baseline.as_ref(), ml_signal)?;
    Ok(serde_json::to_string(&outcome)?)
}

/// Result of processing one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub outcome: DetectionOutcome,
    /// Baseline the day was checked against
    pub baseline: Option<UserBaseline>,
    /// Whether the baseline was recomputed (and persisted) during this run
    pub baseline_refreshed: bool,
    /// Anomalies newly recorded in the store
    pub recorded: usize,
}

/// Stateful engine over a store implementing every persistence contract.
///
/// Use this when baselines and anomalies must persist across daily runs.
pub struct DetectionEngine<S>
where
    S: SampleFeed + BaselineRepository + AnomalyRepository,
{
    store: Arc<S>,
    tracker: AcknowledgementTracker<S>,
    calculator: BaselineCalculator,
    coordinator: AnomalyDetectionCoordinator,
    config: DetectionConfig,
}

impl DetectionEngine<InMemoryStore> {
    /// Engine over a fresh in-memory store with default settings
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }
}

impl<S> DetectionEngine<S>
where
    S: SampleFeed + BaselineRepository + AnomalyRepository,
{
    pub fn new(store: Arc<S>) -> Self {
        Self::build(store, DetectionConfig::default())
    }

    /// Create an engine with custom thresholds
    pub fn with_config(store: Arc<S>, config: DetectionConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self::build(store, config))
    }

    /// Create an engine with a custom rolling baseline window (days)
    pub fn with_baseline_window(store: Arc<S>, window_days: u32) -> Result<Self, EngineError> {
        Self::with_config(
            store,
            DetectionConfig {
                baseline_window_days: window_days,
                ..Default::default()
            },
        )
    }

    fn build(store: Arc<S>, config: DetectionConfig) -> Self {
        Self {
            tracker: AcknowledgementTracker::new(Arc::clone(&store)),
            store,
            calculator: BaselineCalculator::from_config(&config),
            coordinator: AnomalyDetectionCoordinator::from_config(&config),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn tracker(&self) -> &AcknowledgementTracker<S> {
        &self.tracker
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Process a day's sample with an optional, already obtained ML signal
    pub fn process_day(
        &self,
        sample: &MetricSample,
        ml_signal: Option<MlSignal>,
    ) -> Result<DetectionReport, EngineError> {
        self.process_day_at(sample, ml_signal, Utc::now())
    }

    pub fn process_day_at(
        &self,
        sample: &MetricSample,
        ml_signal: Option<MlSignal>,
        now: DateTime<Utc>,
    ) -> Result<DetectionReport, EngineError> {
        sample.validate()?;
        let (_, baseline, baseline_refreshed) = self.prepare(sample, now)?;
        let outcome = self
            .coordinator
            .run_at(sample, baseline.as_ref(), ml_signal, now)?;
        self.finish(sample, outcome, baseline, baseline_refreshed)
    }

    /// Process a day's sample, asking `provider` for an ML signal first.
    ///
    /// The provider call is bounded by `ml_timeout_ms`.
    pub async fn process_day_with_provider(
        &self,
        sample: &MetricSample,
        provider: Arc<dyn MlSignalProvider>,
    ) -> Result<DetectionReport, EngineError> {
        self.process_day_with_provider_at(sample, provider, Utc::now())
            .await
    }

    pub async fn process_day_with_provider_at(
        &self,
        sample: &MetricSample,
        provider: Arc<dyn MlSignalProvider>,
        now: DateTime<Utc>,
    ) -> Result<DetectionReport, EngineError> {
        sample.validate()?;
        let (history, baseline, baseline_refreshed) = self.prepare(sample, now)?;
        let outcome = self
            .coordinator
            .run_with_provider_at(
                provider,
                sample,
                &history,
                baseline.as_ref(),
                self.config.ml_timeout(),
                now,
            )
            .await?;
        self.finish(sample, outcome, baseline, baseline_refreshed)
    }

    /// Recompute and persist the baseline used to check `now`'s date, from
    /// the samples dated strictly before it.
    pub fn refresh_baseline(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BaselineOutcome, EngineError> {
        let history = self.store.recent_samples(
            user_id,
            now.date_naive(),
            self.config.baseline_window_days,
        )?;
        let outcome = self.calculator.compute_at(&history, now)?;
        if let BaselineOutcome::Ready(baseline) = &outcome {
            self.store.replace(baseline.clone())?;
        }
        Ok(outcome)
    }

    /// History window, the baseline to use, and whether it was recomputed
    fn prepare(
        &self,
        sample: &MetricSample,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MetricSample>, Option<UserBaseline>, bool), EngineError> {
        let history = self.store.recent_samples(
            &sample.user_id,
            sample.date,
            self.config.baseline_window_days,
        )?;

        let stored = self.store.load(&sample.user_id)?;
        let stored_end = stored.as_ref().and_then(|b| b.window_end);

        // A stored baseline is only usable if it was built from days before this one
        let usable = stored.filter(|b| {
            b.is_valid(self.config.min_baseline_days) && b.precedes(sample.date)
        });

        if let Some(baseline) = &usable {
            if !self.is_stale(baseline, now) {
                return Ok((history, usable, false));
            }
        }

        match self.calculator.compute_at(&history, now)? {
            BaselineOutcome::Ready(baseline) => {
                // Backfilling an older day must not replace a newer baseline
                if stored_end.map_or(true, |end| baseline.window_end >= Some(end)) {
                    self.store.replace(baseline.clone())?;
                }
                debug!(
                    user_id = %sample.user_id,
                    sample_count = baseline.sample_count,
                    window_end = ?baseline.window_end,
                    "Baseline refreshed"
                );
                Ok((history, Some(baseline), true))
            }
            BaselineOutcome::InsufficientData { .. } => Ok((history, usable, false)),
        }
    }

    fn is_stale(&self, baseline: &UserBaseline, now: DateTime<Utc>) -> bool {
        now - baseline.calculated_at >= Duration::hours(self.config.baseline_max_age_hours as i64)
    }

    fn finish(
        &self,
        sample: &MetricSample,
        outcome: DetectionOutcome,
        baseline: Option<UserBaseline>,
        baseline_refreshed: bool,
    ) -> Result<DetectionReport, EngineError> {
        let recorded = self.tracker.record_new(&outcome.anomalies)?;

        info!(
            user_id = %sample.user_id,
            date = %sample.date,
            anomalies = outcome.anomalies.len(),
            recorded,
            used_fallback = outcome.used_fallback,
            fallback_reason = outcome.fallback_reason.as_deref().unwrap_or("none"),
            "Detection run complete"
        );

        Ok(DetectionReport {
            outcome,
            baseline,
            baseline_refreshed,
            recorded,
        })
    }
}
