//! Optional ML signal
//!
//! The engine does not run a model itself. An external provider may supply
//! candidate anomalies with a confidence score; this module defines that
//! contract and how provider results are turned into an `MlSignal`.

use crate::types::{MetricSample, MetricType, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One anomaly proposed by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlCandidate {
    pub metric_type: MetricType,
    pub actual_value: f64,
    pub expected_min: f64,
    pub expected_max: f64,
    pub severity: Severity,
    /// Model-provided message; a standard one is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Successful model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlDetection {
    pub candidates: Vec<MlCandidate>,
    /// Model confidence (0-1)
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

/// Structured ML result handed to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum MlSignal {
    Success(MlDetection),
    Failure(String),
}

impl MlSignal {
    /// Convert a provider result; an unavailable model means "no signal"
    pub fn from_result(result: Result<MlDetection, MlError>) -> Option<Self> {
        match result {
            Ok(detection) => Some(MlSignal::Success(detection)),
            Err(MlError::Unavailable) => None,
            Err(e) => Some(MlSignal::Failure(e.to_string())),
        }
    }
}

/// Failures of the ML path; all are recovered by falling back
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MlError {
    #[error("model unavailable")]
    Unavailable,

    #[error("model failed: {0}")]
    Failed(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("provider panicked: {0}")]
    Panicked(String),
}

/// External model that scores a day's sample against its history
#[async_trait]
pub trait MlSignalProvider: Send + Sync {
    async fn evaluate(
        &self,
        sample: &MetricSample,
        history: &[MetricSample],
    ) -> Result<MlDetection, MlError>;
}
