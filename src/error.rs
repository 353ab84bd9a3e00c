//! Error types for Synheart Sentinel

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while computing baselines or detecting anomalies
#[derive(Debug, Error)]
pub enum EngineError {
    /// A caller broke an engine contract (e.g. detection without a valid baseline)
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Anomaly not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid metric sample: {0}")]
    InvalidSample(#[from] ValidationError),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Validation errors for metric samples
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing user id")]
    MissingUserId,

    #[error("{field} must be finite and non-negative, got {value}")]
    NegativeOrNonFinite { field: &'static str, value: f64 },

    #[error("Sleep duration {0} minutes exceeds a day (1440)")]
    SleepOutOfRange(u32),

    #[error("Mood score {0} outside 1-10")]
    MoodOutOfRange(u8),
}
