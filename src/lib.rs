//! Synheart Sentinel - On-device baseline and anomaly detection for daily health metrics
//!
//! Sentinel learns a personal baseline from a user's recent daily samples and
//! flags days that deviate from it:
//! history → baseline → (optional ML signal | threshold detection) → anomalies
//! → acknowledgement.
//!
//! ## Modules
//!
//! - **Baseline**: Per-metric mean and standard deviation over a rolling window
//! - **Detection**: Z-score thresholds with severity and category classification
//! - **Coordination**: Prefers a confident ML signal, falls back to thresholds
//! - **Acknowledgement**: Idempotent `New → Acknowledged` lifecycle

pub mod acknowledgement;
pub mod baseline;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod ml;
pub mod pipeline;
pub mod severity;
pub mod store;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use acknowledgement::{AcknowledgementTracker, AnomalyState};
pub use baseline::{BaselineCalculator, BaselineOutcome};
pub use config::DetectionConfig;
pub use coordinator::{AnomalyDetectionCoordinator, FallbackReason};
pub use detector::ThresholdAnomalyDetector;
pub use error::{EngineError, ValidationError};
pub use ml::{MlCandidate, MlDetection, MlError, MlSignal, MlSignalProvider};
pub use pipeline::{compute_baseline_json, detect_json, DetectionEngine, DetectionReport};
pub use store::{AckTransition, AnomalyRepository, BaselineRepository, InMemoryStore, SampleFeed};
pub use types::{
    Anomaly, AnomalyCategory, DetectionOutcome, MetricSample, MetricType, Severity, UserBaseline,
};

/// Sentinel library version
pub const SENTINEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "synheart-sentinel";
