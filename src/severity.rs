//! Severity classification
//!
//! Maps a deviation (in standard deviations) onto a severity tier.

use crate::types::Severity;

/// |z| at or above which a deviation is a warning
pub const WARNING_Z: f64 = 2.0;

/// |z| at or above which a deviation is an alert
pub const ALERT_Z: f64 = 3.0;

/// Classify a z-score: `[2, 3)` is a warning, `3+` an alert.
///
/// Total over all inputs; anything below 2 (including NaN) is `Info`.
pub fn classify(z_score: f64) -> Severity {
    let magnitude = z_score.abs();
    if magnitude >= ALERT_Z {
        Severity::Alert
    } else if magnitude >= WARNING_Z {
        Severity::Warning
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(classify(2.0), Severity::Warning);
        assert_eq!(classify(2.999), Severity::Warning);
        assert_eq!(classify(3.0), Severity::Alert);
    }

    #[test]
    fn test_sign_is_ignored() {
        assert_eq!(classify(-2.0), Severity::Warning);
        assert_eq!(classify(-4.0), Severity::Alert);
        assert_eq!(classify(-1.5), Severity::Info);
    }

    #[test]
    fn test_below_threshold_and_nan() {
        assert_eq!(classify(0.0), Severity::Info);
        assert_eq!(classify(1.999), Severity::Info);
        assert_eq!(classify(f64::NAN), Severity::Info);
        assert_eq!(classify(f64::INFINITY), Severity::Alert);
    }
}
