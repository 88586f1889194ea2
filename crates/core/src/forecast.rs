//! Forecast records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::period::Period;

/// A point forecast with confidence bounds for one future month.
///
/// Records are append-only: a newer forecast for the same `target_period`
/// supersedes an older one without modifying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub target_period: Period,
    pub point_estimate: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    /// Probability mass of `[lower_bound, upper_bound]`, e.g. 0.8.
    pub confidence_level: f64,
    pub generated_at: DateTime<Utc>,
    pub model_version: String,
}

impl ForecastRecord {
    /// Build a record, enforcing `lower_bound <= point_estimate <= upper_bound`.
    pub fn new(
        target_period: Period,
        point_estimate: f64,
        lower_bound: f64,
        upper_bound: f64,
        confidence_level: f64,
        generated_at: DateTime<Utc>,
        model_version: impl Into<String>,
    ) -> DomainResult<Self> {
        if ![point_estimate, lower_bound, upper_bound].iter().all(|v| v.is_finite()) {
            return Err(DomainError::validation(format!(
                "forecast for {target_period} has non-finite values"
            )));
        }
        if !(lower_bound <= point_estimate && point_estimate <= upper_bound) {
            return Err(DomainError::invariant(format!(
                "forecast for {target_period} violates bound ordering: {lower_bound} <= {point_estimate} <= {upper_bound}"
            )));
        }
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(DomainError::validation(format!(
                "confidence level must be in (0, 1), got {confidence_level}"
            )));
        }
        Ok(Self {
            target_period,
            point_estimate,
            lower_bound,
            upper_bound,
            confidence_level,
            generated_at,
            model_version: model_version.into(),
        })
    }

    pub fn interval_width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period() -> Period {
        Period::new(2025, 9).unwrap()
    }

    #[test]
    fn enforces_bound_ordering() {
        let now = Utc::now();
        assert!(ForecastRecord::new(period(), 10.0, 11.0, 12.0, 0.8, now, "v").is_err());
        assert!(ForecastRecord::new(period(), 10.0, 8.0, 9.0, 0.8, now, "v").is_err());
        let ok = ForecastRecord::new(period(), 10.0, 8.0, 12.0, 0.8, now, "v").unwrap();
        assert_eq!(ok.interval_width(), 4.0);
    }

    #[test]
    fn rejects_bad_confidence_and_nan() {
        let now = Utc::now();
        assert!(ForecastRecord::new(period(), 10.0, 8.0, 12.0, 1.0, now, "v").is_err());
        assert!(ForecastRecord::new(period(), f64::NAN, 8.0, 12.0, 0.8, now, "v").is_err());
    }
}
