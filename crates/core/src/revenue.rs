//! Revenue history points.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::period::Period;

/// Monthly revenue (net profit) observation.
///
/// `actual_amount` never changes once ingested; only the outlier flag and
/// `adjusted_amount` are rewritten by outlier filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenuePoint {
    pub period: Period,
    pub actual_amount: f64,
    pub is_outlier: bool,
    pub adjusted_amount: f64,
}

impl RevenuePoint {
    pub fn new(period: Period, actual_amount: f64) -> DomainResult<Self> {
        if !actual_amount.is_finite() {
            return Err(DomainError::validation(format!(
                "revenue for {period} must be finite, got {actual_amount}"
            )));
        }
        Ok(Self {
            period,
            actual_amount,
            is_outlier: false,
            adjusted_amount: actual_amount,
        })
    }

    /// Mark as outlier, capping the value seen by the forecaster.
    pub fn flag_outlier(&mut self, adjusted_amount: f64) {
        self.is_outlier = true;
        self.adjusted_amount = adjusted_amount;
    }

    pub fn clear_outlier(&mut self) {
        self.is_outlier = false;
        self.adjusted_amount = self.actual_amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outlier_flag_round_trip() {
        let mut point = RevenuePoint::new(Period::new(2025, 1).unwrap(), 50_000.0).unwrap();
        assert_eq!(point.adjusted_amount, point.actual_amount);

        point.flag_outlier(12_000.0);
        assert!(point.is_outlier);
        assert_eq!(point.actual_amount, 50_000.0);
        assert_eq!(point.adjusted_amount, 12_000.0);

        point.clear_outlier();
        assert!(!point.is_outlier);
        assert_eq!(point.adjusted_amount, 50_000.0);
    }

    #[test]
    fn rejects_non_finite_amounts() {
        let period = Period::new(2025, 1).unwrap();
        assert!(RevenuePoint::new(period, f64::NAN).is_err());
        assert!(RevenuePoint::new(period, f64::INFINITY).is_err());
    }
}
