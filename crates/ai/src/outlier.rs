//! Revenue outlier detection.
//!
//! Flags points that sit far from a trailing median and caps them so a single
//! spike cannot drag the forecast. Flags are always recomputed from
//! `actual_amount`; the raw value is never overwritten.

use serde::{Deserialize, Serialize};
use tracing::debug;

use fitpulse_core::{Period, RevenuePoint};

use crate::result::{AiError, AiResult};
use crate::stats::{median, robust_spread};

/// Outlier detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierConfig {
    /// Sensitivity multiplier `k` on the robust spread.
    pub multiplier: f64,
    /// Trailing reference window, in periods.
    pub window: usize,
    /// Minimum series length accepted.
    pub min_history: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            multiplier: 3.0,
            window: 12,
            min_history: 6,
        }
    }
}

/// A point that was capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedPoint {
    pub period: Period,
    pub actual_amount: f64,
    pub adjusted_amount: f64,
    pub median: f64,
    pub spread: f64,
}

/// Filter output: the full series (same length and order as the input) plus
/// the subset that was flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierReport {
    pub points: Vec<RevenuePoint>,
    pub flagged: Vec<FlaggedPoint>,
}

/// Robust rolling outlier filter.
///
/// Model:
/// - Reference window: the trailing `window` points ending at the evaluated
///   point; points before the first full window share the first `window` points.
/// - Center = median, spread = scaled MAD (scaled mean absolute deviation when
///   MAD collapses to zero).
/// - A point is an outlier when `|x - median| > multiplier * spread`; it is
///   capped to the nearest boundary `median ± multiplier * spread`.
#[derive(Debug, Clone)]
pub struct OutlierFilter {
    config: OutlierConfig,
}

impl OutlierFilter {
    pub fn new(config: OutlierConfig) -> AiResult<Self> {
        if !(config.multiplier.is_finite() && config.multiplier > 0.0) {
            return Err(AiError::InvalidInput(
                "multiplier must be a finite positive number".to_string(),
            ));
        }
        if config.window < 3 {
            return Err(AiError::InvalidInput(
                "window must be >= 3 to estimate a robust spread".to_string(),
            ));
        }
        if config.min_history == 0 {
            return Err(AiError::InvalidInput("min_history must be >= 1".to_string()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &OutlierConfig {
        &self.config
    }

    /// Flag and cap outliers. Existing flags on the input are recomputed from
    /// `actual_amount`.
    pub fn apply(&self, series: &[RevenuePoint]) -> AiResult<OutlierReport> {
        if series.len() < self.config.min_history {
            return Err(AiError::InsufficientHistory {
                required: self.config.min_history,
                available: series.len(),
            });
        }
        for pair in series.windows(2) {
            if pair[1].period <= pair[0].period {
                return Err(AiError::InvalidInput(format!(
                    "series must be strictly ordered by period: {} follows {}",
                    pair[1].period, pair[0].period
                )));
            }
        }
        if let Some(bad) = series.iter().find(|p| !p.actual_amount.is_finite()) {
            return Err(AiError::InvalidInput(format!(
                "non-finite amount for {}",
                bad.period
            )));
        }

        let amounts: Vec<f64> = series.iter().map(|p| p.actual_amount).collect();
        let window = self.config.window.min(amounts.len());
        let k = self.config.multiplier;

        let mut points = Vec::with_capacity(series.len());
        let mut flagged = Vec::new();

        for (i, point) in series.iter().enumerate() {
            let start = (i + 1).saturating_sub(window);
            let reference = if i + 1 >= window {
                &amounts[start..=i]
            } else {
                &amounts[..window]
            };

            let center = median(reference);
            let spread = robust_spread(reference, center);
            let bound = k * spread;
            let deviation = point.actual_amount - center;

            let mut out = point.clone();
            if deviation.abs() > bound {
                let adjusted = if deviation > 0.0 { center + bound } else { center - bound };
                out.flag_outlier(adjusted);
                flagged.push(FlaggedPoint {
                    period: point.period,
                    actual_amount: point.actual_amount,
                    adjusted_amount: adjusted,
                    median: center,
                    spread,
                });
            } else {
                out.clear_outlier();
            }
            points.push(out);
        }

        debug!(
            points = points.len(),
            flagged = flagged.len(),
            window,
            multiplier = k,
            "outlier filter applied"
        );

        Ok(OutlierReport { points, flagged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn series(start: &str, amounts: &[f64]) -> Vec<RevenuePoint> {
        let start: Period = start.parse().unwrap();
        amounts
            .iter()
            .enumerate()
            .map(|(i, a)| RevenuePoint::new(start.add_months(i as i64), *a).unwrap())
            .collect()
    }

    #[test]
    fn caps_a_single_spike() {
        let mut amounts = vec![
            100.0, 104.0, 98.0, 102.0, 101.0, 99.0, 103.0, 97.0, 100.0, 102.0, 98.0, 101.0,
        ];
        amounts[7] = 500.0;
        let report = OutlierFilter::new(OutlierConfig::default())
            .unwrap()
            .apply(&series("2024-01", &amounts))
            .unwrap();

        assert_eq!(report.points.len(), 12);
        assert_eq!(report.flagged.len(), 1);
        let spike = &report.points[7];
        assert!(spike.is_outlier);
        assert_eq!(spike.actual_amount, 500.0);
        let f = &report.flagged[0];
        assert!((spike.adjusted_amount - (f.median + 3.0 * f.spread)).abs() < 1e-9);
        assert!(spike.adjusted_amount < 120.0);
    }

    #[test]
    fn caps_dips_to_the_lower_boundary() {
        let amounts = [100.0, 101.0, 99.0, 100.0, 102.0, 98.0, 100.0, -400.0];
        let report = OutlierFilter::new(OutlierConfig::default())
            .unwrap()
            .apply(&series("2024-01", &amounts))
            .unwrap();
        assert_eq!(report.flagged.len(), 1);
        let dip = &report.points[7];
        assert!(dip.is_outlier);
        assert!(dip.adjusted_amount < 100.0 && dip.adjusted_amount > 90.0);
    }

    #[test]
    fn flat_series_has_no_outliers() {
        let report = OutlierFilter::new(OutlierConfig::default())
            .unwrap()
            .apply(&series("2024-01", &[50.0; 8]))
            .unwrap();
        assert!(report.flagged.is_empty());
    }

    #[test]
    fn short_history_is_rejected() {
        let err = OutlierFilter::new(OutlierConfig::default())
            .unwrap()
            .apply(&series("2024-01", &[1.0, 2.0, 3.0]))
            .unwrap_err();
        assert_eq!(
            err,
            AiError::InsufficientHistory {
                required: 6,
                available: 3
            }
        );
    }

    #[test]
    fn unordered_series_is_rejected() {
        let mut s = series("2024-01", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        s.swap(2, 3);
        assert!(matches!(
            OutlierFilter::new(OutlierConfig::default()).unwrap().apply(&s),
            Err(AiError::InvalidInput(_))
        ));

        let mut dup = series("2024-01", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        dup[3].period = dup[2].period;
        assert!(OutlierFilter::new(OutlierConfig::default()).unwrap().apply(&dup).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = OutlierConfig {
            multiplier: 0.0,
            ..OutlierConfig::default()
        };
        assert!(OutlierFilter::new(bad).is_err());
        let bad = OutlierConfig {
            window: 2,
            ..OutlierConfig::default()
        };
        assert!(OutlierFilter::new(bad).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn preserves_length_and_unflagged_amounts(
            amounts in prop::collection::vec(-1.0e6f64..1.0e6, 6..40)
        ) {
            let input = series("2020-01", &amounts);
            let report = OutlierFilter::new(OutlierConfig::default()).unwrap().apply(&input).unwrap();
            prop_assert_eq!(report.points.len(), input.len());
            for (out, inp) in report.points.iter().zip(input.iter()) {
                prop_assert_eq!(out.period, inp.period);
                prop_assert_eq!(out.actual_amount, inp.actual_amount);
                if !out.is_outlier {
                    prop_assert_eq!(out.adjusted_amount, out.actual_amount);
                } else {
                    prop_assert!(out.adjusted_amount.is_finite());
                }
            }
            prop_assert_eq!(
                report.flagged.len(),
                report.points.iter().filter(|p| p.is_outlier).count()
            );
        }
    }
}
