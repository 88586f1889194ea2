//! Seasonal profit forecasting.
//!
//! Model (additive seasonal-trend decomposition):
//! - OLS linear trend over month offsets from the first observed period
//!   (gaps in the history are allowed).
//! - Per-phase seasonal indices over the detrended residuals, shrunk toward
//!   zero by `n_k / (n_k + seasonal_prior)` and re-centered to sum to zero.
//! - Residual standard error with degrees of freedom reduced by the effective
//!   number of seasonal parameters.
//! - Bounds: `z * sigma * sqrt(1 + 1/n + (t - t_mean)^2 / Sxx)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fitpulse_core::{ForecastRecord, Period, RevenuePoint};

use crate::model::{ForecastPoint, ForecastSettings, Forecaster};
use crate::result::{AiError, AiResult};
use crate::stats::{mean, two_sided_z};

const MODEL_FAMILY: &str = "seasonal-trend-v1";

/// Predicted-vs-historical mean change above which a run is flagged, in percent.
pub const LARGE_CHANGE_PCT: f64 = 50.0;

/// Fitted seasonal-trend state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalTrendModel {
    model_version: String,
    origin: Period,
    last_observed: Period,
    season_length: usize,
    intercept: f64,
    slope: f64,
    /// Indexed by `origin.months_until(p) mod season_length`.
    seasonal: Vec<f64>,
    sigma: f64,
    n: usize,
    t_mean: f64,
    sxx: f64,
}

impl SeasonalTrendModel {
    pub fn slope(&self) -> f64 {
        self.slope
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn seasonal_indices(&self) -> &[f64] {
        &self.seasonal
    }

    pub fn last_observed(&self) -> Period {
        self.last_observed
    }

    fn offset(&self, period: Period) -> f64 {
        self.origin.months_until(period) as f64
    }

    fn phase(&self, period: Period) -> usize {
        self.origin
            .months_until(period)
            .rem_euclid(self.season_length as i64) as usize
    }

    fn fitted(&self, period: Period) -> f64 {
        self.intercept + self.slope * self.offset(period) + self.seasonal[self.phase(period)]
    }

    fn check_finite(&self) -> AiResult<()> {
        let params = [self.intercept, self.slope, self.sigma, self.t_mean, self.sxx];
        if params.iter().chain(self.seasonal.iter()).all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(AiError::ModelFit(
                "fit produced non-finite parameters".to_string(),
            ))
        }
    }
}

impl Forecaster for SeasonalTrendModel {
    fn fit(series: &[RevenuePoint], settings: &ForecastSettings) -> AiResult<Self> {
        let season_length = settings.season_length;
        if season_length < 2 {
            return Err(AiError::InvalidInput("season_length must be >= 2".to_string()));
        }
        if !(settings.seasonal_prior.is_finite() && settings.seasonal_prior >= 0.0) {
            return Err(AiError::InvalidInput(
                "seasonal_prior must be a finite non-negative number".to_string(),
            ));
        }
        if series.len() < season_length {
            return Err(AiError::InsufficientHistory {
                required: season_length,
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

        let origin = series[0].period;
        let last_observed = series[series.len() - 1].period;
        let n = series.len();
        let ts: Vec<f64> = series.iter().map(|p| origin.months_until(p.period) as f64).collect();
        let ys: Vec<f64> = series.iter().map(|p| p.adjusted_amount).collect();
        if ys.iter().any(|y| !y.is_finite()) {
            return Err(AiError::ModelFit("series contains non-finite amounts".to_string()));
        }

        // Trend.
        let t_mean = mean(&ts);
        let y_mean = mean(&ys);
        let sxx: f64 = ts.iter().map(|t| (t - t_mean).powi(2)).sum();
        if sxx <= 0.0 {
            return Err(AiError::ModelFit("degenerate time axis".to_string()));
        }
        let sxy: f64 = ts
            .iter()
            .zip(&ys)
            .map(|(t, y)| (t - t_mean) * (y - y_mean))
            .sum();
        let slope = sxy / sxx;
        let intercept = y_mean - slope * t_mean;

        // Seasonality over detrended residuals.
        let phase_of = |t: f64| (t as i64).rem_euclid(season_length as i64) as usize;
        let mut sums = vec![0.0; season_length];
        let mut counts = vec![0usize; season_length];
        for (t, y) in ts.iter().zip(&ys) {
            let k = phase_of(*t);
            sums[k] += y - (intercept + slope * t);
            counts[k] += 1;
        }
        let prior = settings.seasonal_prior;
        let mut seasonal: Vec<f64> = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| {
                if *count == 0 {
                    return 0.0;
                }
                let c = *count as f64;
                (sum / c) * (c / (c + prior))
            })
            .collect();
        let seasonal_mean = mean(&seasonal);
        for s in &mut seasonal {
            *s -= seasonal_mean;
        }

        // Residual standard error.
        let effective_params: f64 = counts
            .iter()
            .map(|c| {
                let c = *c as f64;
                c / (c + prior)
            })
            .sum::<f64>();
        let edf = (effective_params - 1.0).max(0.0);
        let dof = (n as f64 - 2.0 - edf).max(1.0);
        let sse: f64 = ts
            .iter()
            .zip(&ys)
            .map(|(t, y)| {
                let fit = intercept + slope * t + seasonal[phase_of(*t)];
                (y - fit).powi(2)
            })
            .sum();
        let sigma = (sse / dof).sqrt();

        let model = Self {
            model_version: format!("{MODEL_FAMILY}-s{season_length}"),
            origin,
            last_observed,
            season_length,
            intercept,
            slope,
            seasonal,
            sigma,
            n,
            t_mean,
            sxx,
        };
        model.check_finite()?;
        Ok(model)
    }

    fn forecast(&self, horizon: usize, confidence_level: f64) -> AiResult<Vec<ForecastPoint>> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(AiError::InvalidInput(format!(
                "confidence level must be in (0, 1), got {confidence_level}"
            )));
        }
        let z = two_sided_z(confidence_level);
        let n = self.n as f64;

        let mut out = Vec::with_capacity(horizon);
        for step in 1..=horizon {
            let period = self.last_observed.add_months(step as i64);
            let t = self.offset(period);
            let point = self.fitted(period);
            let half = z * self.sigma * (1.0 + 1.0 / n + (t - self.t_mean).powi(2) / self.sxx).sqrt();
            if !(point.is_finite() && half.is_finite()) {
                return Err(AiError::ModelFit(format!("non-finite forecast for {period}")));
            }
            out.push(ForecastPoint {
                period,
                point,
                lower: point - half,
                upper: point + half,
            });
        }
        Ok(out)
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn serialize(&self) -> AiResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn deserialize(bytes: &[u8]) -> AiResult<Self> {
        let model: Self = serde_json::from_slice(bytes)?;
        if model.seasonal.len() != model.season_length || model.season_length < 2 || model.n == 0 {
            return Err(AiError::Serialization(
                "seasonal state does not match season length".to_string(),
            ));
        }
        model.check_finite().map_err(|e| AiError::Serialization(e.to_string()))?;
        Ok(model)
    }
}

/// Aggregate view of one forecast run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastSummary {
    pub count: usize,
    pub first_period: Option<Period>,
    pub last_period: Option<Period>,
    pub mean_point_estimate: f64,
    pub model_version: String,
    pub generated_at: DateTime<Utc>,
}

impl ForecastSummary {
    pub fn from_records(records: &[ForecastRecord], model_version: &str, generated_at: DateTime<Utc>) -> Self {
        let points: Vec<f64> = records.iter().map(|r| r.point_estimate).collect();
        Self {
            count: records.len(),
            first_period: records.iter().map(|r| r.target_period).min(),
            last_period: records.iter().map(|r| r.target_period).max(),
            mean_point_estimate: mean(&points),
            model_version: model_version.to_string(),
            generated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityWarning {
    /// Predicted mean moved more than [`LARGE_CHANGE_PCT`] from the historical mean.
    LargeChange { pct_change: f64 },
    /// History shorter than two seasonal cycles.
    ShortHistory { points: usize, recommended: usize },
}

/// Sanity check of a run against its history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub history_points: usize,
    pub outliers: usize,
    pub historical_mean: f64,
    pub predicted_mean: f64,
    /// `None` when the historical mean is zero.
    pub pct_change: Option<f64>,
    pub warnings: Vec<QualityWarning>,
}

impl QualityReport {
    pub fn assess(history: &[RevenuePoint], records: &[ForecastRecord], season_length: usize) -> Self {
        let historical: Vec<f64> = history.iter().map(|p| p.adjusted_amount).collect();
        let predicted: Vec<f64> = records.iter().map(|r| r.point_estimate).collect();
        let historical_mean = mean(&historical);
        let predicted_mean = mean(&predicted);
        let pct_change = (historical_mean.abs() > f64::EPSILON)
            .then(|| (predicted_mean - historical_mean) / historical_mean.abs() * 100.0);

        let mut warnings = Vec::new();
        if let Some(pct) = pct_change.filter(|p| p.abs() > LARGE_CHANGE_PCT) {
            warnings.push(QualityWarning::LargeChange { pct_change: pct });
        }
        let recommended = season_length * 2;
        if history.len() < recommended {
            warnings.push(QualityWarning::ShortHistory {
                points: history.len(),
                recommended,
            });
        }

        Self {
            history_points: history.len(),
            outliers: history.iter().filter(|p| p.is_outlier).count(),
            historical_mean,
            predicted_mean,
            pct_change,
            warnings,
        }
    }

    pub fn log(&self) {
        info!(
            history_points = self.history_points,
            outliers = self.outliers,
            historical_mean = self.historical_mean,
            predicted_mean = self.predicted_mean,
            pct_change = ?self.pct_change,
            "forecast quality"
        );
        for warning in &self.warnings {
            match warning {
                QualityWarning::LargeChange { pct_change } => {
                    warn!(pct_change, "forecast mean differs sharply from history")
                }
                QualityWarning::ShortHistory { points, recommended } => {
                    warn!(points, recommended, "short revenue history; forecast may be unreliable")
                }
            }
        }
    }
}

/// Output of [`ForecastEngine::run`].
#[derive(Debug, Clone)]
pub struct ForecastRun {
    pub records: Vec<ForecastRecord>,
    pub summary: ForecastSummary,
    pub quality: QualityReport,
}

/// Fits a forecaster on an (outlier-adjusted) series and turns its output into
/// [`ForecastRecord`]s. Either every record of a run is produced or none is.
#[derive(Debug, Clone)]
pub struct ForecastEngine {
    settings: ForecastSettings,
    confidence_level: f64,
}

impl Default for ForecastEngine {
    fn default() -> Self {
        Self {
            settings: ForecastSettings::default(),
            confidence_level: 0.8,
        }
    }
}

impl ForecastEngine {
    pub fn new(settings: ForecastSettings, confidence_level: f64) -> AiResult<Self> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(AiError::InvalidInput(format!(
                "confidence level must be in (0, 1), got {confidence_level}"
            )));
        }
        Ok(Self {
            settings,
            confidence_level,
        })
    }

    pub fn settings(&self) -> &ForecastSettings {
        &self.settings
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    pub fn run(
        &self,
        series: &[RevenuePoint],
        horizon: usize,
        generated_at: DateTime<Utc>,
    ) -> AiResult<ForecastRun> {
        self.run_with::<SeasonalTrendModel>(series, horizon, generated_at)
    }

    pub fn run_with<F: Forecaster>(
        &self,
        series: &[RevenuePoint],
        horizon: usize,
        generated_at: DateTime<Utc>,
    ) -> AiResult<ForecastRun> {
        if horizon == 0 {
            return Err(AiError::InvalidInput("horizon must be >= 1".to_string()));
        }
        let model = F::fit(series, &self.settings)?;
        let points = model.forecast(horizon, self.confidence_level)?;

        let records = points
            .into_iter()
            .map(|p| {
                ForecastRecord::new(
                    p.period,
                    p.point,
                    p.lower,
                    p.upper,
                    self.confidence_level,
                    generated_at,
                    model.model_version(),
                )
                .map_err(|e| AiError::ModelFit(e.to_string()))
            })
            .collect::<AiResult<Vec<_>>>()?;

        let summary = ForecastSummary::from_records(&records, model.model_version(), generated_at);
        let quality = QualityReport::assess(series, &records, self.settings.season_length);
        Ok(ForecastRun {
            records,
            summary,
            quality,
        })
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

    fn seasonal_series(months: usize) -> Vec<f64> {
        (0..months)
            .map(|i| {
                let season = if i % 12 == 11 { 30.0 } else if i % 12 == 0 { 20.0 } else { -5.0 };
                1000.0 + 10.0 * i as f64 + season
            })
            .collect()
    }

    #[test]
    fn recovers_a_linear_trend() {
        let amounts: Vec<f64> = (0..24).map(|i| 500.0 + 25.0 * i as f64).collect();
        let model = SeasonalTrendModel::fit(&series("2023-01", &amounts), &ForecastSettings::default()).unwrap();
        assert!((model.slope() - 25.0).abs() < 1e-9);
        assert!(model.sigma() < 1e-6);

        let out = model.forecast(3, 0.8).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].period, "2025-01".parse().unwrap());
        assert!((out[0].point - (500.0 + 25.0 * 24.0)).abs() < 1e-6);
    }

    #[test]
    fn captures_seasonality() {
        let amounts = seasonal_series(36);
        let model = SeasonalTrendModel::fit(&series("2022-01", &amounts), &ForecastSettings::default()).unwrap();
        let out = model.forecast(12, 0.8).unwrap();
        // December (phase 11) should sit above November.
        let nov = out.iter().find(|p| p.period.month() == 11).unwrap();
        let dec = out.iter().find(|p| p.period.month() == 12).unwrap();
        assert!(dec.point - nov.point > 20.0);
        let sum: f64 = model.seasonal_indices().iter().sum();
        assert!(sum.abs() < 1e-9);
    }

    #[test]
    fn intervals_widen_with_horizon() {
        let mut amounts = seasonal_series(24);
        amounts[5] += 40.0;
        amounts[17] -= 35.0;
        let model = SeasonalTrendModel::fit(&series("2023-01", &amounts), &ForecastSettings::default()).unwrap();
        let out = model.forecast(6, 0.8).unwrap();
        for pair in out.windows(2) {
            assert!(pair[1].upper - pair[1].lower > pair[0].upper - pair[0].lower);
        }
        let wider = model.forecast(1, 0.95).unwrap();
        assert!(wider[0].upper - wider[0].lower > out[0].upper - out[0].lower);
    }

    #[test]
    fn short_history_is_rejected() {
        let err = SeasonalTrendModel::fit(&series("2024-01", &[1.0; 11]), &ForecastSettings::default())
            .unwrap_err();
        assert_eq!(
            err,
            AiError::InsufficientHistory {
                required: 12,
                available: 11
            }
        );
    }

    #[test]
    fn non_finite_input_is_a_model_fit_error() {
        let mut s = series("2024-01", &[1.0; 12]);
        s[4].adjusted_amount = f64::NAN;
        assert!(matches!(
            SeasonalTrendModel::fit(&s, &ForecastSettings::default()),
            Err(AiError::ModelFit(_))
        ));

        let mut s = series("2024-01", &[1.0; 12]);
        s[4].adjusted_amount = f64::MAX;
        s[5].adjusted_amount = -f64::MAX;
        assert!(matches!(
            SeasonalTrendModel::fit(&s, &ForecastSettings::default()),
            Err(AiError::ModelFit(_))
        ));
    }

    #[test]
    fn serialization_round_trip() {
        let model =
            SeasonalTrendModel::fit(&series("2022-01", &seasonal_series(30)), &ForecastSettings::default()).unwrap();
        let restored = <SeasonalTrendModel as Forecaster>::deserialize(&Forecaster::serialize(&model).unwrap()).unwrap();
        assert_eq!(restored.forecast(4, 0.8).unwrap(), model.forecast(4, 0.8).unwrap());
    }

    #[test]
    fn engine_builds_records_summary_and_quality() {
        let history = series("2023-01", &seasonal_series(18));
        let at = Utc::now();
        let run = ForecastEngine::default().run(&history, 6, at).unwrap();

        assert_eq!(run.records.len(), 6);
        assert_eq!(run.summary.count, 6);
        assert_eq!(run.summary.first_period, Some("2024-07".parse().unwrap()));
        assert_eq!(run.summary.last_period, Some("2024-12".parse().unwrap()));
        assert!(run.records.iter().all(|r| r.generated_at == at && r.confidence_level == 0.8));
        assert!(run.quality.pct_change.unwrap().abs() < LARGE_CHANGE_PCT);
        assert!(matches!(
            run.quality.warnings.as_slice(),
            [QualityWarning::ShortHistory { points: 18, recommended: 24 }]
        ));
    }

    #[test]
    fn quality_flags_large_changes() {
        let history = series("2023-01", &[100.0; 12]);
        let records = vec![
            ForecastRecord::new("2024-01".parse().unwrap(), 200.0, 150.0, 250.0, 0.8, Utc::now(), "m").unwrap(),
        ];
        let report = QualityReport::assess(&history, &records, 6);
        assert_eq!(report.pct_change, Some(100.0));
        assert_eq!(report.warnings, vec![QualityWarning::LargeChange { pct_change: 100.0 }]);
    }

    #[test]
    fn engine_rejects_bad_arguments() {
        assert!(ForecastEngine::new(ForecastSettings::default(), 1.0).is_err());
        let history = series("2023-01", &seasonal_series(12));
        assert!(ForecastEngine::default().run(&history, 0, Utc::now()).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn bounds_always_bracket_the_point(
            amounts in prop::collection::vec(-1.0e6f64..1.0e6, 12..48),
            horizon in 1usize..12,
            confidence in 0.05f64..0.99,
        ) {
            let history = series("2019-01", &amounts);
            let engine = ForecastEngine::new(ForecastSettings::default(), confidence).unwrap();
            let run = engine.run(&history, horizon, Utc::now()).unwrap();
            prop_assert_eq!(run.records.len(), horizon);
            for r in &run.records {
                prop_assert!(r.lower_bound <= r.point_estimate);
                prop_assert!(r.point_estimate <= r.upper_bound);
            }
        }
    }
}
