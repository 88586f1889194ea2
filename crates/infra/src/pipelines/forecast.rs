//! `forecast-generate` and `forecast-refresh`.
//!
//! Both run the same pipeline: load the revenue history, flag and cap
//! outliers, fit the forecaster on the adjusted series, then store the
//! outlier flags and the run's records in one write. A failed fit leaves the
//! store untouched. They differ in horizon and in
//! that refresh first checks whether the stored forecasts are stale.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use fitpulse_ai::{ForecastEngine, ForecastRun, OutlierFilter};
use fitpulse_core::Period;

use crate::jobs::{JobAction, JobContext, JobError};
use crate::store::{ForecastStore, RevenueStore, StoreResult};

/// Default age after which refresh regenerates.
pub const DEFAULT_MAX_FORECAST_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastMode {
    /// Always produce `horizon` periods.
    Generate { horizon: usize },
    /// Produce `horizon` periods only when the stored forecasts are stale.
    Refresh { horizon: usize, max_age: Duration },
}

impl ForecastMode {
    pub fn horizon(&self) -> usize {
        match self {
            ForecastMode::Generate { horizon } | ForecastMode::Refresh { horizon, .. } => *horizon,
        }
    }
}

/// Why stored forecasts need regenerating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Staleness {
    /// No forecast has been stored.
    Missing,
    /// The furthest target period is before the current month.
    Expired { latest_period: Period },
    /// The newest run is older than the allowed age.
    Aged { generated_at: DateTime<Utc> },
}

pub struct ForecastPipeline<S: ?Sized> {
    store: Arc<S>,
    filter: OutlierFilter,
    engine: ForecastEngine,
    mode: ForecastMode,
}

impl<S> ForecastPipeline<S>
where
    S: RevenueStore + ForecastStore + ?Sized,
{
    pub fn new(store: Arc<S>, filter: OutlierFilter, engine: ForecastEngine, mode: ForecastMode) -> Self {
        Self {
            store,
            filter,
            engine,
            mode,
        }
    }

    pub fn generate(store: Arc<S>, filter: OutlierFilter, engine: ForecastEngine, horizon: usize) -> Self {
        Self::new(store, filter, engine, ForecastMode::Generate { horizon })
    }

    pub fn refresh(store: Arc<S>, filter: OutlierFilter, engine: ForecastEngine, horizon: usize) -> Self {
        Self::new(
            store,
            filter,
            engine,
            ForecastMode::Refresh {
                horizon,
                max_age: Duration::days(DEFAULT_MAX_FORECAST_AGE_DAYS),
            },
        )
    }

    pub fn mode(&self) -> ForecastMode {
        self.mode
    }

    /// `None` when the stored forecasts are current at `now`.
    pub fn staleness(&self, now: DateTime<Utc>, max_age: Duration) -> StoreResult<Option<Staleness>> {
        let Some(latest_period) = self.store.max_target_period()? else {
            return Ok(Some(Staleness::Missing));
        };
        if latest_period < Period::containing(now) {
            return Ok(Some(Staleness::Expired { latest_period }));
        }
        match self.store.latest_generated_at()? {
            None => Ok(Some(Staleness::Missing)),
            Some(generated_at) if now - generated_at > max_age => {
                Ok(Some(Staleness::Aged { generated_at }))
            }
            Some(_) => Ok(None),
        }
    }

    /// Run the pipeline once. `Ok(None)` when refresh found nothing to do.
    pub fn run_at(&self, ctx: &JobContext, now: DateTime<Utc>) -> Result<Option<ForecastRun>, JobError> {
        if let ForecastMode::Refresh { max_age, .. } = self.mode {
            match self.staleness(now, max_age)? {
                None => {
                    info!(job = %ctx.job, run_id = %ctx.run_id, "forecasts are current; refresh skipped");
                    return Ok(None);
                }
                Some(reason) => {
                    info!(job = %ctx.job, run_id = %ctx.run_id, reason = ?reason, "forecasts are stale; regenerating");
                }
            }
        }

        let history = self.store.revenue_history()?;
        let filtered = self.filter.apply(&history)?;
        for flagged in &filtered.flagged {
            warn!(
                period = %flagged.period,
                actual = flagged.actual_amount,
                adjusted = flagged.adjusted_amount,
                median = flagged.median,
                spread = flagged.spread,
                "revenue outlier capped"
            );
        }
        let run = self
            .engine
            .run(&filtered.points, self.mode.horizon(), now)?;
        ctx.checkpoint()?;
        self.store.commit_forecast_run(&filtered.points, &run.records)?;

        info!(
            job = %ctx.job,
            run_id = %ctx.run_id,
            records = run.summary.count,
            first_period = ?run.summary.first_period.map(|p| p.to_string()),
            last_period = ?run.summary.last_period.map(|p| p.to_string()),
            mean_point_estimate = run.summary.mean_point_estimate,
            model_version = %run.summary.model_version,
            outliers = filtered.flagged.len(),
            "forecast run stored"
        );
        run.quality.log();
        Ok(Some(run))
    }
}

impl<S> JobAction for ForecastPipeline<S>
where
    S: RevenueStore + ForecastStore + ?Sized + 'static,
{
    fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.run_at(ctx, Utc::now()).map(|_| ())
    }
}
