//! Persistence boundary for the analytics core.
//!
//! ## Design
//!
//! - One trait per record family, each with per-record atomic writes
//! - `ForecastStore::append_forecasts` is all-or-nothing for a run
//! - `ForecastStore::commit_forecast_run` writes a run's outlier flags and
//!   forecast records as one unit
//! - `JobRunStore::try_start_run` is the per-job lease: it inserts a running
//!   `JobRun` only when no running run exists for that job
//! - `InMemoryAnalyticsStore` for tests/dev; `PostgresAnalyticsStore` behind
//!   the `postgres` feature

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use fitpulse_core::{
    FeedbackId, FeedbackRecord, ForecastRecord, JobName, JobRun, JobRunId, OverlapSkip, Period,
    PeriodRange, RevenuePoint, RunTrigger, SentimentLabel,
};

pub use memory::InMemoryAnalyticsStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAnalyticsStore;

/// Persistence error. Only `Unavailable` is transient; the others fail the
/// same way on every attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Connection, pool or I/O failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filters for feedback listing. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackFilter {
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_to: Option<DateTime<Utc>>,
    pub labels: Option<Vec<SentimentLabel>>,
}

impl FeedbackFilter {
    pub fn matches(&self, record: &FeedbackRecord) -> bool {
        self.created_from.is_none_or(|from| record.created_at >= from)
            && self.created_to.is_none_or(|to| record.created_at < to)
            && self
                .labels
                .as_ref()
                .is_none_or(|labels| labels.contains(&record.sentiment_label))
    }
}

pub trait FeedbackStore: Send + Sync {
    /// Insert a new record. `Conflict` if the id already exists.
    fn insert_feedback(&self, record: &FeedbackRecord) -> StoreResult<()>;

    fn get_feedback(&self, id: FeedbackId) -> StoreResult<Option<FeedbackRecord>>;

    /// Set the sentiment fields of one record.
    fn update_sentiment(
        &self,
        id: FeedbackId,
        label: SentimentLabel,
        confidence: f64,
    ) -> StoreResult<()>;

    /// Unclassified records, oldest first.
    fn list_unclassified(&self, limit: Option<usize>) -> StoreResult<Vec<FeedbackRecord>>;

    /// Records matching `filter`, oldest first.
    fn list_feedback(&self, filter: &FeedbackFilter) -> StoreResult<Vec<FeedbackRecord>>;
}

pub trait RevenueStore: Send + Sync {
    /// Insert or replace the point for `point.period`.
    fn upsert_revenue(&self, point: &RevenuePoint) -> StoreResult<()>;

    /// Full history ordered by period.
    fn revenue_history(&self) -> StoreResult<Vec<RevenuePoint>>;

    /// Write `is_outlier` / `adjusted_amount` for existing periods. All or nothing.
    fn update_outlier_flags(&self, points: &[RevenuePoint]) -> StoreResult<()>;
}

pub trait ForecastStore: Send + Sync {
    /// Append every record of one run, or none of them.
    fn append_forecasts(&self, records: &[ForecastRecord]) -> StoreResult<()>;

    /// Replace the outlier flags of `flags` (matched by period; every period
    /// must exist) and append `records`. Either both writes land or neither.
    fn commit_forecast_run(&self, flags: &[RevenuePoint], records: &[ForecastRecord]) -> StoreResult<()>;

    /// Per target period in `range`, the record with the greatest
    /// `generated_at`; ordered by period.
    fn latest_forecasts(&self, range: PeriodRange) -> StoreResult<Vec<ForecastRecord>>;

    /// Every record for `period`, oldest first.
    fn forecast_history(&self, period: Period) -> StoreResult<Vec<ForecastRecord>>;

    fn latest_generated_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    fn max_target_period(&self) -> StoreResult<Option<Period>>;
}

/// Result of a lease attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    /// A new running run was inserted.
    Acquired(JobRun),
    /// Another run holds the lease.
    Busy(JobRun),
}

/// Counts removed by a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PurgeCounts {
    pub runs: usize,
    pub skips: usize,
}

pub trait JobRunStore: Send + Sync {
    /// Atomically start a run for `job` unless one is already running.
    fn try_start_run(
        &self,
        job: JobName,
        trigger: RunTrigger,
        at: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome>;

    /// Persist the current state of an existing run.
    fn update_run(&self, run: &JobRun) -> StoreResult<()>;

    fn get_run(&self, id: JobRunId) -> StoreResult<Option<JobRun>>;

    /// Most recently started run of `job`.
    fn latest_run(&self, job: JobName) -> StoreResult<Option<JobRun>>;

    /// Runs newest first, optionally for one job.
    fn list_runs(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<JobRun>>;

    fn running_runs(&self) -> StoreResult<Vec<JobRun>>;

    /// Mark every running run as failed with `detail`; returns the updated runs.
    fn reconcile_running(&self, at: DateTime<Utc>, detail: &str) -> StoreResult<Vec<JobRun>>;

    fn record_skip(&self, skip: &OverlapSkip) -> StoreResult<()>;

    /// Skips newest first, optionally for one job.
    fn list_skips(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<OverlapSkip>>;

    /// Delete finished runs and skips older than `cutoff`. Running runs are kept.
    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> StoreResult<PurgeCounts>;
}

/// Everything the analytics core persists.
pub trait AnalyticsStore: FeedbackStore + RevenueStore + ForecastStore + JobRunStore {}

impl<T> AnalyticsStore for T where T: FeedbackStore + RevenueStore + ForecastStore + JobRunStore {}

impl<S> FeedbackStore for Arc<S>
where
    S: FeedbackStore + ?Sized,
{
    fn insert_feedback(&self, record: &FeedbackRecord) -> StoreResult<()> {
        (**self).insert_feedback(record)
    }

    fn get_feedback(&self, id: FeedbackId) -> StoreResult<Option<FeedbackRecord>> {
        (**self).get_feedback(id)
    }

    fn update_sentiment(
        &self,
        id: FeedbackId,
        label: SentimentLabel,
        confidence: f64,
    ) -> StoreResult<()> {
        (**self).update_sentiment(id, label, confidence)
    }

    fn list_unclassified(&self, limit: Option<usize>) -> StoreResult<Vec<FeedbackRecord>> {
        (**self).list_unclassified(limit)
    }

    fn list_feedback(&self, filter: &FeedbackFilter) -> StoreResult<Vec<FeedbackRecord>> {
        (**self).list_feedback(filter)
    }
}

impl<S> RevenueStore for Arc<S>
where
    S: RevenueStore + ?Sized,
{
    fn upsert_revenue(&self, point: &RevenuePoint) -> StoreResult<()> {
        (**self).upsert_revenue(point)
    }

    fn revenue_history(&self) -> StoreResult<Vec<RevenuePoint>> {
        (**self).revenue_history()
    }

    fn update_outlier_flags(&self, points: &[RevenuePoint]) -> StoreResult<()> {
        (**self).update_outlier_flags(points)
    }
}

impl<S> ForecastStore for Arc<S>
where
    S: ForecastStore + ?Sized,
{
    fn append_forecasts(&self, records: &[ForecastRecord]) -> StoreResult<()> {
        (**self).append_forecasts(records)
    }

    fn commit_forecast_run(&self, flags: &[RevenuePoint], records: &[ForecastRecord]) -> StoreResult<()> {
        (**self).commit_forecast_run(flags, records)
    }

    fn latest_forecasts(&self, range: PeriodRange) -> StoreResult<Vec<ForecastRecord>> {
        (**self).latest_forecasts(range)
    }

    fn forecast_history(&self, period: Period) -> StoreResult<Vec<ForecastRecord>> {
        (**self).forecast_history(period)
    }

    fn latest_generated_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        (**self).latest_generated_at()
    }

    fn max_target_period(&self) -> StoreResult<Option<Period>> {
        (**self).max_target_period()
    }
}

impl<S> JobRunStore for Arc<S>
where
    S: JobRunStore + ?Sized,
{
    fn try_start_run(
        &self,
        job: JobName,
        trigger: RunTrigger,
        at: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        (**self).try_start_run(job, trigger, at)
    }

    fn update_run(&self, run: &JobRun) -> StoreResult<()> {
        (**self).update_run(run)
    }

    fn get_run(&self, id: JobRunId) -> StoreResult<Option<JobRun>> {
        (**self).get_run(id)
    }

    fn latest_run(&self, job: JobName) -> StoreResult<Option<JobRun>> {
        (**self).latest_run(job)
    }

    fn list_runs(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<JobRun>> {
        (**self).list_runs(job, limit)
    }

    fn running_runs(&self) -> StoreResult<Vec<JobRun>> {
        (**self).running_runs()
    }

    fn reconcile_running(&self, at: DateTime<Utc>, detail: &str) -> StoreResult<Vec<JobRun>> {
        (**self).reconcile_running(at, detail)
    }

    fn record_skip(&self, skip: &OverlapSkip) -> StoreResult<()> {
        (**self).record_skip(skip)
    }

    fn list_skips(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<OverlapSkip>> {
        (**self).list_skips(job, limit)
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> StoreResult<PurgeCounts> {
        (**self).purge_finished_before(cutoff)
    }
}
