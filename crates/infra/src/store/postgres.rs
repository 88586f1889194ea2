//! Postgres-backed analytics store.
//!
//! The store traits are synchronous (the scheduler runs on std threads), so
//! every call is driven to completion on a tokio runtime handle captured at
//! construction. Calls must come from threads outside that runtime.
//!
//! ## Error Mapping
//!
//! | SQLx error | StoreError |
//! |------------|------------|
//! | Database (unique violation, `23505`) | `Conflict` |
//! | Row decoding / unknown enum text | `Corrupt` |
//! | Pool closed, I/O, timeouts, anything else | `Unavailable` |

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use fitpulse_core::{
    FeedbackId, FeedbackRecord, ForecastRecord, JobName, JobRun, JobRunId, JobRunStatus,
    OverlapSkip, Period, PeriodRange, RevenuePoint, RunTrigger, SentimentLabel,
};

use super::{
    FeedbackFilter, FeedbackStore, ForecastStore, JobRunStore, LeaseOutcome, PurgeCounts,
    RevenueStore, StoreError, StoreResult,
};

const SCHEMA: &str = include_str!("../../migrations/0001_analytics.sql");

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("{operation}: {db}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("{operation}: {e}"))
        }
        _ => StoreError::Unavailable(format!("{operation}: {e}")),
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row
        .try_get(column)
        .map_err(|e| map_sqlx_error("decode", e))?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Corrupt(format!("{column} = {raw:?}: {e}")))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|e| map_sqlx_error("decode", e))
}

fn feedback_from_row(row: &PgRow) -> StoreResult<FeedbackRecord> {
    Ok(FeedbackRecord {
        id: FeedbackId::from_uuid(get::<Uuid>(row, "id")?),
        raw_text: get(row, "raw_text")?,
        created_at: get(row, "created_at")?,
        sentiment_label: parse_column(row, "sentiment_label")?,
        sentiment_confidence: get(row, "sentiment_confidence")?,
    })
}

fn revenue_from_row(row: &PgRow) -> StoreResult<RevenuePoint> {
    Ok(RevenuePoint {
        period: parse_column(row, "period")?,
        actual_amount: get(row, "actual_amount")?,
        is_outlier: get(row, "is_outlier")?,
        adjusted_amount: get(row, "adjusted_amount")?,
    })
}

fn forecast_from_row(row: &PgRow) -> StoreResult<ForecastRecord> {
    Ok(ForecastRecord {
        target_period: parse_column(row, "target_period")?,
        point_estimate: get(row, "point_estimate")?,
        lower_bound: get(row, "lower_bound")?,
        upper_bound: get(row, "upper_bound")?,
        confidence_level: get(row, "confidence_level")?,
        generated_at: get(row, "generated_at")?,
        model_version: get(row, "model_version")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<JobRun> {
    let attempts: i32 = get(row, "attempts")?;
    Ok(JobRun {
        id: JobRunId::from_uuid(get::<Uuid>(row, "id")?),
        job_name: parse_column(row, "job_name")?,
        trigger: parse_column(row, "trigger")?,
        started_at: get(row, "started_at")?,
        finished_at: get(row, "finished_at")?,
        status: parse_column::<JobRunStatus>(row, "status")?,
        error_detail: get(row, "error_detail")?,
        attempts: attempts.max(0) as u32,
    })
}

fn skip_from_row(row: &PgRow) -> StoreResult<OverlapSkip> {
    Ok(OverlapSkip {
        job_name: parse_column(row, "job_name")?,
        trigger: parse_column(row, "trigger")?,
        skipped_at: get(row, "skipped_at")?,
        running_run_id: JobRunId::from_uuid(get::<Uuid>(row, "running_run_id")?),
    })
}

const RUN_COLUMNS: &str = "id, job_name, trigger, started_at, finished_at, status, error_detail, attempts";
const FORECAST_COLUMNS: &str =
    "target_period, point_estimate, lower_bound, upper_bound, confidence_level, generated_at, model_version";

async fn write_outlier_flags(conn: &mut PgConnection, points: &[RevenuePoint]) -> StoreResult<()> {
    for point in points {
        let result = sqlx::query(
            "UPDATE revenue SET is_outlier = $2, adjusted_amount = $3 WHERE period = $1",
        )
        .bind(point.period.to_string())
        .bind(point.is_outlier)
        .bind(point.adjusted_amount)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_outlier_flags", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("revenue for {}", point.period)));
        }
    }
    Ok(())
}

async fn insert_forecasts(conn: &mut PgConnection, records: &[ForecastRecord]) -> StoreResult<()> {
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO forecasts (
                target_period, point_estimate, lower_bound, upper_bound,
                confidence_level, generated_at, model_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.target_period.to_string())
        .bind(record.point_estimate)
        .bind(record.lower_bound)
        .bind(record.upper_bound)
        .bind(record.confidence_level)
        .bind(record.generated_at)
        .bind(&record.model_version)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("append_forecasts", e))?;
    }
    Ok(())
}

/// Postgres-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PostgresAnalyticsStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresAnalyticsStore {
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect and apply the schema.
    pub fn connect(database_url: &str, runtime: tokio::runtime::Handle) -> StoreResult<Self> {
        let pool = runtime
            .block_on(PgPoolOptions::new().max_connections(5).connect(database_url))
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool, runtime);
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> StoreResult<()> {
        self.block(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
            debug!("analytics schema applied");
            Ok(())
        })
    }

    fn block<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl FeedbackStore for PostgresAnalyticsStore {
    #[instrument(skip(self, record), fields(feedback_id = %record.id), err)]
    fn insert_feedback(&self, record: &FeedbackRecord) -> StoreResult<()> {
        self.block(async {
            sqlx::query(
                r#"
                INSERT INTO feedback (id, raw_text, created_at, sentiment_label, sentiment_confidence)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(&record.raw_text)
            .bind(record.created_at)
            .bind(record.sentiment_label.as_str())
            .bind(record.sentiment_confidence)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_feedback", e))?;
            Ok(())
        })
    }

    fn get_feedback(&self, id: FeedbackId) -> StoreResult<Option<FeedbackRecord>> {
        self.block(async {
            let row = sqlx::query("SELECT * FROM feedback WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_feedback", e))?;
            row.as_ref().map(feedback_from_row).transpose()
        })
    }

    fn update_sentiment(
        &self,
        id: FeedbackId,
        label: SentimentLabel,
        confidence: f64,
    ) -> StoreResult<()> {
        if !label.is_classified() || !(0.0..=1.0).contains(&confidence) {
            return Err(StoreError::Conflict(format!(
                "invalid classification {label} ({confidence}) for feedback {id}"
            )));
        }
        self.block(async {
            let result = sqlx::query(
                "UPDATE feedback SET sentiment_label = $2, sentiment_confidence = $3 WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(label.as_str())
            .bind(confidence)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_sentiment", e))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("feedback {id}")));
            }
            Ok(())
        })
    }

    fn list_unclassified(&self, limit: Option<usize>) -> StoreResult<Vec<FeedbackRecord>> {
        self.block(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM feedback
                WHERE sentiment_label = 'unclassified'
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                "#,
            )
            .bind(limit.map(|l| l as i64))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_unclassified", e))?;
            rows.iter().map(feedback_from_row).collect()
        })
    }

    fn list_feedback(&self, filter: &FeedbackFilter) -> StoreResult<Vec<FeedbackRecord>> {
        let labels: Option<Vec<String>> = filter
            .labels
            .as_ref()
            .map(|labels| labels.iter().map(|l| l.as_str().to_string()).collect());
        self.block(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM feedback
                WHERE ($1::timestamptz IS NULL OR created_at >= $1)
                  AND ($2::timestamptz IS NULL OR created_at < $2)
                  AND ($3::text[] IS NULL OR sentiment_label = ANY($3))
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(labels)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_feedback", e))?;
            rows.iter().map(feedback_from_row).collect()
        })
    }
}

impl RevenueStore for PostgresAnalyticsStore {
    fn upsert_revenue(&self, point: &RevenuePoint) -> StoreResult<()> {
        self.block(async {
            sqlx::query(
                r#"
                INSERT INTO revenue (period, actual_amount, is_outlier, adjusted_amount)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (period) DO UPDATE SET
                    actual_amount = EXCLUDED.actual_amount,
                    is_outlier = EXCLUDED.is_outlier,
                    adjusted_amount = EXCLUDED.adjusted_amount
                "#,
            )
            .bind(point.period.to_string())
            .bind(point.actual_amount)
            .bind(point.is_outlier)
            .bind(point.adjusted_amount)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_revenue", e))?;
            Ok(())
        })
    }

    fn revenue_history(&self) -> StoreResult<Vec<RevenuePoint>> {
        self.block(async {
            let rows = sqlx::query("SELECT * FROM revenue")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("revenue_history", e))?;
            let mut points = rows.iter().map(revenue_from_row).collect::<StoreResult<Vec<_>>>()?;
            // `period` is stored as text; sort on the parsed value.
            points.sort_by_key(|p| p.period);
            Ok(points)
        })
    }

    #[instrument(skip(self, points), fields(points = points.len()), err)]
    fn update_outlier_flags(&self, points: &[RevenuePoint]) -> StoreResult<()> {
        self.block(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            // Dropping `tx` on error rolls it back.
            write_outlier_flags(&mut *tx, points).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }
}

impl ForecastStore for PostgresAnalyticsStore {
    #[instrument(skip(self, records), fields(records = records.len()), err)]
    fn append_forecasts(&self, records: &[ForecastRecord]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.block(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            insert_forecasts(&mut *tx, records).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    #[instrument(skip(self, flags, records), fields(flags = flags.len(), records = records.len()), err)]
    fn commit_forecast_run(&self, flags: &[RevenuePoint], records: &[ForecastRecord]) -> StoreResult<()> {
        self.block(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            write_outlier_flags(&mut *tx, flags).await?;
            insert_forecasts(&mut *tx, records).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    fn latest_forecasts(&self, range: PeriodRange) -> StoreResult<Vec<ForecastRecord>> {
        // `YYYY-MM` text sorts chronologically for four-digit years.
        let sql = format!(
            r#"
            SELECT DISTINCT ON (target_period) {FORECAST_COLUMNS}
            FROM forecasts
            WHERE target_period >= $1 AND target_period <= $2
            ORDER BY target_period ASC, generated_at DESC, id DESC
            "#
        );
        self.block(async {
            let rows = sqlx::query(&sql)
                .bind(range.start.to_string())
                .bind(range.end.to_string())
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("latest_forecasts", e))?;
            rows.iter().map(forecast_from_row).collect()
        })
    }

    fn forecast_history(&self, period: Period) -> StoreResult<Vec<ForecastRecord>> {
        let sql = format!(
            "SELECT {FORECAST_COLUMNS} FROM forecasts WHERE target_period = $1 ORDER BY generated_at ASC, id ASC"
        );
        self.block(async {
            let rows = sqlx::query(&sql)
                .bind(period.to_string())
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("forecast_history", e))?;
            rows.iter().map(forecast_from_row).collect()
        })
    }

    fn latest_generated_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.block(async {
            let row = sqlx::query("SELECT MAX(generated_at) AS latest FROM forecasts")
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("latest_generated_at", e))?;
            get(&row, "latest")
        })
    }

    fn max_target_period(&self) -> StoreResult<Option<Period>> {
        self.block(async {
            let row = sqlx::query("SELECT MAX(target_period) AS latest FROM forecasts")
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("max_target_period", e))?;
            let raw: Option<String> = get(&row, "latest")?;
            raw.map(|r| {
                r.parse()
                    .map_err(|e| StoreError::Corrupt(format!("target_period = {r:?}: {e}")))
            })
            .transpose()
        })
    }
}

impl JobRunStore for PostgresAnalyticsStore {
    #[instrument(skip(self), fields(job = %job), err)]
    fn try_start_run(
        &self,
        job: JobName,
        trigger: RunTrigger,
        at: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        let run = JobRun::start(job, trigger, at);
        self.block(async {
            // The partial unique index on running rows is the lease.
            let inserted = sqlx::query(
                r#"
                INSERT INTO job_runs (id, job_name, trigger, started_at, status, attempts)
                VALUES ($1, $2, $3, $4, 'running', 0)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(run.id.as_uuid())
            .bind(job.as_str())
            .bind(trigger.as_str())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("try_start_run", e))?;

            if inserted.rows_affected() == 1 {
                return Ok(LeaseOutcome::Acquired(run));
            }

            let sql = format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE job_name = $1 AND status = 'running'");
            let holder = sqlx::query(&sql)
                .bind(job.as_str())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("try_start_run", e))?;
            match holder {
                Some(row) => Ok(LeaseOutcome::Busy(run_from_row(&row)?)),
                // The holder finished between the insert and the lookup.
                None => Err(StoreError::Conflict(format!("lease for {job} changed hands"))),
            }
        })
    }

    fn update_run(&self, run: &JobRun) -> StoreResult<()> {
        self.block(async {
            let result = sqlx::query(
                r#"
                UPDATE job_runs
                SET finished_at = $2, status = $3, error_detail = $4, attempts = $5
                WHERE id = $1
                "#,
            )
            .bind(run.id.as_uuid())
            .bind(run.finished_at)
            .bind(run.status.as_str())
            .bind(&run.error_detail)
            .bind(run.attempts as i32)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_run", e))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("job run {}", run.id)));
            }
            Ok(())
        })
    }

    fn get_run(&self, id: JobRunId) -> StoreResult<Option<JobRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = $1");
        self.block(async {
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_run", e))?;
            row.as_ref().map(run_from_row).transpose()
        })
    }

    fn latest_run(&self, job: JobName) -> StoreResult<Option<JobRun>> {
        Ok(self.list_runs(Some(job), 1)?.into_iter().next())
    }

    fn list_runs(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<JobRun>> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM job_runs
            WHERE ($1::text IS NULL OR job_name = $1)
            ORDER BY started_at DESC, id DESC
            LIMIT $2
            "#
        );
        self.block(async {
            let rows = sqlx::query(&sql)
                .bind(job.map(|j| j.as_str()))
                .bind(limit as i64)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_runs", e))?;
            rows.iter().map(run_from_row).collect()
        })
    }

    fn running_runs(&self) -> StoreResult<Vec<JobRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE status = 'running' ORDER BY started_at ASC");
        self.block(async {
            let rows = sqlx::query(&sql)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("running_runs", e))?;
            rows.iter().map(run_from_row).collect()
        })
    }

    fn reconcile_running(&self, at: DateTime<Utc>, detail: &str) -> StoreResult<Vec<JobRun>> {
        let sql = format!(
            r#"
            UPDATE job_runs
            SET status = 'failed', finished_at = $1, error_detail = $2
            WHERE status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        );
        self.block(async {
            let rows = sqlx::query(&sql)
                .bind(at)
                .bind(detail)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("reconcile_running", e))?;
            rows.iter().map(run_from_row).collect()
        })
    }

    fn record_skip(&self, skip: &OverlapSkip) -> StoreResult<()> {
        self.block(async {
            sqlx::query(
                r#"
                INSERT INTO job_overlap_skips (job_name, trigger, skipped_at, running_run_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(skip.job_name.as_str())
            .bind(skip.trigger.as_str())
            .bind(skip.skipped_at)
            .bind(skip.running_run_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_skip", e))?;
            Ok(())
        })
    }

    fn list_skips(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<OverlapSkip>> {
        self.block(async {
            let rows = sqlx::query(
                r#"
                SELECT job_name, trigger, skipped_at, running_run_id FROM job_overlap_skips
                WHERE ($1::text IS NULL OR job_name = $1)
                ORDER BY skipped_at DESC, id DESC
                LIMIT $2
                "#,
            )
            .bind(job.map(|j| j.as_str()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_skips", e))?;
            rows.iter().map(skip_from_row).collect()
        })
    }

    #[instrument(skip(self), err)]
    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> StoreResult<PurgeCounts> {
        self.block(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let runs = sqlx::query(
                "DELETE FROM job_runs WHERE status <> 'running' AND finished_at < $1",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_runs", e))?;
            let skips = sqlx::query("DELETE FROM job_overlap_skips WHERE skipped_at < $1")
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("purge_skips", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(PurgeCounts {
                runs: runs.rows_affected() as usize,
                skips: skips.rows_affected() as usize,
            })
        })
    }
}
