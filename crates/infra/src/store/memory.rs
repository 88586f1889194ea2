//! In-memory store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use fitpulse_core::{
    FeedbackId, FeedbackRecord, ForecastRecord, JobName, JobRun, JobRunId, OverlapSkip, Period,
    PeriodRange, RevenuePoint, RunTrigger, SentimentLabel,
};

use super::{
    FeedbackFilter, FeedbackStore, ForecastStore, JobRunStore, LeaseOutcome, PurgeCounts,
    RevenueStore, StoreError, StoreResult,
};

fn read<T>(lock: &RwLock<T>) -> StoreResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> StoreResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
}

/// Checks every period before touching any, so a miss changes nothing.
fn apply_outlier_flags(map: &mut BTreeMap<Period, RevenuePoint>, points: &[RevenuePoint]) -> StoreResult<()> {
    if let Some(missing) = points.iter().find(|p| !map.contains_key(&p.period)) {
        return Err(StoreError::NotFound(format!("revenue for {}", missing.period)));
    }
    for point in points {
        if let Some(stored) = map.get_mut(&point.period) {
            stored.is_outlier = point.is_outlier;
            stored.adjusted_amount = point.adjusted_amount;
        }
    }
    Ok(())
}

/// All record families behind independent locks.
#[derive(Debug, Default)]
pub struct InMemoryAnalyticsStore {
    feedback: RwLock<HashMap<FeedbackId, FeedbackRecord>>,
    revenue: RwLock<BTreeMap<Period, RevenuePoint>>,
    forecasts: RwLock<Vec<ForecastRecord>>,
    runs: RwLock<HashMap<JobRunId, JobRun>>,
    skips: RwLock<Vec<OverlapSkip>>,
}

impl InMemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl FeedbackStore for InMemoryAnalyticsStore {
    fn insert_feedback(&self, record: &FeedbackRecord) -> StoreResult<()> {
        let mut map = write(&self.feedback)?;
        if map.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("feedback {} already exists", record.id)));
        }
        map.insert(record.id, record.clone());
        Ok(())
    }

    fn get_feedback(&self, id: FeedbackId) -> StoreResult<Option<FeedbackRecord>> {
        Ok(read(&self.feedback)?.get(&id).cloned())
    }

    fn update_sentiment(
        &self,
        id: FeedbackId,
        label: SentimentLabel,
        confidence: f64,
    ) -> StoreResult<()> {
        let mut map = write(&self.feedback)?;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("feedback {id}")))?;
        let mut updated = record.clone();
        updated
            .classify(label, confidence)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        *record = updated;
        Ok(())
    }

    fn list_unclassified(&self, limit: Option<usize>) -> StoreResult<Vec<FeedbackRecord>> {
        let filter = FeedbackFilter {
            labels: Some(vec![SentimentLabel::Unclassified]),
            ..FeedbackFilter::default()
        };
        let mut out = self.list_feedback(&filter)?;
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn list_feedback(&self, filter: &FeedbackFilter) -> StoreResult<Vec<FeedbackRecord>> {
        let map = read(&self.feedback)?;
        let mut out: Vec<_> = map.values().filter(|r| filter.matches(r)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

impl RevenueStore for InMemoryAnalyticsStore {
    fn upsert_revenue(&self, point: &RevenuePoint) -> StoreResult<()> {
        write(&self.revenue)?.insert(point.period, point.clone());
        Ok(())
    }

    fn revenue_history(&self) -> StoreResult<Vec<RevenuePoint>> {
        Ok(read(&self.revenue)?.values().cloned().collect())
    }

    fn update_outlier_flags(&self, points: &[RevenuePoint]) -> StoreResult<()> {
        apply_outlier_flags(&mut *write(&self.revenue)?, points)
    }
}

impl ForecastStore for InMemoryAnalyticsStore {
    fn append_forecasts(&self, records: &[ForecastRecord]) -> StoreResult<()> {
        let mut all = write(&self.forecasts)?;
        all.extend(records.iter().cloned());
        Ok(())
    }

    fn commit_forecast_run(&self, flags: &[RevenuePoint], records: &[ForecastRecord]) -> StoreResult<()> {
        // Lock order: revenue, then forecasts.
        let mut revenue = write(&self.revenue)?;
        let mut all = write(&self.forecasts)?;
        apply_outlier_flags(&mut revenue, flags)?;
        all.extend(records.iter().cloned());
        Ok(())
    }

    fn latest_forecasts(&self, range: PeriodRange) -> StoreResult<Vec<ForecastRecord>> {
        let all = read(&self.forecasts)?;
        let mut latest: BTreeMap<Period, &ForecastRecord> = BTreeMap::new();
        for record in all.iter().filter(|r| range.contains(r.target_period)) {
            let newer = latest
                .get(&record.target_period)
                .is_none_or(|current| record.generated_at >= current.generated_at);
            if newer {
                latest.insert(record.target_period, record);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    fn forecast_history(&self, period: Period) -> StoreResult<Vec<ForecastRecord>> {
        let all = read(&self.forecasts)?;
        let mut out: Vec<_> = all.iter().filter(|r| r.target_period == period).cloned().collect();
        out.sort_by_key(|r| r.generated_at);
        Ok(out)
    }

    fn latest_generated_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(read(&self.forecasts)?.iter().map(|r| r.generated_at).max())
    }

    fn max_target_period(&self) -> StoreResult<Option<Period>> {
        Ok(read(&self.forecasts)?.iter().map(|r| r.target_period).max())
    }
}

impl JobRunStore for InMemoryAnalyticsStore {
    fn try_start_run(
        &self,
        job: JobName,
        trigger: RunTrigger,
        at: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        // Check and insert under one write lock.
        let mut runs = write(&self.runs)?;
        if let Some(running) = runs.values().find(|r| r.job_name == job && r.is_running()) {
            return Ok(LeaseOutcome::Busy(running.clone()));
        }
        let run = JobRun::start(job, trigger, at);
        runs.insert(run.id, run.clone());
        Ok(LeaseOutcome::Acquired(run))
    }

    fn update_run(&self, run: &JobRun) -> StoreResult<()> {
        let mut runs = write(&self.runs)?;
        let stored = runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::NotFound(format!("job run {}", run.id)))?;
        *stored = run.clone();
        Ok(())
    }

    fn get_run(&self, id: JobRunId) -> StoreResult<Option<JobRun>> {
        Ok(read(&self.runs)?.get(&id).cloned())
    }

    fn latest_run(&self, job: JobName) -> StoreResult<Option<JobRun>> {
        Ok(self.list_runs(Some(job), 1)?.into_iter().next())
    }

    fn list_runs(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<JobRun>> {
        let runs = read(&self.runs)?;
        let mut out: Vec<_> = runs
            .values()
            .filter(|r| job.is_none_or(|j| r.job_name == j))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    fn running_runs(&self) -> StoreResult<Vec<JobRun>> {
        let runs = read(&self.runs)?;
        let mut out: Vec<_> = runs.values().filter(|r| r.is_running()).cloned().collect();
        out.sort_by_key(|r| r.started_at);
        Ok(out)
    }

    fn reconcile_running(&self, at: DateTime<Utc>, detail: &str) -> StoreResult<Vec<JobRun>> {
        let mut runs = write(&self.runs)?;
        let mut reconciled = Vec::new();
        for run in runs.values_mut().filter(|r| r.is_running()) {
            run.fail(at, detail);
            reconciled.push(run.clone());
        }
        Ok(reconciled)
    }

    fn record_skip(&self, skip: &OverlapSkip) -> StoreResult<()> {
        write(&self.skips)?.push(skip.clone());
        Ok(())
    }

    fn list_skips(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<OverlapSkip>> {
        let skips = read(&self.skips)?;
        let mut out: Vec<_> = skips
            .iter()
            .filter(|s| job.is_none_or(|j| s.job_name == j))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.skipped_at.cmp(&a.skipped_at));
        out.truncate(limit);
        Ok(out)
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> StoreResult<PurgeCounts> {
        let mut counts = PurgeCounts::default();
        {
            let mut runs = write(&self.runs)?;
            let before = runs.len();
            runs.retain(|_, r| r.is_running() || r.finished_at.is_none_or(|f| f >= cutoff));
            counts.runs = before - runs.len();
        }
        {
            let mut skips = write(&self.skips)?;
            let before = skips.len();
            skips.retain(|s| s.skipped_at >= cutoff);
            counts.skips = before - skips.len();
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fitpulse_core::{INTERRUPTED_BY_RESTART, JobRunStatus};

    fn p(s: &str) -> Period {
        s.parse().unwrap()
    }

    fn forecast(period: &str, point: f64, at: DateTime<Utc>) -> ForecastRecord {
        ForecastRecord::new(p(period), point, point - 10.0, point + 10.0, 0.8, at, "test").unwrap()
    }

    #[test]
    fn lease_admits_one_running_run_per_job() {
        let store = InMemoryAnalyticsStore::new();
        let now = Utc::now();

        let first = match store.try_start_run(JobName::ForecastGenerate, RunTrigger::Manual, now).unwrap() {
            LeaseOutcome::Acquired(run) => run,
            other => panic!("expected lease, got {other:?}"),
        };
        match store.try_start_run(JobName::ForecastGenerate, RunTrigger::Scheduled, now).unwrap() {
            LeaseOutcome::Busy(running) => assert_eq!(running.id, first.id),
            other => panic!("expected busy, got {other:?}"),
        }
        // Other jobs are independent.
        assert!(matches!(
            store.try_start_run(JobName::LogCleanup, RunTrigger::Scheduled, now).unwrap(),
            LeaseOutcome::Acquired(_)
        ));

        let mut finished = first.clone();
        finished.succeed(now);
        store.update_run(&finished).unwrap();
        assert!(matches!(
            store.try_start_run(JobName::ForecastGenerate, RunTrigger::Manual, now).unwrap(),
            LeaseOutcome::Acquired(_)
        ));
    }

    #[test]
    fn latest_forecast_is_greatest_generated_at_per_period() {
        let store = InMemoryAnalyticsStore::new();
        let old = Utc::now() - Duration::days(30);
        let new = Utc::now();
        store
            .append_forecasts(&[forecast("2025-01", 100.0, old), forecast("2025-02", 110.0, old)])
            .unwrap();
        store.append_forecasts(&[forecast("2025-01", 150.0, new)]).unwrap();

        let latest = store
            .latest_forecasts(PeriodRange::new(p("2025-01"), p("2025-03")).unwrap())
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].point_estimate, 150.0);
        assert_eq!(latest[1].point_estimate, 110.0);
        assert_eq!(store.forecast_history(p("2025-01")).unwrap().len(), 2);
        assert_eq!(store.latest_generated_at().unwrap(), Some(new));
        assert_eq!(store.max_target_period().unwrap(), Some(p("2025-02")));
        assert!(store
            .latest_forecasts(PeriodRange::new(p("2026-01"), p("2026-03")).unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sentiment_updates_are_validated() {
        let store = InMemoryAnalyticsStore::new();
        let record = FeedbackRecord::new("ok", Utc::now());
        store.insert_feedback(&record).unwrap();
        assert!(matches!(store.insert_feedback(&record), Err(StoreError::Conflict(_))));

        assert!(store.update_sentiment(record.id, SentimentLabel::Neutral, 2.0).is_err());
        assert_eq!(store.list_unclassified(None).unwrap().len(), 1);

        store.update_sentiment(record.id, SentimentLabel::Neutral, 0.6).unwrap();
        assert!(store.list_unclassified(None).unwrap().is_empty());
        assert!(matches!(
            store.update_sentiment(FeedbackId::new(), SentimentLabel::Neutral, 0.6),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn outlier_flag_updates_are_all_or_nothing() {
        let store = InMemoryAnalyticsStore::new();
        let mut a = RevenuePoint::new(p("2025-01"), 100.0).unwrap();
        store.upsert_revenue(&a).unwrap();
        a.flag_outlier(80.0);
        let stranger = RevenuePoint::new(p("2025-02"), 1.0).unwrap();

        assert!(store.update_outlier_flags(&[a.clone(), stranger]).is_err());
        assert!(!store.revenue_history().unwrap()[0].is_outlier);

        store.update_outlier_flags(&[a]).unwrap();
        let stored = &store.revenue_history().unwrap()[0];
        assert!(stored.is_outlier);
        assert_eq!(stored.actual_amount, 100.0);
        assert_eq!(stored.adjusted_amount, 80.0);
    }

    #[test]
    fn forecast_run_commit_writes_flags_and_records_together() {
        let store = InMemoryAnalyticsStore::new();
        let mut a = RevenuePoint::new(p("2025-01"), 100.0).unwrap();
        store.upsert_revenue(&a).unwrap();
        a.flag_outlier(80.0);
        let stranger = RevenuePoint::new(p("2025-02"), 1.0).unwrap();
        let record = forecast("2025-02", 90.0, Utc::now());

        let err = store
            .commit_forecast_run(&[a.clone(), stranger], std::slice::from_ref(&record))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!store.revenue_history().unwrap()[0].is_outlier);
        assert_eq!(store.max_target_period().unwrap(), None);

        store.commit_forecast_run(&[a], &[record]).unwrap();
        assert!(store.revenue_history().unwrap()[0].is_outlier);
        assert_eq!(store.max_target_period().unwrap(), Some(p("2025-02")));
    }

    #[test]
    fn reconcile_and_purge_respect_running_runs() {
        let store = InMemoryAnalyticsStore::new();
        let long_ago = Utc::now() - Duration::days(90);

        let LeaseOutcome::Acquired(mut done) =
            store.try_start_run(JobName::SentimentSweep, RunTrigger::Scheduled, long_ago).unwrap()
        else {
            panic!("lease");
        };
        done.succeed(long_ago);
        store.update_run(&done).unwrap();
        let LeaseOutcome::Acquired(stale) =
            store.try_start_run(JobName::ForecastRefresh, RunTrigger::Scheduled, long_ago).unwrap()
        else {
            panic!("lease");
        };
        store
            .record_skip(&OverlapSkip {
                job_name: JobName::ForecastRefresh,
                trigger: RunTrigger::Scheduled,
                skipped_at: long_ago,
                running_run_id: stale.id,
            })
            .unwrap();

        let counts = store.purge_finished_before(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(counts, PurgeCounts { runs: 1, skips: 1 });
        assert!(store.get_run(stale.id).unwrap().is_some());

        let reconciled = store.reconcile_running(Utc::now(), INTERRUPTED_BY_RESTART).unwrap();
        assert_eq!(reconciled.len(), 1);
        let stale = store.get_run(stale.id).unwrap().unwrap();
        assert_eq!(stale.status, JobRunStatus::Failed);
        assert_eq!(stale.error_detail.as_deref(), Some(INTERRUPTED_BY_RESTART));
        assert!(store.running_runs().unwrap().is_empty());
    }

    #[test]
    fn feedback_filter_by_range_and_label() {
        let store = InMemoryAnalyticsStore::new();
        let base = Utc::now();
        for (i, label) in [SentimentLabel::Positive, SentimentLabel::Negative, SentimentLabel::Positive]
            .into_iter()
            .enumerate()
        {
            let mut r = FeedbackRecord::new(format!("r{i}"), base + Duration::hours(i as i64));
            r.classify(label, 0.9).unwrap();
            store.insert_feedback(&r).unwrap();
        }
        let filter = FeedbackFilter {
            created_from: Some(base + Duration::minutes(30)),
            created_to: None,
            labels: Some(vec![SentimentLabel::Positive]),
        };
        let found = store.list_feedback(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].raw_text, "r2");
    }
}
