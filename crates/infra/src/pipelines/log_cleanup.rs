//! `log-cleanup`: purge finished job runs and overlap skips past retention.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::jobs::{JobAction, JobContext, JobError};
use crate::store::{JobRunStore, PurgeCounts};

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

pub struct LogCleanup<S: ?Sized> {
    store: Arc<S>,
    retention: Duration,
}

impl<S> LogCleanup<S>
where
    S: JobRunStore + ?Sized,
{
    pub fn new(store: Arc<S>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Running runs are never purged, whatever their age.
    pub fn purge_at(&self, ctx: &JobContext, now: DateTime<Utc>) -> Result<PurgeCounts, JobError> {
        ctx.checkpoint()?;
        let cutoff = now - self.retention;
        let purged = self.store.purge_finished_before(cutoff)?;
        info!(
            job = %ctx.job,
            run_id = %ctx.run_id,
            cutoff = %cutoff,
            runs = purged.runs,
            skips = purged.skips,
            "job history purged"
        );
        Ok(purged)
    }
}

impl<S> JobAction for LogCleanup<S>
where
    S: JobRunStore + ?Sized + 'static,
{
    fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.purge_at(ctx, Utc::now()).map(|_| ())
    }
}
