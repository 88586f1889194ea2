use thiserror::Error;

use fitpulse_ai::AiError;
use fitpulse_core::{DomainError, JobName, JobRunId};

use crate::store::StoreError;

/// Failure of a single job action attempt.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("analysis failed: {0}")]
    Analysis(#[from] AiError),

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid record: {0}")]
    Domain(#[from] DomainError),

    /// A prerequisite (e.g. a trained model) is missing.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("job action panicked: {0}")]
    Panicked(String),

    /// Shutdown was requested while the run was in progress.
    #[error("interrupted")]
    Interrupted,
}

impl JobError {
    /// Only transient persistence failures are retried within a run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Persistence(e) if e.is_transient())
    }
}


/// Errors raised by the scheduler itself.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// A trigger arrived while the job was running and was dropped.
    #[error("{job} is already running (run {running_run_id})")]
    OverlapSkipped {
        job: JobName,
        running_run_id: JobRunId,
    },

    #[error("job {0} is not registered")]
    UnknownJob(JobName),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("invalid cadence {0:?}: {1}")]
    InvalidCadence(String, String),

    #[error("invalid backoff strategy {0:?}: expected fixed, exponential or linear")]
    InvalidBackoff(String),

    #[error("failed to spawn runner for {job}: {reason}")]
    Spawn { job: JobName, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
