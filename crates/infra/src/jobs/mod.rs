//! Recurring jobs with at most one concurrent run per job.
//!
//! ## Design
//!
//! - Each job has a `Cadence` and a `RetryPolicy`
//! - A trigger takes the job's lease in the store (`JobRunStore::try_start_run`);
//!   a trigger that finds the job running is skipped and recorded
//! - Runs execute on a dedicated thread per job; persistence failures are
//!   retried inside the run with backoff
//! - Shutdown is cooperative: actions call `JobContext::checkpoint` and
//!   interrupted runs are failed with detail `"interrupted"`
//!
//! ## Components
//!
//! - `JobScheduler`: registration and startup reconciliation
//! - `JobSchedulerHandle`: trigger, status, shutdown
//! - `JobAction`: the work of one job

pub mod error;
pub mod scheduler;
pub mod types;

pub use error::{JobError, ScheduleError};
pub use scheduler::{
    JobAction, JobContext, JobScheduler, JobSchedulerHandle, JobStatusView, ShutdownSignal,
};
pub use types::{BackoffStrategy, Cadence, JobSpec, RejectReason, RetryPolicy, TriggerOutcome};
