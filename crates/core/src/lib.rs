//! `fitpulse-core`: shared record types for the analytics core.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, calendar periods, and the feedback / revenue / forecast / job-run
//! records that the analytical pipelines read and write.

pub mod error;
pub mod feedback;
pub mod forecast;
pub mod id;
pub mod job_run;
pub mod period;
pub mod revenue;

pub use error::{DomainError, DomainResult};
pub use feedback::{FeedbackRecord, SentimentLabel};
pub use forecast::ForecastRecord;
pub use id::{FeedbackId, JobRunId};
pub use job_run::{
    INTERRUPTED, INTERRUPTED_BY_RESTART, JobName, JobRun, JobRunStatus, OverlapSkip, RunTrigger,
};
pub use period::{Period, PeriodRange};
pub use revenue::RevenuePoint;
