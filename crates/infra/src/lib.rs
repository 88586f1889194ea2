//! Infrastructure layer: persistence, job scheduling, job pipelines, config.

pub mod config;
pub mod jobs;
pub mod pipelines;
pub mod store;

pub use config::{AnalyticsConfig, ConfigError};
pub use jobs::{
    Cadence, JobAction, JobContext, JobError, JobScheduler, JobSchedulerHandle, JobSpec,
    JobStatusView, RejectReason, RetryPolicy, ScheduleError, ShutdownSignal, TriggerOutcome,
};
pub use pipelines::{ForecastPipeline, LogCleanup, SentimentSweep, SharedClassifier};
pub use store::{
    AnalyticsStore, FeedbackFilter, FeedbackStore, ForecastStore, InMemoryAnalyticsStore,
    JobRunStore, LeaseOutcome, PurgeCounts, RevenueStore, StoreError, StoreResult,
};
#[cfg(feature = "postgres")]
pub use store::PostgresAnalyticsStore;
