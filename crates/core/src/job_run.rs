//! Scheduled job identities and run records.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::JobRunId;

/// `error_detail` recorded for runs cut short by shutdown.
pub const INTERRUPTED: &str = "interrupted";

/// `error_detail` recorded by the startup reconciliation sweep.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted: process restarted before completion";

/// The four scheduled job kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobName {
    SentimentSweep,
    ForecastRefresh,
    ForecastGenerate,
    LogCleanup,
}

impl JobName {
    pub const ALL: [JobName; 4] = [
        JobName::SentimentSweep,
        JobName::ForecastRefresh,
        JobName::ForecastGenerate,
        JobName::LogCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::SentimentSweep => "sentiment-sweep",
            JobName::ForecastRefresh => "forecast-refresh",
            JobName::ForecastGenerate => "forecast-generate",
            JobName::LogCleanup => "log-cleanup",
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        JobName::ALL
            .into_iter()
            .find(|job| job.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unknown job name: {s:?}")))
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Succeeded => "succeeded",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobRunStatus::Running)
    }
}

impl FromStr for JobRunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobRunStatus::Running),
            "succeeded" => Ok(JobRunStatus::Succeeded),
            "failed" => Ok(JobRunStatus::Failed),
            _ => Err(DomainError::validation(format!("unknown job run status: {s:?}"))),
        }
    }
}

/// What caused a run to start.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    Startup,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
            RunTrigger::Startup => "startup",
        }
    }
}

impl FromStr for RunTrigger {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "manual" => Ok(RunTrigger::Manual),
            "startup" => Ok(RunTrigger::Startup),
            _ => Err(DomainError::validation(format!("unknown run trigger: {s:?}"))),
        }
    }
}

/// One execution of a job.
///
/// A run with `status == Running` doubles as the job's lease: the store admits
/// at most one such run per `job_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub job_name: JobName,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobRunStatus,
    pub error_detail: Option<String>,
    /// Executions of the job action within this run (retries included).
    pub attempts: u32,
}

impl JobRun {
    /// A new run in `Running` state.
    pub fn start(job_name: JobName, trigger: RunTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            id: JobRunId::new(),
            job_name,
            trigger,
            started_at,
            finished_at: None,
            status: JobRunStatus::Running,
            error_detail: None,
            attempts: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobRunStatus::Running
    }

    pub fn succeed(&mut self, finished_at: DateTime<Utc>) {
        self.status = JobRunStatus::Succeeded;
        self.finished_at = Some(finished_at);
        self.error_detail = None;
    }

    pub fn fail(&mut self, finished_at: DateTime<Utc>, detail: impl Into<String>) {
        self.status = JobRunStatus::Failed;
        self.finished_at = Some(finished_at);
        self.error_detail = Some(detail.into());
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|f| (f - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// A trigger that fired while its job was already running and was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapSkip {
    pub job_name: JobName,
    pub trigger: RunTrigger,
    pub skipped_at: DateTime<Utc>,
    pub running_run_id: JobRunId,
}
