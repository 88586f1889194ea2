use thiserror::Error;

use fitpulse_ai::AiError;
use fitpulse_core::DomainError;
use fitpulse_infra::{ConfigError, ScheduleError, StoreError};

/// Errors returned by [`AnalyticsService`](crate::AnalyticsService) operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that prevent the service from starting.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("analytics setup: {0}")]
    Analysis(#[from] AiError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler: {0}")]
    Schedule(#[from] ScheduleError),
}
