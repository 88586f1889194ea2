//! `fitpulse-api`
//!
//! **Responsibility:** the surface the REST collaborator calls into.
//!
//! - `AnalyticsService`: classify / submit feedback, sentiment reports, latest
//!   forecasts, job triggers and status.
//! - `bootstrap`: config → store → classifier → scheduler wiring.
//! - `validation`: sample-based check of the loaded classifier.

pub mod bootstrap;
pub mod error;
pub mod service;
pub mod validation;

pub use bootstrap::{load_or_train_classifier, start_service};
pub use error::{BootstrapError, ServiceError, ServiceResult};
pub use service::{AnalyticsService, DEFAULT_TOP_N, SentimentReport, SentimentReportQuery};
pub use validation::{ValidationReport, validate_classifier};
