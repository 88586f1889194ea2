//! Configuration loading and representation.
//!
//! Every setting comes from a `FITPULSE_*` environment variable and falls back
//! to a default. Invalid values are rejected with an error naming the
//! variable; nothing is silently ignored.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration;
use tracing::info;

use fitpulse_ai::{ForecastSettings, OutlierConfig, TrainingSettings};
use fitpulse_core::JobName;
use fitpulse_observability::LogFormat;

use crate::jobs::{BackoffStrategy, Cadence, JobSpec, RetryPolicy};
use crate::pipelines::log_cleanup::DEFAULT_RETENTION_DAYS;

pub const DEFAULT_MODEL_PATH: &str = "data/sentiment_model.json";
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.8;
pub const DEFAULT_GENERATE_HORIZON: usize = 1;
pub const DEFAULT_REFRESH_HORIZON: usize = 6;

pub const RETRY_MAX_RETRIES_VAR: &str = "FITPULSE_RETRY_MAX_RETRIES";
pub const RETRY_BASE_DELAY_VAR: &str = "FITPULSE_RETRY_BASE_DELAY_MS";
pub const RETRY_MAX_DELAY_VAR: &str = "FITPULSE_RETRY_MAX_DELAY_MS";
pub const RETRY_STRATEGY_VAR: &str = "FITPULSE_RETRY_STRATEGY";
const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// The offending variable.
    pub fn var(&self) -> &str {
        match self {
            ConfigError::Invalid { var, .. } => var,
        }
    }
}

fn job_suffix(job: JobName) -> String {
    job.as_str().to_ascii_uppercase().replace('-', "_")
}

/// Environment variable holding the cadence of `job`,
/// e.g. `FITPULSE_CADENCE_FORECAST_REFRESH`.
pub fn cadence_var(job: JobName) -> String {
    format!("FITPULSE_CADENCE_{}", job_suffix(job))
}

/// Per-job form of a retry variable, e.g.
/// `job_var(RETRY_MAX_RETRIES_VAR, JobName::LogCleanup)` is
/// `FITPULSE_RETRY_MAX_RETRIES_LOG_CLEANUP`.
pub fn job_var(base: &str, job: JobName) -> String {
    format!("{base}_{}", job_suffix(job))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsConfig {
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub model_path: PathBuf,
    /// Labeled CSV used to train when no model is stored at `model_path`.
    pub training_corpus: Option<PathBuf>,
    pub training: TrainingSettings,
    pub outlier: OutlierConfig,
    pub forecast: ForecastSettings,
    pub confidence_level: f64,
    pub generate_horizon: usize,
    pub refresh_horizon: usize,
    pub cadences: BTreeMap<JobName, Cadence>,
    /// Retry policy of every job without an override.
    pub retry: RetryPolicy,
    /// Jobs whose retry policy differs from `retry`.
    pub job_retries: BTreeMap<JobName, RetryPolicy>,
    pub log_retention_days: i64,
    pub validate_on_startup: bool,
    pub log_format: LogFormat,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            training_corpus: None,
            training: TrainingSettings::default(),
            outlier: OutlierConfig::default(),
            forecast: ForecastSettings::default(),
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            generate_horizon: DEFAULT_GENERATE_HORIZON,
            refresh_horizon: DEFAULT_REFRESH_HORIZON,
            cadences: JobName::ALL
                .into_iter()
                .map(|job| (job, JobSpec::default_cadence(job)))
                .collect(),
            retry: RetryPolicy::default(),
            job_retries: BTreeMap::new(),
            log_retention_days: DEFAULT_RETENTION_DAYS,
            validate_on_startup: false,
            log_format: LogFormat::default(),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(var) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(var, &value, e.to_string())),
        }
    }

    /// Parse and check `valid`; the raw value is kept for the error.
    fn parse_checked<T>(
        &self,
        var: &str,
        valid: impl Fn(&T) -> bool,
        expected: &str,
    ) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.parse::<T>(var)? else {
            return Ok(None);
        };
        if valid(&value) {
            Ok(Some(value))
        } else {
            Err(ConfigError::invalid(
                var,
                &self.raw(var).unwrap_or_default(),
                expected,
            ))
        }
    }

    /// `defaults` with the retry variables named `<base><suffix>` applied.
    fn retry_policy(&self, defaults: &RetryPolicy, suffix: &str) -> Result<RetryPolicy, ConfigError> {
        let var = |base: &str| format!("{base}{suffix}");
        let mut policy = defaults.clone();

        if let Some(n) = self.parse_checked::<u32>(
            &var(RETRY_MAX_RETRIES_VAR),
            |n| *n <= MAX_RETRIES_LIMIT,
            "expected an integer between 0 and 10",
        )? {
            policy.max_retries = n;
        }
        if let Some(ms) = self.parse_checked::<u64>(&var(RETRY_BASE_DELAY_VAR), |ms| *ms >= 1, "expected milliseconds >= 1")? {
            policy.base_delay = std::time::Duration::from_millis(ms);
        }
        let max_delay_var = var(RETRY_MAX_DELAY_VAR);
        match self.parse_checked::<u64>(&max_delay_var, |ms| *ms >= 1, "expected milliseconds >= 1")? {
            Some(ms) => {
                policy.max_delay = std::time::Duration::from_millis(ms);
                if policy.max_delay < policy.base_delay {
                    return Err(ConfigError::invalid(
                        &max_delay_var,
                        &ms.to_string(),
                        "must not be below the base delay",
                    ));
                }
            }
            None => policy.max_delay = policy.max_delay.max(policy.base_delay),
        }
        if let Some(strategy) = self.parse::<BackoffStrategy>(&var(RETRY_STRATEGY_VAR))? {
            policy.strategy = strategy;
        }
        Ok(policy)
    }

    fn flag(&self, var: &str) -> Result<Option<bool>, ConfigError> {
        match self.raw(var) {
            None => Ok(None),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::invalid(var, &value, "expected true or false")),
            },
        }
    }
}

impl AnalyticsConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        config.database_url = env.raw("FITPULSE_DATABASE_URL");
        if let Some(path) = env.raw("FITPULSE_MODEL_PATH") {
            config.model_path = PathBuf::from(path);
        }
        config.training_corpus = env.raw("FITPULSE_TRAINING_CORPUS").map(PathBuf::from);

        if let Some(n) = env.parse_checked::<usize>("FITPULSE_MIN_TRAINING_EXAMPLES", |n| *n >= 3, "expected an integer >= 3")? {
            config.training.min_examples = n;
        }
        if let Some(k) = env.parse_checked::<f64>(
            "FITPULSE_OUTLIER_MULTIPLIER",
            |k| k.is_finite() && *k > 0.0,
            "expected a positive number",
        )? {
            config.outlier.multiplier = k;
        }
        if let Some(w) = env.parse_checked::<usize>("FITPULSE_OUTLIER_WINDOW", |w| *w >= 3, "expected an integer >= 3")? {
            config.outlier.window = w;
        }
        if let Some(m) = env.parse_checked::<usize>("FITPULSE_MIN_HISTORY", |m| *m >= 1, "expected an integer >= 1")? {
            config.outlier.min_history = m;
        }
        if let Some(c) = env.parse_checked::<f64>(
            "FITPULSE_CONFIDENCE_LEVEL",
            |c| *c > 0.0 && *c < 1.0,
            "expected a number strictly between 0 and 1",
        )? {
            config.confidence_level = c;
        }
        if let Some(l) = env.parse_checked::<usize>("FITPULSE_SEASON_LENGTH", |l| *l >= 2, "expected an integer >= 2")? {
            config.forecast.season_length = l;
        }
        if let Some(h) = env.parse_checked::<usize>("FITPULSE_GENERATE_HORIZON", |h| *h >= 1, "expected an integer >= 1")? {
            config.generate_horizon = h;
        }
        if let Some(h) = env.parse_checked::<usize>("FITPULSE_REFRESH_HORIZON", |h| *h >= 1, "expected an integer >= 1")? {
            config.refresh_horizon = h;
        }
        for job in JobName::ALL {
            if let Some(cadence) = env.parse::<Cadence>(&cadence_var(job))? {
                config.cadences.insert(job, cadence);
            }
        }
        config.retry = env.retry_policy(&config.retry, "")?;
        for job in JobName::ALL {
            let policy = env.retry_policy(&config.retry, &format!("_{}", job_suffix(job)))?;
            if policy != config.retry {
                config.job_retries.insert(job, policy);
            }
        }
        if let Some(days) = env.parse_checked::<i64>("FITPULSE_LOG_RETENTION_DAYS", |d| *d >= 1, "expected a number of days >= 1")? {
            config.log_retention_days = days;
        }
        if let Some(validate) = env.flag("FITPULSE_VALIDATE_ON_STARTUP")? {
            config.validate_on_startup = validate;
        }
        if let Some(format) = env.parse::<LogFormat>("FITPULSE_LOG_FORMAT")? {
            config.log_format = format;
        }

        Ok(config)
    }

    pub fn cadence(&self, job: JobName) -> Cadence {
        self.cadences
            .get(&job)
            .copied()
            .unwrap_or_else(|| JobSpec::default_cadence(job))
    }

    pub fn retry_policy(&self, job: JobName) -> &RetryPolicy {
        self.job_retries.get(&job).unwrap_or(&self.retry)
    }

    pub fn job_spec(&self, job: JobName) -> JobSpec {
        JobSpec::new(job, self.cadence(job)).with_retry(self.retry_policy(job).clone())
    }

    pub fn log_retention(&self) -> Duration {
        Duration::days(self.log_retention_days)
    }

    /// Log the effective settings. The database URL is never logged.
    pub fn log_summary(&self) {
        info!(
            store = if self.database_url.is_some() { "postgres" } else { "in-memory" },
            model_path = %self.model_path.display(),
            training_corpus = ?self.training_corpus.as_ref().map(|p| p.display().to_string()),
            min_training_examples = self.training.min_examples,
            outlier_multiplier = self.outlier.multiplier,
            outlier_window = self.outlier.window,
            min_history = self.outlier.min_history,
            confidence_level = self.confidence_level,
            season_length = self.forecast.season_length,
            generate_horizon = self.generate_horizon,
            refresh_horizon = self.refresh_horizon,
            log_retention_days = self.log_retention_days,
            validate_on_startup = self.validate_on_startup,
            "analytics configuration loaded"
        );
        for (job, cadence) in &self.cadences {
            let retry = self.retry_policy(*job);
            info!(
                job = %job,
                cadence = %cadence,
                max_retries = retry.max_retries,
                base_delay_ms = retry.base_delay.as_millis() as u64,
                strategy = ?retry.strategy,
                "job schedule"
            );
        }
    }
}
