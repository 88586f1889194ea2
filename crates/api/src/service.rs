//! The operations exposed to the API collaborator.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use fitpulse_ai::{Prediction, TextNormalizer, WordCount, WordFrequencyAggregator};
use fitpulse_core::{
    FeedbackRecord, ForecastRecord, JobName, Period, PeriodRange, RevenuePoint, SentimentLabel,
};
use fitpulse_infra::{
    AnalyticsStore, FeedbackFilter, JobSchedulerHandle, JobSpec, JobStatusView, SharedClassifier,
    TriggerOutcome,
};

use crate::error::{ServiceError, ServiceResult};

/// Default number of words per label in a sentiment report.
pub const DEFAULT_TOP_N: usize = 10;

/// Filters for [`AnalyticsService::get_sentiment_report`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentimentReportQuery {
    /// Inclusive.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive.
    pub created_to: Option<DateTime<Utc>>,
    /// Restrict to these labels; `None` means all.
    pub labels: Option<Vec<SentimentLabel>>,
    /// Words per label; `None` uses [`DEFAULT_TOP_N`].
    pub top_n: Option<usize>,
}

impl SentimentReportQuery {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            created_from: Some(from),
            created_to: Some(to),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = SentimentLabel>) -> Self {
        self.labels = Some(labels.into_iter().collect());
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentReport {
    pub total: u64,
    /// Record count per label (every requested label is present, possibly 0).
    pub counts: BTreeMap<SentimentLabel, u64>,
    /// Most frequent words per classified label.
    pub top_words: BTreeMap<SentimentLabel, Vec<WordCount>>,
}

/// Facade over the store, the classifier and the running scheduler.
pub struct AnalyticsService<S: ?Sized> {
    store: Arc<S>,
    classifier: SharedClassifier,
    scheduler: JobSchedulerHandle<S>,
    normalizer: TextNormalizer,
}

impl<S> AnalyticsService<S>
where
    S: AnalyticsStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, classifier: SharedClassifier, scheduler: JobSchedulerHandle<S>) -> Self {
        let normalizer = classifier
            .current()
            .map(|c| c.normalizer().clone())
            .unwrap_or_default();
        Self {
            store,
            classifier,
            scheduler,
            normalizer,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn classifier(&self) -> &SharedClassifier {
        &self.classifier
    }

    /// Classify `text` without storing anything. Without a model the text is
    /// reported as unclassified with zero confidence.
    pub fn classify_feedback(&self, text: &str) -> Prediction {
        match self.classifier.current() {
            Some(classifier) => classifier.classify_text(text),
            None => {
                warn!("classification requested but no sentiment model is loaded");
                Prediction {
                    label: SentimentLabel::Unclassified,
                    confidence: 0.0,
                }
            }
        }
    }

    /// Store new feedback. With `classify` and a loaded model the record is
    /// classified before insertion; otherwise the sweep picks it up.
    pub fn submit_feedback(&self, text: &str, classify: bool) -> ServiceResult<FeedbackRecord> {
        if text.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("feedback text is empty".to_string()));
        }
        let mut record = FeedbackRecord::new(text, Utc::now());
        if classify {
            if let Some(classifier) = self.classifier.current() {
                let prediction = classifier.classify_text(text);
                record.classify(prediction.label, prediction.confidence)?;
            }
        }
        self.store.insert_feedback(&record)?;
        info!(
            feedback_id = %record.id,
            label = record.sentiment_label.as_str(),
            "feedback submitted"
        );
        Ok(record)
    }

    pub fn get_sentiment_report(&self, query: &SentimentReportQuery) -> ServiceResult<SentimentReport> {
        if let (Some(from), Some(to)) = (query.created_from, query.created_to) {
            if from >= to {
                return Err(ServiceError::InvalidRequest(format!(
                    "empty time range: {from} >= {to}"
                )));
            }
        }
        let filter = FeedbackFilter {
            created_from: query.created_from,
            created_to: query.created_to,
            labels: query.labels.clone(),
        };
        let records = self.store.list_feedback(&filter)?;
        let frequencies = WordFrequencyAggregator::new(self.normalizer.clone()).aggregate(&records);

        let labels: Vec<SentimentLabel> = match &query.labels {
            Some(labels) => labels.clone(),
            None => SentimentLabel::CLASSES
                .into_iter()
                .chain([SentimentLabel::Unclassified])
                .collect(),
        };
        let top_n = query.top_n.unwrap_or(DEFAULT_TOP_N);

        let counts = labels
            .iter()
            .map(|label| (*label, frequencies.record_count(*label)))
            .collect();
        let top_words = labels
            .iter()
            .filter(|label| label.is_classified())
            .map(|label| (*label, frequencies.top(*label, Some(top_n))))
            .collect();

        Ok(SentimentReport {
            total: frequencies.total_records(),
            counts,
            top_words,
        })
    }

    /// Latest forecast per target period in `range`; empty when none exist.
    pub fn get_latest_forecast(&self, range: PeriodRange) -> ServiceResult<Vec<ForecastRecord>> {
        Ok(self.store.latest_forecasts(range)?)
    }

    /// Insert or replace the revenue of one month.
    pub fn record_revenue(&self, period: Period, amount: f64) -> ServiceResult<RevenuePoint> {
        let point = RevenuePoint::new(period, amount)?;
        self.store.upsert_revenue(&point)?;
        Ok(point)
    }

    /// Manual trigger. A job that is already running is rejected, not queued.
    pub fn trigger_job(&self, job: JobName) -> ServiceResult<TriggerOutcome> {
        Ok(self.scheduler.trigger(job)?)
    }

    pub fn job_status(&self, job: JobName) -> ServiceResult<JobStatusView> {
        Ok(self.scheduler.status(job)?)
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        self.scheduler.jobs()
    }

    pub fn scheduler(&self) -> &JobSchedulerHandle<S> {
        &self.scheduler
    }

    /// Stop the scheduler, interrupting in-flight runs. Idempotent.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
