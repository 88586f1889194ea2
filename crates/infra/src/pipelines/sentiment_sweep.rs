//! `sentiment-sweep`: classify every unclassified feedback record.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use fitpulse_ai::WordFrequencyAggregator;
use fitpulse_core::SentimentLabel;

use super::SharedClassifier;
use crate::jobs::{JobAction, JobContext, JobError};
use crate::store::{FeedbackFilter, FeedbackStore};

const DEFAULT_TOP_WORDS: usize = 10;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub classified: usize,
    pub per_label: BTreeMap<SentimentLabel, usize>,
    pub model_version: String,
}

pub struct SentimentSweep<S: ?Sized> {
    store: Arc<S>,
    classifier: SharedClassifier,
    batch_size: Option<usize>,
    top_words: usize,
}

impl<S> SentimentSweep<S>
where
    S: FeedbackStore + ?Sized,
{
    pub fn new(store: Arc<S>, classifier: SharedClassifier) -> Self {
        Self {
            store,
            classifier,
            batch_size: None,
            top_words: DEFAULT_TOP_WORDS,
        }
    }

    /// Classify at most `batch_size` records per run.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    pub fn with_top_words(mut self, top_words: usize) -> Self {
        self.top_words = top_words;
        self
    }

    /// Classify pending records, one store write per record, then log the
    /// per-label word frequencies of the whole corpus.
    pub fn sweep(&self, ctx: &JobContext) -> Result<SweepReport, JobError> {
        let classifier = self
            .classifier
            .current()
            .ok_or_else(|| JobError::NotReady("no sentiment model loaded".to_string()))?;

        let pending = self.store.list_unclassified(self.batch_size)?;
        let mut report = SweepReport {
            model_version: classifier.model_version().to_string(),
            ..Default::default()
        };

        for record in &pending {
            ctx.checkpoint()?;
            let prediction = classifier.classify_text(&record.raw_text);
            self.store
                .update_sentiment(record.id, prediction.label, prediction.confidence)?;
            debug!(
                feedback_id = %record.id,
                label = prediction.label.as_str(),
                confidence = prediction.confidence,
                "feedback classified"
            );
            report.classified += 1;
            *report.per_label.entry(prediction.label).or_insert(0) += 1;
        }

        let count = |label: SentimentLabel| report.per_label.get(&label).copied().unwrap_or(0);
        info!(
            job = %ctx.job,
            run_id = %ctx.run_id,
            classified = report.classified,
            positive = count(SentimentLabel::Positive),
            neutral = count(SentimentLabel::Neutral),
            negative = count(SentimentLabel::Negative),
            model_version = %report.model_version,
            "sentiment sweep finished"
        );

        if report.classified > 0 {
            let corpus = self.store.list_feedback(&FeedbackFilter::default())?;
            let frequencies =
                WordFrequencyAggregator::new(classifier.normalizer().clone()).aggregate(&corpus);
            for label in SentimentLabel::CLASSES {
                let top: Vec<String> = frequencies
                    .top(label, Some(self.top_words))
                    .into_iter()
                    .map(|w| format!("{}:{}", w.word, w.count))
                    .collect();
                info!(
                    label = label.as_str(),
                    records = frequencies.record_count(label),
                    top_words = ?top,
                    "word frequencies"
                );
            }
        }

        Ok(report)
    }
}

impl<S> JobAction for SentimentSweep<S>
where
    S: FeedbackStore + ?Sized + 'static,
{
    fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.sweep(ctx).map(|_| ())
    }
}
