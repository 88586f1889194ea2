//! Startup validation of the sentiment classifier.
//!
//! Classifies a fixed set of sample feedbacks with known labels and reports how
//! many come out right, plus the most frequent words per predicted label.
//! Nothing is written to the store.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use fitpulse_ai::{SentimentClassifier, WordCount, WordFrequencyAggregator};
use fitpulse_core::{FeedbackRecord, SentimentLabel};

const TOP_WORDS: usize = 5;

/// Below this accuracy the pass logs a warning.
pub const MIN_SAMPLE_ACCURACY: f64 = 0.6;

/// Sample feedbacks and their expected labels.
pub const SAMPLES: &[(&str, SentimentLabel)] = &[
    ("O instrutor foi excelente e a academia estava muito limpa", SentimentLabel::Positive),
    ("Adorei os equipamentos novos, ótimo atendimento", SentimentLabel::Positive),
    ("Ambiente agradável e professores motivadores", SentimentLabel::Positive),
    ("Loved the classes, great trainers", SentimentLabel::Positive),
    ("A esteira continua quebrada e o vestiário está sujo", SentimentLabel::Negative),
    ("Atendimento péssimo, ninguém ajuda os alunos", SentimentLabel::Negative),
    ("Ar condicionado quebrado, treinar ficou insuportável", SentimentLabel::Negative),
    ("Terrible service and broken equipment", SentimentLabel::Negative),
    ("A academia abre às seis, movimento normal", SentimentLabel::Neutral),
    ("Preço na média da região, estrutura mediana", SentimentLabel::Neutral),
    ("Quantidade de aparelhos razoável", SentimentLabel::Neutral),
    ("Regular schedule and average prices", SentimentLabel::Neutral),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub model_version: String,
    pub samples: usize,
    pub correct: usize,
    pub predicted: BTreeMap<SentimentLabel, usize>,
    pub top_words: BTreeMap<SentimentLabel, Vec<WordCount>>,
}

impl ValidationReport {
    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.correct as f64 / self.samples as f64
    }

    pub fn passed(&self) -> bool {
        self.accuracy() >= MIN_SAMPLE_ACCURACY
    }
}

/// Run the sample set through `classifier` and log the outcome.
pub fn validate_classifier(classifier: &SentimentClassifier) -> ValidationReport {
    let now = Utc::now();
    let mut correct = 0;
    let mut predicted = BTreeMap::new();
    let mut classified = Vec::with_capacity(SAMPLES.len());

    for (text, expected) in SAMPLES {
        let prediction = classifier.classify_text(text);
        if prediction.label == *expected {
            correct += 1;
        }
        *predicted.entry(prediction.label).or_insert(0) += 1;

        let mut record = FeedbackRecord::new(*text, now);
        // Confidence comes from the model and is always within [0, 1].
        if record.classify(prediction.label, prediction.confidence).is_ok() {
            classified.push(record);
        }
    }

    let frequencies = WordFrequencyAggregator::new(classifier.normalizer().clone()).aggregate(&classified);
    let top_words = SentimentLabel::CLASSES
        .into_iter()
        .map(|label| (label, frequencies.top(label, Some(TOP_WORDS))))
        .collect();

    let report = ValidationReport {
        model_version: classifier.model_version().to_string(),
        samples: SAMPLES.len(),
        correct,
        predicted,
        top_words,
    };

    let count = |label: SentimentLabel| report.predicted.get(&label).copied().unwrap_or(0);
    if report.passed() {
        info!(
            model_version = %report.model_version,
            samples = report.samples,
            correct = report.correct,
            accuracy = report.accuracy(),
            positive = count(SentimentLabel::Positive),
            neutral = count(SentimentLabel::Neutral),
            negative = count(SentimentLabel::Negative),
            "classifier validation passed"
        );
    } else {
        warn!(
            model_version = %report.model_version,
            samples = report.samples,
            correct = report.correct,
            accuracy = report.accuracy(),
            "classifier validation below expected accuracy"
        );
    }
    for (label, words) in &report.top_words {
        let words: Vec<&str> = words.iter().map(|w| w.word.as_str()).collect();
        info!(label = label.as_str(), top_words = ?words, "validation word frequencies");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitpulse_ai::{NaiveBayesModel, TextNormalizer, TrainingCorpus, TrainingSettings};

    fn trained() -> SentimentClassifier {
        let corpus = TrainingCorpus::from_csv_path(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../data/training_corpus.csv"
        ))
        .unwrap();
        SentimentClassifier::train_on_corpus::<NaiveBayesModel>(
            TextNormalizer::new(),
            &corpus,
            &TrainingSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn report_accounts_for_every_sample() {
        let classifier = trained();
        let report = validate_classifier(&classifier);

        assert_eq!(report.samples, SAMPLES.len());
        assert!(report.correct <= report.samples);
        assert_eq!(report.predicted.values().sum::<usize>(), SAMPLES.len());
        assert_eq!(report.model_version, classifier.model_version());
        assert_eq!(
            report.top_words.keys().copied().collect::<Vec<_>>(),
            SentimentLabel::CLASSES.to_vec()
        );
        assert!(report.top_words.values().all(|words| words.len() <= TOP_WORDS));
    }

    #[test]
    fn accuracy_threshold() {
        let mut report = ValidationReport {
            model_version: "nb".to_string(),
            samples: 10,
            correct: 6,
            predicted: BTreeMap::new(),
            top_words: BTreeMap::new(),
        };
        assert!(report.passed());
        report.correct = 5;
        assert!(!report.passed());
        report.samples = 0;
        assert_eq!(report.accuracy(), 0.0);
    }
}
