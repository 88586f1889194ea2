//! Sentiment classification.
//!
//! Model: multinomial Naive Bayes over normalized token counts with additive
//! smoothing. Posteriors are normalized with log-sum-exp; the winning class's
//! posterior is the reported confidence. Exact ties resolve by class priority
//! (positive > neutral > negative) so predictions are deterministic.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use fitpulse_core::SentimentLabel;

use crate::model::{LabeledTokens, Prediction, SentimentModel, TrainingSettings};
use crate::result::{AiError, AiResult};
use crate::text::TextNormalizer;

const CLASS_COUNT: usize = SentimentLabel::CLASSES.len();

fn class_index(label: SentimentLabel) -> Option<usize> {
    SentimentLabel::CLASSES.iter().position(|c| *c == label)
}

/// Fitted multinomial Naive Bayes state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    model_version: String,
    trained_at: DateTime<Utc>,
    smoothing: f64,
    /// Documents per class, indexed like `SentimentLabel::CLASSES`.
    class_docs: [u64; CLASS_COUNT],
    /// Total token occurrences per class.
    class_tokens: [u64; CLASS_COUNT],
    /// Per-token occurrence counts per class.
    token_counts: BTreeMap<String, [u64; CLASS_COUNT]>,
}

impl NaiveBayesModel {
    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn vocabulary_size(&self) -> usize {
        self.token_counts.len()
    }

    pub fn training_size(&self) -> u64 {
        self.class_docs.iter().sum()
    }

    fn log_posteriors(&self, tokens: &[String]) -> [f64; CLASS_COUNT] {
        let total_docs = self.training_size() as f64;
        let vocab = self.vocabulary_size() as f64;
        let mut scores = [0.0; CLASS_COUNT];

        for (c, score) in scores.iter_mut().enumerate() {
            *score = (self.class_docs[c] as f64 / total_docs).ln();
            let denom = self.class_tokens[c] as f64 + self.smoothing * vocab;
            for token in tokens {
                // Tokens never seen in training carry no evidence.
                if let Some(counts) = self.token_counts.get(token) {
                    *score += ((counts[c] as f64 + self.smoothing) / denom).ln();
                }
            }
        }
        scores
    }

    fn validate(&self) -> AiResult<()> {
        if !(self.smoothing.is_finite() && self.smoothing > 0.0) {
            return Err(AiError::Serialization(
                "smoothing must be a finite positive number".to_string(),
            ));
        }
        if self.class_docs.iter().any(|d| *d == 0) {
            return Err(AiError::Serialization(
                "model state is missing a sentiment class".to_string(),
            ));
        }
        Ok(())
    }
}

impl SentimentModel for NaiveBayesModel {
    fn fit(corpus: &[LabeledTokens], settings: &TrainingSettings) -> AiResult<Self> {
        if !(settings.smoothing.is_finite() && settings.smoothing > 0.0) {
            return Err(AiError::InvalidInput(
                "smoothing must be a finite positive number".to_string(),
            ));
        }
        if corpus.len() < settings.min_examples {
            return Err(AiError::InsufficientData(format!(
                "corpus has {} examples, at least {} required",
                corpus.len(),
                settings.min_examples
            )));
        }

        let mut class_docs = [0u64; CLASS_COUNT];
        let mut class_tokens = [0u64; CLASS_COUNT];
        let mut token_counts: BTreeMap<String, [u64; CLASS_COUNT]> = BTreeMap::new();

        for (tokens, label) in corpus {
            let c = class_index(*label).ok_or_else(|| {
                AiError::InsufficientData("training examples must be labeled".to_string())
            })?;
            class_docs[c] += 1;
            for token in tokens {
                token_counts.entry(token.clone()).or_insert([0; CLASS_COUNT])[c] += 1;
                class_tokens[c] += 1;
            }
        }

        let missing: Vec<&str> = SentimentLabel::CLASSES
            .iter()
            .zip(class_docs.iter())
            .filter(|(_, docs)| **docs == 0)
            .map(|(label, _)| label.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(AiError::InsufficientData(format!(
                "corpus has no examples for: {}",
                missing.join(", ")
            )));
        }

        let model = Self {
            model_version: format!("naive-bayes-{}", Uuid::now_v7().simple()),
            trained_at: Utc::now(),
            smoothing: settings.smoothing,
            class_docs,
            class_tokens,
            token_counts,
        };
        debug!(
            model_version = %model.model_version,
            examples = corpus.len(),
            vocabulary = model.vocabulary_size(),
            "fitted naive bayes sentiment model"
        );
        Ok(model)
    }

    fn predict(&self, tokens: &[String]) -> Prediction {
        if tokens.is_empty() {
            return Prediction::empty();
        }

        let scores = self.log_posteriors(tokens);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let norm: f64 = scores.iter().map(|s| (s - max).exp()).sum();

        let mut best = 0;
        for c in 1..CLASS_COUNT {
            if scores[c] > scores[best] {
                best = c;
            }
        }

        let confidence = ((scores[best] - max).exp() / norm).clamp(0.0, 1.0);
        Prediction {
            label: SentimentLabel::CLASSES[best],
            confidence: if confidence.is_finite() { confidence } else { 0.0 },
        }
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn serialize(&self) -> AiResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn deserialize(bytes: &[u8]) -> AiResult<Self> {
        let model: Self = serde_json::from_slice(bytes)?;
        model.validate()?;
        Ok(model)
    }
}

/// A labeled example as raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub text: String,
    pub label: SentimentLabel,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    text: Option<String>,
    sentiment: Option<String>,
}

/// Labeled feedback used to (re)train the classifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingCorpus {
    examples: Vec<TrainingExample>,
}

impl TrainingCorpus {
    pub fn new(examples: Vec<TrainingExample>) -> Self {
        Self { examples }
    }

    /// Read a `text,sentiment` CSV. Rows with a blank text or label are skipped.
    pub fn from_csv_reader<R: Read>(reader: R) -> AiResult<Self> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut examples = Vec::new();

        for (row_idx, row) in csv.deserialize::<CsvRow>().enumerate() {
            let row = row.map_err(|e| AiError::InvalidInput(format!("csv row {}: {e}", row_idx + 1)))?;
            let (Some(text), Some(sentiment)) = (row.text, row.sentiment) else {
                continue;
            };
            if text.trim().is_empty() || sentiment.trim().is_empty() {
                continue;
            }
            let label = sentiment
                .parse::<SentimentLabel>()
                .map_err(|e| AiError::InvalidInput(format!("csv row {}: {e}", row_idx + 1)))?;
            examples.push(TrainingExample { text, label });
        }

        Ok(Self { examples })
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> AiResult<Self> {
        let file = fs::File::open(path.as_ref())?;
        Self::from_csv_reader(file)
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn label_counts(&self) -> BTreeMap<SentimentLabel, usize> {
        let mut counts = BTreeMap::new();
        for example in &self.examples {
            *counts.entry(example.label).or_insert(0) += 1;
        }
        counts
    }

    pub fn tokenized(&self, normalizer: &TextNormalizer) -> Vec<LabeledTokens> {
        self.examples
            .iter()
            .map(|e| (normalizer.normalize(&e.text), e.label))
            .collect()
    }
}

/// Per-label evaluation counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelScore {
    pub support: usize,
    pub correct: usize,
}

/// Accuracy of a classifier over a labeled corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evaluation {
    pub total: usize,
    pub correct: usize,
    pub per_label: BTreeMap<SentimentLabel, LabelScore>,
}

impl Evaluation {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }
}

/// Normalizer + fitted model: the component the rest of the system talks to.
pub struct SentimentClassifier {
    normalizer: TextNormalizer,
    model: Box<dyn SentimentModel>,
}

impl std::fmt::Debug for SentimentClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentimentClassifier")
            .field("model_version", &self.model.model_version())
            .finish()
    }
}

impl SentimentClassifier {
    pub fn from_model(normalizer: TextNormalizer, model: impl SentimentModel) -> Self {
        Self {
            normalizer,
            model: Box::new(model),
        }
    }

    /// Fit model `M` on pre-tokenized examples.
    pub fn train<M: SentimentModel>(
        normalizer: TextNormalizer,
        corpus: &[LabeledTokens],
        settings: &TrainingSettings,
    ) -> AiResult<Self> {
        let model = M::fit(corpus, settings)?;
        info!(
            model_version = %model.model_version(),
            examples = corpus.len(),
            "sentiment classifier trained"
        );
        Ok(Self::from_model(normalizer, model))
    }

    /// Normalize and fit model `M` on a raw-text corpus.
    pub fn train_on_corpus<M: SentimentModel>(
        normalizer: TextNormalizer,
        corpus: &TrainingCorpus,
        settings: &TrainingSettings,
    ) -> AiResult<Self> {
        let tokenized = corpus.tokenized(&normalizer);
        Self::train::<M>(normalizer, &tokenized, settings)
    }

    pub fn normalizer(&self) -> &TextNormalizer {
        &self.normalizer
    }

    pub fn model_version(&self) -> &str {
        self.model.model_version()
    }

    pub fn predict(&self, tokens: &[String]) -> Prediction {
        self.model.predict(tokens)
    }

    pub fn classify_text(&self, text: &str) -> Prediction {
        self.predict(&self.normalizer.normalize(text))
    }

    pub fn evaluate(&self, corpus: &TrainingCorpus) -> Evaluation {
        let mut evaluation = Evaluation::default();
        for example in corpus.examples() {
            let predicted = self.classify_text(&example.text);
            let hit = predicted.label == example.label;
            let score = evaluation.per_label.entry(example.label).or_default();
            score.support += 1;
            evaluation.total += 1;
            if hit {
                score.correct += 1;
                evaluation.correct += 1;
            }
        }
        evaluation
    }

    /// Write the fitted model to `path`.
    ///
    /// Writes a sibling temp file and renames it into place, so readers never
    /// observe a partially written model.
    pub fn persist(&self, path: impl AsRef<Path>) -> AiResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let bytes = self.model.serialize()?;
        let tmp = temp_sibling(path);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), model_version = %self.model_version(), "sentiment model persisted");
        Ok(())
    }

    /// Load a model of type `M` previously written by [`persist`](Self::persist).
    pub fn load<M: SentimentModel>(path: impl AsRef<Path>, normalizer: TextNormalizer) -> AiResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let model = M::deserialize(&bytes)?;
        info!(path = %path.display(), model_version = %model.model_version(), "sentiment model loaded");
        Ok(Self::from_model(normalizer, model))
    }
}

/// `<file name>.tmp` next to `path`; the original extension is kept.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
