//! `fitpulse-ai`
//!
//! **Responsibility:** the analytical models.
//!
//! - Text normalization and word frequencies over feedback.
//! - Sentiment classification (train / predict / persist / load).
//! - Revenue outlier filtering and seasonal profit forecasting.
//!
//! Everything here is pure computation over `fitpulse-core` records: no
//! storage, no scheduling, no clocks other than the timestamps callers pass in.

pub mod forecast;
pub mod model;
pub mod outlier;
pub mod result;
pub mod sentiment;
pub mod stats;
pub mod stopwords;
pub mod text;
pub mod word_frequency;

pub use forecast::{
    ForecastEngine, ForecastRun, ForecastSummary, QualityReport, QualityWarning, SeasonalTrendModel,
};
pub use model::{
    ForecastPoint, ForecastSettings, Forecaster, LabeledTokens, Prediction, SentimentModel,
    TrainingSettings,
};
pub use outlier::{FlaggedPoint, OutlierConfig, OutlierFilter, OutlierReport};
pub use result::{AiError, AiResult};
pub use sentiment::{
    Evaluation, LabelScore, NaiveBayesModel, SentimentClassifier, TrainingCorpus, TrainingExample,
};
pub use text::TextNormalizer;
pub use word_frequency::{WordCount, WordFrequencies, WordFrequencyAggregator};
