//! Capability interfaces for the statistical models.
//!
//! Callers (classifier wrapper, forecast engine, scheduler pipelines) only see
//! these traits, so a concrete model can be replaced without touching the
//! scheduling or persistence code.

use fitpulse_core::{Period, RevenuePoint, SentimentLabel};

use crate::result::AiResult;

/// One labeled training example as a bag of normalized tokens.
pub type LabeledTokens = (Vec<String>, SentimentLabel);

/// Output of a sentiment prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: SentimentLabel,
    /// Posterior probability of `label`, in \[0, 1\].
    pub confidence: f64,
}

impl Prediction {
    /// Returned for inputs with no usable tokens.
    pub const fn empty() -> Self {
        Self {
            label: SentimentLabel::Neutral,
            confidence: 0.0,
        }
    }
}

/// Training knobs shared by sentiment models.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSettings {
    /// Minimum number of labeled examples accepted by `fit`.
    pub min_examples: usize,
    /// Additive (Laplace) smoothing.
    pub smoothing: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            min_examples: 12,
            smoothing: 1.0,
        }
    }
}

/// Supervised token-bag → sentiment model.
pub trait SentimentModel: Send + Sync + 'static {
    /// Fit a new model. Fails with `InsufficientData` when the corpus is too
    /// small or is missing one of the three classes.
    fn fit(corpus: &[LabeledTokens], settings: &TrainingSettings) -> AiResult<Self>
    where
        Self: Sized;

    /// Deterministic prediction; empty input yields [`Prediction::empty`].
    fn predict(&self, tokens: &[String]) -> Prediction;

    /// Identifier of this fitted instance.
    fn model_version(&self) -> &str;

    fn serialize(&self) -> AiResult<Vec<u8>>;

    fn deserialize(bytes: &[u8]) -> AiResult<Self>
    where
        Self: Sized;
}

/// Seasonal forecasting settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSettings {
    /// Length of the seasonal cycle in periods (12 for annual seasonality on monthly data).
    pub season_length: usize,
    /// Shrinkage of seasonal indices toward zero; higher means weaker seasonality.
    pub seasonal_prior: f64,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            season_length: 12,
            seasonal_prior: 1.0,
        }
    }
}

/// A single forecast step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastPoint {
    pub period: Period,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Time-series model over period-ordered revenue.
pub trait Forecaster: Send + Sync + 'static {
    /// Fit on the outlier-adjusted series (`adjusted_amount`).
    fn fit(series: &[RevenuePoint], settings: &ForecastSettings) -> AiResult<Self>
    where
        Self: Sized;

    /// Forecast `horizon` periods after the last observed one.
    fn forecast(&self, horizon: usize, confidence_level: f64) -> AiResult<Vec<ForecastPoint>>;

    fn model_version(&self) -> &str;

    fn serialize(&self) -> AiResult<Vec<u8>>;

    fn deserialize(bytes: &[u8]) -> AiResult<Self>
    where
        Self: Sized;
}
