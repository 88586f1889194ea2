//! The work each scheduled job performs.
//!
//! Pipelines read and write through the store traits only and check the
//! run's shutdown signal between units of work.

pub mod forecast;
pub mod log_cleanup;
pub mod sentiment_sweep;

use std::sync::{Arc, PoisonError, RwLock};

use fitpulse_ai::SentimentClassifier;

pub use forecast::{ForecastMode, ForecastPipeline, Staleness};
pub use log_cleanup::LogCleanup;
pub use sentiment_sweep::{SentimentSweep, SweepReport};

/// The classifier currently in service, swappable at runtime (e.g. after
/// retraining). `None` until a model is trained or loaded.
#[derive(Clone, Default)]
pub struct SharedClassifier {
    inner: Arc<RwLock<Option<Arc<SentimentClassifier>>>>,
}

impl SharedClassifier {
    pub fn new(classifier: SentimentClassifier) -> Self {
        let shared = Self::default();
        shared.install(classifier);
        shared
    }

    pub fn install(&self, classifier: SentimentClassifier) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(classifier));
    }

    pub fn current(&self) -> Option<Arc<SentimentClassifier>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }
}

impl std::fmt::Debug for SharedClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let version = self.current().map(|c| c.model_version().to_string());
        f.debug_struct("SharedClassifier")
            .field("model_version", &version)
            .finish()
    }
}
