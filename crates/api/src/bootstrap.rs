//! Wiring: config → classifier → scheduler → service.

use std::sync::Arc;

use tracing::{error, info, warn};

use fitpulse_ai::{
    AiResult, ForecastEngine, NaiveBayesModel, OutlierFilter, SentimentClassifier, TextNormalizer,
    TrainingCorpus,
};
use fitpulse_core::{JobName, RunTrigger};
use fitpulse_infra::{
    AnalyticsConfig, AnalyticsStore, ForecastPipeline, JobScheduler, LogCleanup, ScheduleError,
    SentimentSweep, SharedClassifier,
};

use crate::error::BootstrapError;
use crate::service::AnalyticsService;
use crate::validation::validate_classifier;

/// Load the persisted model, or train one from the configured corpus and
/// persist it. `Ok(None)` when neither a model nor a corpus is available.
///
/// A model file that cannot be read is replaced by retraining when a corpus
/// is configured. Training failures persist nothing.
pub fn load_or_train_classifier(config: &AnalyticsConfig) -> AiResult<Option<SentimentClassifier>> {
    let normalizer = TextNormalizer::new();

    if config.model_path.exists() {
        match SentimentClassifier::load::<NaiveBayesModel>(&config.model_path, normalizer.clone()) {
            Ok(classifier) => return Ok(Some(classifier)),
            Err(e) if config.training_corpus.is_some() => {
                warn!(
                    path = %config.model_path.display(),
                    error = %e,
                    "stored sentiment model unreadable; retraining"
                );
            }
            Err(e) => return Err(e),
        }
    }

    let Some(corpus_path) = &config.training_corpus else {
        warn!(
            path = %config.model_path.display(),
            "no sentiment model and no training corpus configured"
        );
        return Ok(None);
    };

    let corpus = TrainingCorpus::from_csv_path(corpus_path)?;
    info!(
        path = %corpus_path.display(),
        examples = corpus.len(),
        label_counts = ?corpus.label_counts(),
        "training sentiment model"
    );
    let classifier =
        SentimentClassifier::train_on_corpus::<NaiveBayesModel>(normalizer, &corpus, &config.training)?;
    let evaluation = classifier.evaluate(&corpus);
    info!(
        accuracy = evaluation.accuracy(),
        correct = evaluation.correct,
        total = evaluation.total,
        "training-set accuracy"
    );
    classifier.persist(&config.model_path)?;
    Ok(Some(classifier))
}

/// Build the scheduler with the four jobs, start it and fire the startup
/// triggers. The store is shared by every job and the returned service.
pub fn start_service<S>(config: &AnalyticsConfig, store: Arc<S>) -> Result<AnalyticsService<S>, BootstrapError>
where
    S: AnalyticsStore + ?Sized + 'static,
{
    config.log_summary();

    let classifier = SharedClassifier::default();
    match load_or_train_classifier(config) {
        Ok(Some(loaded)) => {
            if config.validate_on_startup {
                validate_classifier(&loaded);
            }
            classifier.install(loaded);
        }
        Ok(None) => {}
        // Sentiment stays unavailable; forecasting is unaffected.
        Err(e) => error!(error = %e, "sentiment model unavailable"),
    }

    let filter = OutlierFilter::new(config.outlier.clone())?;
    let engine = ForecastEngine::new(config.forecast.clone(), config.confidence_level)?;

    let mut scheduler = JobScheduler::new(Arc::clone(&store));
    scheduler
        .register(
            config.job_spec(JobName::SentimentSweep),
            Arc::new(SentimentSweep::new(Arc::clone(&store), classifier.clone())),
        )
        .register(
            config.job_spec(JobName::ForecastRefresh),
            Arc::new(ForecastPipeline::refresh(
                Arc::clone(&store),
                filter.clone(),
                engine.clone(),
                config.refresh_horizon,
            )),
        )
        .register(
            config.job_spec(JobName::ForecastGenerate),
            Arc::new(ForecastPipeline::generate(
                Arc::clone(&store),
                filter,
                engine,
                config.generate_horizon,
            )),
        )
        .register(
            config.job_spec(JobName::LogCleanup),
            Arc::new(LogCleanup::new(Arc::clone(&store), config.log_retention())),
        );

    let handle = scheduler.start()?;

    let mut startup = vec![JobName::ForecastRefresh];
    if classifier.is_ready() {
        startup.insert(0, JobName::SentimentSweep);
    }
    for job in startup {
        match handle
            .trigger_with(job, RunTrigger::Startup)
            .and_then(|outcome| outcome.into_result(job))
        {
            Ok(run_id) => info!(job = %job, run_id = %run_id, "startup run triggered"),
            Err(ScheduleError::OverlapSkipped { running_run_id, .. }) => {
                info!(job = %job, running_run_id = %running_run_id, "startup run skipped")
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(AnalyticsService::new(store, classifier, handle))
}
