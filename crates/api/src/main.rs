use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::{Builder, Handle};

use fitpulse_api::start_service;
use fitpulse_infra::{AnalyticsConfig, AnalyticsStore, InMemoryAnalyticsStore};

#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
fn open_store(config: &AnalyticsConfig, runtime: &Handle) -> anyhow::Result<Arc<dyn AnalyticsStore>> {
    let store: Arc<dyn AnalyticsStore> = match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => Arc::new(
            fitpulse_infra::PostgresAnalyticsStore::connect(url, runtime.clone())
                .context("failed to connect to Postgres")?,
        ),
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "FITPULSE_DATABASE_URL is set but the postgres feature is not enabled; using the in-memory store"
            );
            InMemoryAnalyticsStore::arc()
        }
        None => InMemoryAnalyticsStore::arc(),
    };
    Ok(store)
}

fn main() -> anyhow::Result<()> {
    let config = AnalyticsConfig::from_env().context("invalid configuration")?;
    fitpulse_observability::init(config.log_format);

    // The scheduler runs on std threads; the runtime serves the Postgres
    // adapter and signal handling.
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("fitpulse-io")
        .build()
        .context("failed to build tokio runtime")?;

    let store = open_store(&config, runtime.handle())?;
    let service = start_service(&config, store).context("failed to start analytics service")?;

    let jobs: Vec<String> = service
        .jobs()
        .iter()
        .map(|spec| format!("{}={}", spec.name, spec.cadence))
        .collect();
    tracing::info!(jobs = ?jobs, "fitpulse analytics running");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    service.shutdown();
    Ok(())
}
