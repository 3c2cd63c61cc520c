//! Standalone evaluation workers for Postgres deployments.
//!
//! Any number of these processes may run against the same database; job
//! claims are exclusive across all of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use bandscore_ai::build_provider;
use bandscore_events::{EventBus, InMemoryEventBus, StatusChanged};
use bandscore_infra::{
    PipelineConfig,
    jobs::{JobStore, PostgresJobStore},
    workers::WorkerPoolHandle,
};
use secrecy::ExposeSecret;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal outside development.
    let _ = dotenvy::dotenv();
    bandscore_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let Some(database_url) = &config.database_url else {
        bail!("DATABASE_URL is required; without it run bandscore-api, which embeds its own workers");
    };

    // One connection per worker plus one for stats.
    let max_connections = u32::try_from(config.worker_count + 1).unwrap_or(u32::MAX);
    let store: Arc<dyn JobStore> = Arc::new(
        PostgresJobStore::connect(database_url.expose_secret(), max_connections)
            .await
            .context("failed to connect to the job store")?,
    );
    let provider = build_provider(&config.provider)?;

    // Status changes stay in this process; API clients read them from the store.
    let bus: Arc<dyn EventBus<StatusChanged>> = Arc::new(InMemoryEventBus::<StatusChanged>::new());

    let pool = WorkerPoolHandle::spawn(
        config.worker_count,
        store.clone(),
        provider,
        bus,
        config.worker.clone(),
    );

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = ticker.tick() => {
                match store.stats().await {
                    Ok(jobs) => tracing::info!(
                        queued = jobs.queued,
                        claimed = jobs.claimed,
                        retry_scheduled = jobs.retry_scheduled,
                        succeeded = jobs.succeeded,
                        failed = jobs.failed,
                        "job queue stats"
                    ),
                    Err(e) => tracing::warn!(error = %e, "failed to read job stats"),
                }
            }
        }
    }

    tracing::info!("shutdown requested; waiting for in-flight jobs");
    let stats = pool.shutdown().await;
    tracing::info!(
        claimed = stats.jobs_claimed,
        scored = stats.jobs_scored,
        failed = stats.jobs_failed,
        "workers stopped"
    );
    Ok(())
}
