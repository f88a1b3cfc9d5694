//! Crawl orchestration: reconciliation, run logging, batch runs, lifecycle sweeps.

use std::sync::Arc;

use anyhow::{Context, Result};
use dealcrawl_adapters::AdapterError;
use dealcrawl_storage::StoreError;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

mod config;
mod lifecycle;
mod natural_key;
mod orchestrator;
mod reconcile;
mod registry;
mod run_log;

pub use config::SyncConfig;
pub use lifecycle::{LifecycleSummary, LifecycleSweeper};
pub use natural_key::{canonical_url, normalize_title, NaturalKeyStrategy, TitleUrlKey};
pub use orchestrator::{
    BatchOptions, BatchOrchestrator, BatchSummary, ConnectorOutcome, OrchestratorConfig,
    OutcomeStatus,
};
pub use reconcile::{ReconcileFailure, ReconcileOptions, ReconcileResult, Reconciler};
pub use registry::{seed_registry, ConnectorEntry, MerchantEntry, Registry, SeedSummary};
pub use run_log::{RunHandle, RunLogger};

pub const CRATE_NAME: &str = "dealcrawl-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("extraction task aborted: {0}")]
    AdapterPanic(String),
    #[error("connector {0} not found")]
    ConnectorNotFound(Uuid),
    #[error("connector {0} is disabled")]
    ConnectorDisabled(Uuid),
    #[error("connector {0} is already running")]
    ConnectorBusy(Uuid),
}

/// Builds the crawl + lifecycle cron jobs when the scheduler is enabled.
///
/// The returned scheduler is not started; the caller owns its lifetime.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<BatchOrchestrator>,
    sweeper: Arc<LifecycleSweeper>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let crawl_cron = config.crawl_cron.as_str();
    let crawl = Job::new_async(crawl_cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_scheduled_sweep().await {
                Ok(summary) => info!(
                    attempted = summary.attempted(),
                    failed = summary.failed,
                    new_deals = summary.new_deals,
                    "scheduled crawl sweep finished"
                ),
                Err(err) => warn!(error = %err, "scheduled crawl sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating crawl job for cron {crawl_cron}"))?;
    sched.add(crawl).await.context("adding crawl job")?;

    let lifecycle_cron = config.lifecycle_cron.as_str();
    let lifecycle = Job::new_async(lifecycle_cron, move |_uuid, _l| {
        let sweeper = sweeper.clone();
        Box::pin(async move {
            if let Err(err) = sweeper.run_scheduled(chrono::Utc::now()).await {
                warn!(error = %err, "scheduled lifecycle sweep failed");
            }
        })
    })
    .with_context(|| format!("creating lifecycle job for cron {lifecycle_cron}"))?;
    sched.add(lifecycle).await.context("adding lifecycle job")?;

    Ok(Some(sched))
}
