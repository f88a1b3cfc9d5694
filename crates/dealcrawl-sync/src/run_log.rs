//! Best-effort crawl run audit log.
//!
//! A failing audit write must never abort the crawl it describes: every store
//! error here is logged with `warn!` and swallowed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealcrawl_core::{CrawlRun, RunCompletion, RunTrigger};
use dealcrawl_storage::DealStore;
use tracing::warn;
use uuid::Uuid;

use crate::ReconcileResult;

/// Open run row. Consumed by [`RunLogger::complete`] or [`RunLogger::fail`].
#[derive(Debug)]
#[must_use = "a run handle must be completed or failed"]
pub struct RunHandle {
    run_id: Option<Uuid>,
}

impl RunHandle {
    /// `None` when the run row could not be written.
    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }
}

#[derive(Clone)]
pub struct RunLogger {
    store: Arc<dyn DealStore>,
}

impl RunLogger {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }

    pub async fn start(&self, connector_id: Uuid, trigger: RunTrigger) -> RunHandle {
        let run = CrawlRun::start(connector_id, trigger, Utc::now());
        match self.store.insert_run(&run).await {
            Ok(()) => RunHandle {
                run_id: Some(run.id),
            },
            Err(err) => {
                warn!(connector_id = %connector_id, error = %err, "failed to open crawl run");
                RunHandle { run_id: None }
            }
        }
    }

    pub async fn complete(&self, handle: RunHandle, result: &ReconcileResult, tokens_used: i64) {
        let completion = RunCompletion::Success {
            new_count: result.new_count,
            updated_count: result.updated_count,
            skipped_count: result.skipped_count,
            tokens_used,
        };
        self.finish(handle, completion).await;
    }

    pub async fn fail(&self, handle: RunHandle, message: &str) {
        let completion = RunCompletion::Failed {
            error_message: message.to_string(),
        };
        self.finish(handle, completion).await;
    }

    async fn finish(&self, handle: RunHandle, completion: RunCompletion) {
        let Some(run_id) = handle.run_id else {
            return;
        };
        match self.store.finish_run(run_id, &completion, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %run_id, "crawl run already finished"),
            Err(err) => warn!(run_id = %run_id, error = %err, "failed to close crawl run"),
        }
    }

    /// Fails runs left `running` by a crashed process. Returns how many were reaped.
    pub async fn reap_stale(&self, started_before: DateTime<Utc>) -> u64 {
        match self
            .store
            .fail_stale_runs(started_before, Utc::now(), "run abandoned before completion")
            .await
        {
            Ok(0) => 0,
            Ok(reaped) => {
                warn!(reaped, "failed stale crawl runs");
                reaped
            }
            Err(err) => {
                warn!(error = %err, "failed to reap stale crawl runs");
                0
            }
        }
    }
}
