use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dealcrawl_adapters::{Extraction, ExtractionAdapter};
use dealcrawl_core::{Connector, ConnectorStatus, RunTrigger};
use dealcrawl_storage::DealStore;
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{ReconcileFailure, ReconcileOptions, ReconcileResult, Reconciler, RunLogger, SyncError};

/// Options of a manual batch. Same shape as the reconciler's.
pub type BatchOptions = ReconcileOptions;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub inter_connector_delay: Duration,
    pub claim_ttl: Duration,
    pub stale_run_after: Duration,
    pub cost_per_1k_tokens: f64,
    pub fail_rate_warn_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            inter_connector_delay: Duration::from_millis(3000),
            claim_ttl: Duration::from_secs(900),
            stale_run_after: Duration::from_secs(3600),
            cost_per_1k_tokens: 0.003,
            fail_rate_warn_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorOutcome {
    pub connector_id: Uuid,
    pub connector_name: Option<String>,
    pub status: OutcomeStatus,
    pub run_id: Option<Uuid>,
    pub new_count: i32,
    pub updated_count: i32,
    pub skipped_count: i32,
    pub expired_count: u64,
    pub tokens_used: i64,
    pub error: Option<String>,
    pub candidate_errors: Vec<ReconcileFailure>,
}

impl ConnectorOutcome {
    fn skipped(connector_id: Uuid, name: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            connector_id,
            connector_name: name,
            status: OutcomeStatus::Skipped,
            run_id: None,
            new_count: 0,
            updated_count: 0,
            skipped_count: 0,
            expired_count: 0,
            tokens_used: 0,
            error: Some(reason.into()),
            candidate_errors: Vec::new(),
        }
    }

    fn failed(connector: &Connector, run_id: Option<Uuid>, message: String) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            run_id,
            ..Self::skipped(connector.id, Some(connector.name.clone()), message)
        }
    }

    fn succeeded(
        connector: &Connector,
        run_id: Option<Uuid>,
        tokens_used: i64,
        result: ReconcileResult,
    ) -> Self {
        Self {
            connector_id: connector.id,
            connector_name: Some(connector.name.clone()),
            status: OutcomeStatus::Success,
            run_id,
            new_count: result.new_count,
            updated_count: result.updated_count,
            skipped_count: result.skipped_count,
            expired_count: result.expired_count,
            tokens_used,
            error: None,
            candidate_errors: result.errors,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub new_deals: i64,
    pub updated_deals: i64,
    pub expired_deals: u64,
    pub tokens_used: i64,
    pub estimated_cost: f64,
    /// `failed / attempted`; skipped connectors are not attempts.
    pub fail_rate: f64,
    pub high_fail_rate: bool,
    pub stale_runs_reaped: u64,
    pub results: Vec<ConnectorOutcome>,
}

impl BatchSummary {
    fn new(trigger: RunTrigger) -> Self {
        let now = Utc::now();
        Self {
            trigger,
            started_at: now,
            finished_at: now,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            new_deals: 0,
            updated_deals: 0,
            expired_deals: 0,
            tokens_used: 0,
            estimated_cost: 0.0,
            fail_rate: 0.0,
            high_fail_rate: false,
            stale_runs_reaped: 0,
            results: Vec::new(),
        }
    }

    pub fn attempted(&self) -> u32 {
        self.succeeded + self.failed
    }

    fn push(&mut self, outcome: ConnectorOutcome) {
        match outcome.status {
            OutcomeStatus::Success => self.succeeded += 1,
            OutcomeStatus::Failed => self.failed += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
        }
        self.new_deals += i64::from(outcome.new_count);
        self.updated_deals += i64::from(outcome.updated_count);
        self.expired_deals += outcome.expired_count;
        self.tokens_used += outcome.tokens_used;
        self.results.push(outcome);
    }

    fn finish(&mut self, config: &OrchestratorConfig) {
        self.finished_at = Utc::now();
        self.estimated_cost = estimate_cost(self.tokens_used, config.cost_per_1k_tokens);
        let attempted = self.attempted();
        self.fail_rate = if attempted == 0 {
            0.0
        } else {
            f64::from(self.failed) / f64::from(attempted)
        };
        self.high_fail_rate = self.fail_rate > config.fail_rate_warn_threshold;
    }
}

pub fn estimate_cost(tokens_used: i64, cost_per_1k_tokens: f64) -> f64 {
    tokens_used.max(0) as f64 * cost_per_1k_tokens / 1000.0
}

enum Target {
    Loaded(Connector),
    Id(Uuid),
}

/// Runs connectors one at a time: claim, extract, reconcile, record health.
pub struct BatchOrchestrator {
    store: Arc<dyn DealStore>,
    adapter: Arc<dyn ExtractionAdapter>,
    reconciler: Reconciler,
    run_log: RunLogger,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn DealStore>,
        adapter: Arc<dyn ExtractionAdapter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            run_log: RunLogger::new(store.clone()),
            store,
            adapter,
            config,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Every `active` connector, auto-approved, without expiring absent deals.
    pub async fn run_scheduled_sweep(&self) -> Result<BatchSummary, SyncError> {
        let now = Utc::now();
        let reaped = self
            .run_log
            .reap_stale(before(now, self.config.stale_run_after))
            .await;

        let connectors = self
            .store
            .list_connectors_with_status(ConnectorStatus::Active)
            .await?;
        info!(connectors = connectors.len(), "starting scheduled crawl sweep");

        let options = ReconcileOptions {
            auto_approve: true,
            expire_old_deals: false,
        };
        let targets = connectors.into_iter().map(Target::Loaded).collect();
        let mut summary = self.run_targets(targets, options, RunTrigger::Scheduled).await;
        summary.stale_runs_reaped = reaped;
        Ok(summary)
    }

    /// Operator batch over explicit ids. Unknown, disabled or busy connectors are skipped.
    pub async fn run_batch(&self, connector_ids: &[Uuid], options: BatchOptions) -> BatchSummary {
        let mut seen = HashSet::new();
        let targets = connector_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .map(Target::Id)
            .collect();
        self.run_targets(targets, options, RunTrigger::Manual).await
    }

    /// Operator run of one connector. Unlike a batch, refusals are errors.
    pub async fn run_single(
        &self,
        connector_id: Uuid,
        options: ReconcileOptions,
    ) -> Result<ConnectorOutcome, SyncError> {
        let connector = self
            .store
            .get_connector(connector_id)
            .await?
            .ok_or(SyncError::ConnectorNotFound(connector_id))?;
        if !connector.is_runnable() {
            return Err(SyncError::ConnectorDisabled(connector_id));
        }
        if !self.claim(connector_id).await? {
            return Err(SyncError::ConnectorBusy(connector_id));
        }

        let outcome = self
            .run_claimed(connector, options, RunTrigger::Manual)
            .await;
        self.shutdown_adapter().await;
        Ok(outcome)
    }

    async fn run_targets(
        &self,
        targets: Vec<Target>,
        options: ReconcileOptions,
        trigger: RunTrigger,
    ) -> BatchSummary {
        let mut summary = BatchSummary::new(trigger);
        let mut pause_before_next = false;

        for target in targets {
            if pause_before_next && !self.config.inter_connector_delay.is_zero() {
                tokio::time::sleep(self.config.inter_connector_delay).await;
            }
            let outcome = self.process(target, options, trigger).await;
            pause_before_next = outcome.status != OutcomeStatus::Skipped;
            summary.push(outcome);
        }

        self.shutdown_adapter().await;
        summary.finish(&self.config);

        if summary.high_fail_rate {
            warn!(
                failed = summary.failed,
                attempted = summary.attempted(),
                fail_rate = summary.fail_rate,
                "high connector failure rate"
            );
        }
        info!(
            trigger = %trigger,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            new_deals = summary.new_deals,
            updated_deals = summary.updated_deals,
            tokens = summary.tokens_used,
            estimated_cost = summary.estimated_cost,
            "crawl batch finished"
        );
        summary
    }

    async fn process(
        &self,
        target: Target,
        options: ReconcileOptions,
        trigger: RunTrigger,
    ) -> ConnectorOutcome {
        let connector = match target {
            Target::Loaded(connector) => connector,
            Target::Id(id) => match self.store.get_connector(id).await {
                Ok(Some(connector)) => connector,
                Ok(None) => return ConnectorOutcome::skipped(id, None, "connector not found"),
                Err(err) => {
                    return ConnectorOutcome::skipped(id, None, format!("loading connector: {err}"))
                }
            },
        };

        let name = Some(connector.name.clone());
        if !connector.is_runnable() {
            return ConnectorOutcome::skipped(connector.id, name, "connector is disabled");
        }
        match self.claim(connector.id).await {
            Ok(true) => self.run_claimed(connector, options, trigger).await,
            Ok(false) => {
                info!(connector_id = %connector.id, "connector already running, skipping");
                ConnectorOutcome::skipped(connector.id, name, "connector is already running")
            }
            Err(err) => ConnectorOutcome::skipped(connector.id, name, format!("claiming connector: {err}")),
        }
    }

    async fn claim(&self, connector_id: Uuid) -> Result<bool, SyncError> {
        let now = Utc::now();
        let stale_before = before(now, self.config.claim_ttl);
        Ok(self
            .store
            .claim_connector(connector_id, now, stale_before)
            .await?)
    }

    async fn run_claimed(
        &self,
        connector: Connector,
        options: ReconcileOptions,
        trigger: RunTrigger,
    ) -> ConnectorOutcome {
        let span = info_span!("connector_run", connector_id = %connector.id, connector = %connector.name);
        async move {
            let handle = self.run_log.start(connector.id, trigger).await;
            let run_id = handle.run_id();

            let attempt = async {
                let extraction = self.extract(&connector).await?;
                let result = self
                    .reconciler
                    .reconcile(&connector, &extraction.candidates, options, Utc::now())
                    .await?;
                Ok::<_, SyncError>((extraction.tokens_used, result))
            }
            .await;

            match attempt {
                Ok((tokens_used, result)) => {
                    if let Err(err) = self
                        .store
                        .record_connector_success(connector.id, Utc::now())
                        .await
                    {
                        warn!(error = %err, "failed to record connector success");
                        self.release_claim(connector.id).await;
                    }
                    self.run_log.complete(handle, &result, tokens_used).await;
                    info!(
                        run_id = ?run_id,
                        new = result.new_count,
                        updated = result.updated_count,
                        skipped = result.skipped_count,
                        errors = result.errors.len(),
                        tokens = tokens_used,
                        "connector run succeeded"
                    );
                    ConnectorOutcome::succeeded(&connector, run_id, tokens_used, result)
                }
                Err(err) => {
                    let message = err.to_string();
                    match self
                        .store
                        .record_connector_failure(connector.id, Utc::now(), &message)
                        .await
                    {
                        Ok(updated) if updated.status == ConnectorStatus::Error => warn!(
                            fail_count = updated.fail_count,
                            "connector moved to error after repeated failures"
                        ),
                        Ok(_) => {}
                        Err(store_err) => {
                            warn!(error = %store_err, "failed to record connector failure");
                            self.release_claim(connector.id).await;
                        }
                    }
                    self.run_log.fail(handle, &message).await;
                    warn!(run_id = ?run_id, error = %message, "connector run failed");
                    ConnectorOutcome::failed(&connector, run_id, message)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Health writes release the claim; when one fails the claim is dropped
    /// here so the connector is not reported busy until the lease expires.
    async fn release_claim(&self, connector_id: Uuid) {
        if let Err(err) = self.store.release_claim(connector_id).await {
            warn!(error = %err, "failed to release connector claim");
        }
    }

    /// Runs the adapter on its own task so a panic surfaces as a failed run.
    async fn extract(&self, connector: &Connector) -> Result<Extraction, SyncError> {
        let adapter = self.adapter.clone();
        let target = connector.clone();
        match tokio::spawn(async move { adapter.extract(&target).await }).await {
            Ok(result) => Ok(result?),
            Err(join) => Err(SyncError::AdapterPanic(panic_message(join))),
        }
    }

    async fn shutdown_adapter(&self) {
        if let Err(err) = self.adapter.shutdown().await {
            warn!(adapter = self.adapter.name(), error = %err, "adapter shutdown failed");
        }
    }
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "extraction task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "adapter panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dealcrawl_adapters::{AdapterError, ScriptedExtractionAdapter};
    use dealcrawl_core::{DealCandidate, Merchant, RunStatus};
    use dealcrawl_storage::MemoryStore;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            inter_connector_delay: Duration::ZERO,
            ..OrchestratorConfig::default()
        }
    }

    async fn seed(store: &MemoryStore, names: &[&str]) -> Vec<Connector> {
        let merchant = Merchant::new(Uuid::new_v4(), "GS25", Utc::now());
        store.upsert_merchant(&merchant).await.unwrap();
        let mut out = Vec::new();
        for name in names {
            let c = Connector::new(merchant.id, *name, format!("https://gs.test/{name}"), Utc::now());
            store.upsert_connector(&c).await.unwrap();
            out.push(c);
        }
        out
    }

    struct PanickingAdapter;

    #[async_trait]
    impl ExtractionAdapter for PanickingAdapter {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn extract(&self, _connector: &Connector) -> Result<Extraction, AdapterError> {
            panic!("renderer crashed")
        }

        async fn shutdown(&self) -> Result<(), AdapterError> {
            Err(AdapterError::Extraction("browser already gone".to_string()))
        }
    }

    #[tokio::test]
    async fn sweep_continues_past_failures_and_aggregates() {
        let store = Arc::new(MemoryStore::new());
        let connectors = seed(&store, &["a", "b", "c"]).await;
        let adapter = Arc::new(ScriptedExtractionAdapter::new());
        adapter.push_success(
            connectors[0].id,
            vec![DealCandidate::new("Two for one", "https://gs.test/d/1")],
            2000,
        );
        adapter.push_failure(connectors[1].id, "timeout waiting for selector");
        adapter.push_success(connectors[2].id, vec![], 500);

        let orchestrator = BatchOrchestrator::new(store.clone(), adapter.clone(), config());
        let summary = orchestrator.run_scheduled_sweep().await.unwrap();

        assert_eq!(summary.trigger, RunTrigger::Scheduled);
        assert_eq!((summary.succeeded, summary.failed, summary.skipped), (2, 1, 0));
        assert_eq!(summary.new_deals, 1);
        assert_eq!(summary.tokens_used, 2500);
        assert!((summary.estimated_cost - 0.0075).abs() < 1e-9);
        assert!((summary.fail_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!(summary.high_fail_rate);
        assert_eq!(adapter.shutdowns(), 1);

        let failed = store.get_connector(connectors[1].id).await.unwrap().unwrap();
        assert_eq!(failed.fail_count, 1);
        assert_eq!(failed.status, ConnectorStatus::Active);
        assert!(failed.claimed_at.is_none());
        assert_eq!(
            failed.last_error.as_deref(),
            Some("timeout waiting for selector")
        );

        let deals = store.all_deals().await;
        assert_eq!(deals[0].status, dealcrawl_core::DealStatus::Active);
    }

    #[tokio::test]
    async fn scheduled_sweep_ignores_error_and_disabled_connectors() {
        let store = Arc::new(MemoryStore::new());
        let connectors = seed(&store, &["ok", "broken", "off"]).await;
        let mut broken = connectors[1].clone();
        broken.status = ConnectorStatus::Error;
        broken.fail_count = 4;
        store.put_connector(broken).await;
        let mut off = connectors[2].clone();
        off.status = ConnectorStatus::Disabled;
        store.put_connector(off).await;

        let adapter = Arc::new(ScriptedExtractionAdapter::new());
        adapter.push_success(connectors[0].id, vec![], 0);
        let orchestrator = BatchOrchestrator::new(store.clone(), adapter.clone(), config());

        let summary = orchestrator.run_scheduled_sweep().await.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(adapter.calls(), 1);
        assert!(!summary.high_fail_rate);
    }

    #[tokio::test]
    async fn batch_skips_unknown_disabled_and_claimed() {
        let store = Arc::new(MemoryStore::new());
        let connectors = seed(&store, &["free", "busy", "off"]).await;
        let mut busy = connectors[1].clone();
        busy.claimed_at = Some(Utc::now());
        store.put_connector(busy).await;
        let mut off = connectors[2].clone();
        off.status = ConnectorStatus::Disabled;
        store.put_connector(off).await;

        let adapter = Arc::new(ScriptedExtractionAdapter::new());
        adapter.push_success(connectors[0].id, vec![], 0);
        let orchestrator = BatchOrchestrator::new(store.clone(), adapter.clone(), config());

        let missing = Uuid::new_v4();
        let ids = [
            connectors[0].id,
            connectors[1].id,
            connectors[2].id,
            missing,
            connectors[0].id,
        ];
        let summary = orchestrator.run_batch(&ids, BatchOptions::default()).await;

        assert_eq!(summary.trigger, RunTrigger::Manual);
        assert_eq!((summary.succeeded, summary.skipped), (1, 3));
        assert_eq!(summary.results.len(), 4);
        assert_eq!(adapter.calls(), 1);
        assert!(store.list_runs(Some(connectors[1].id), 10).await.unwrap().is_empty());
        let busy = store.get_connector(connectors[1].id).await.unwrap().unwrap();
        assert_eq!(busy.display_status(), ConnectorStatus::Running);
    }

    #[tokio::test]
    async fn single_run_reports_refusals_as_errors() {
        let store = Arc::new(MemoryStore::new());
        let connectors = seed(&store, &["x"]).await;
        let orchestrator = BatchOrchestrator::new(
            store.clone(),
            Arc::new(ScriptedExtractionAdapter::new()),
            config(),
        );

        let err = orchestrator
            .run_single(Uuid::new_v4(), ReconcileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectorNotFound(_)));

        let mut busy = connectors[0].clone();
        busy.claimed_at = Some(Utc::now());
        store.put_connector(busy).await;
        let err = orchestrator
            .run_single(connectors[0].id, ReconcileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectorBusy(_)));
    }

    #[tokio::test]
    async fn adapter_panic_becomes_failed_run() {
        let store = Arc::new(MemoryStore::new());
        let connectors = seed(&store, &["crashy"]).await;
        let orchestrator =
            BatchOrchestrator::new(store.clone(), Arc::new(PanickingAdapter), config());

        let outcome = orchestrator
            .run_single(connectors[0].id, ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("renderer crashed"));

        let run = store.get_run(outcome.run_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let connector = store.get_connector(connectors[0].id).await.unwrap().unwrap();
        assert_eq!(connector.fail_count, 1);
        assert!(connector.claimed_at.is_none());
    }

    #[tokio::test]
    async fn failed_health_write_still_releases_the_claim() {
        let store = Arc::new(MemoryStore::new());
        let connectors = seed(&store, &["gs-main"]).await;
        let id = connectors[0].id;
        let adapter = Arc::new(ScriptedExtractionAdapter::new());
        adapter.push_success(id, vec![], 10);
        adapter.push_failure(id, "blocked");
        adapter.push_success(id, vec![], 10);
        let orchestrator = BatchOrchestrator::new(store.clone(), adapter.clone(), config());

        store.set_health_unavailable(true);
        let first = orchestrator
            .run_single(id, ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status, OutcomeStatus::Success);
        assert!(store.get_connector(id).await.unwrap().unwrap().claimed_at.is_none());

        let second = orchestrator
            .run_single(id, ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(second.status, OutcomeStatus::Failed);
        let connector = store.get_connector(id).await.unwrap().unwrap();
        assert!(connector.claimed_at.is_none());
        assert_eq!(connector.fail_count, 0);

        store.set_health_unavailable(false);
        let third = orchestrator
            .run_single(id, ReconcileOptions::default())
            .await
            .unwrap();
        assert_eq!(third.status, OutcomeStatus::Success);
        assert_eq!(adapter.calls(), 3);
    }

    #[test]
    fn cost_estimate_is_linear_in_tokens() {
        assert!((estimate_cost(1000, 0.003) - 0.003).abs() < 1e-12);
        assert_eq!(estimate_cost(-5, 0.003), 0.0);
    }
}
