//! HTTP trigger surface: cron sweeps, operator runs and status polling.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dealcrawl_core::{Connector, ConnectorStatus, CrawlRun, RunStatus, RunTrigger};
use dealcrawl_storage::DealStore;
use dealcrawl_sync::{BatchOptions, BatchOrchestrator, LifecycleSweeper, ReconcileOptions, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

mod auth;

pub use auth::{require_admin_auth, require_cron_auth, AuthConfig};

pub const CRATE_NAME: &str = "dealcrawl-web";

const DEFAULT_RUNS_LIMIT: i64 = 50;
const MAX_RUNS_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DealStore>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub sweeper: Arc<LifecycleSweeper>,
}

pub fn app(state: AppState, auth: AuthConfig) -> Router {
    let auth = Arc::new(auth);

    let cron = Router::new()
        .route("/api/cron/crawl", get(cron_crawl_handler).post(cron_crawl_handler))
        .route(
            "/api/cron/lifecycle",
            get(cron_lifecycle_handler).post(cron_lifecycle_handler),
        )
        .route_layer(middleware::from_fn_with_state(auth.clone(), require_cron_auth));

    let admin = Router::new()
        .route("/api/admin/crawl/batch", post(admin_batch_handler))
        .route("/api/admin/connectors", get(list_connectors_handler))
        .route("/api/admin/connectors/{id}/run", post(run_connector_handler))
        .route("/api/admin/runs", get(list_runs_handler))
        .route_layer(middleware::from_fn_with_state(auth, require_admin_auth));

    Router::new()
        .route("/health", get(health_handler))
        .merge(cron)
        .merge(admin)
        .with_state(Arc::new(state))
}

pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    connector_ids: Vec<Uuid>,
    #[serde(flatten)]
    options: BatchOptions,
}

/// Body of a single-connector run. Optional; an empty body means defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RunRequest {
    auto_approve: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectorView {
    id: Uuid,
    merchant_id: Uuid,
    name: String,
    source_url: String,
    status: ConnectorStatus,
    fail_count: i32,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
}

impl From<Connector> for ConnectorView {
    fn from(c: Connector) -> Self {
        Self {
            status: c.display_status(),
            id: c.id,
            merchant_id: c.merchant_id,
            name: c.name,
            source_url: c.source_url,
            fail_count: c.fail_count,
            last_run_at: c.last_run_at,
            last_error: c.last_error,
            claimed_at: c.claimed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunView {
    id: Uuid,
    connector_id: Uuid,
    trigger: RunTrigger,
    status: RunStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    new_count: i32,
    updated_count: i32,
    skipped_count: i32,
    tokens_used: i64,
    error_message: Option<String>,
}

impl From<CrawlRun> for RunView {
    fn from(r: CrawlRun) -> Self {
        Self {
            id: r.id,
            connector_id: r.connector_id,
            trigger: r.trigger,
            status: r.status,
            started_at: r.started_at,
            completed_at: r.completed_at,
            new_count: r.new_count,
            updated_count: r.updated_count,
            skipped_count: r.skipped_count,
            tokens_used: r.tokens_used,
            error_message: r.error_message,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunsQuery {
    connector_id: Option<Uuid>,
    limit: Option<i64>,
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn cron_crawl_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.run_scheduled_sweep().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn cron_lifecycle_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.sweeper.run_scheduled(Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn admin_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> Response {
    if request.connector_ids.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "connectorIds must not be empty",
        );
    }
    let summary = state
        .orchestrator
        .run_batch(&request.connector_ids, request.options)
        .await;
    Json(summary).into_response()
}

async fn run_connector_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        match serde_json::from_slice::<RunRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid request body: {err}"),
                )
            }
        }
    };
    let options = ReconcileOptions {
        auto_approve: request.auto_approve,
        expire_old_deals: false,
    };
    match state.orchestrator.run_single(id, options).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(SyncError::ConnectorNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "not_found", "connector not found")
        }
        Err(SyncError::ConnectorBusy(_)) => error_response(
            StatusCode::CONFLICT,
            "connector_running",
            "connector is already running",
        ),
        Err(SyncError::ConnectorDisabled(_)) => error_response(
            StatusCode::CONFLICT,
            "connector_disabled",
            "connector is disabled",
        ),
        Err(err) => server_error(err.into()),
    }
}

async fn list_connectors_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_connectors().await {
        Ok(connectors) => Json(
            connectors
                .into_iter()
                .map(ConnectorView::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    match state.store.list_runs(query.connector_id, limit).await {
        Ok(runs) => Json(runs.into_iter().map(RunView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err.into()),
    }
}

pub(crate) fn error_response(status: StatusCode, code: &'static str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        &err.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request};
    use dealcrawl_adapters::ScriptedExtractionAdapter;
    use dealcrawl_core::{DealCandidate, Merchant};
    use dealcrawl_storage::MemoryStore;
    use dealcrawl_sync::OrchestratorConfig;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    const CRON: &str = "cron-secret";
    const ADMIN: &str = "admin-token";

    struct Fixture {
        store: Arc<MemoryStore>,
        adapter: Arc<ScriptedExtractionAdapter>,
        connector: Connector,
        router: Router,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let merchant = Merchant::new(Uuid::new_v4(), "CU", Utc::now());
        store.upsert_merchant(&merchant).await.unwrap();
        let connector = Connector::new(merchant.id, "cu-promo", "https://cu.test/promo", Utc::now());
        store.upsert_connector(&connector).await.unwrap();

        let adapter = Arc::new(ScriptedExtractionAdapter::new());
        let orchestrator = BatchOrchestrator::new(
            store.clone(),
            adapter.clone(),
            OrchestratorConfig {
                inter_connector_delay: Duration::ZERO,
                ..OrchestratorConfig::default()
            },
        );
        let state = AppState {
            store: store.clone(),
            orchestrator: Arc::new(orchestrator),
            sweeper: Arc::new(LifecycleSweeper::new(store.clone())),
        };
        let auth = AuthConfig {
            cron_secret: Some(CRON.to_string()),
            admin_token: Some(ADMIN.to_string()),
            trusted_scheduler_header: None,
        };
        Fixture {
            store,
            adapter,
            connector,
            router: app(state, auth),
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let f = fixture().await;
        let resp = f
            .router
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cron_routes_require_the_cron_secret() {
        let f = fixture().await;
        let denied = f
            .router
            .clone()
            .oneshot(request("GET", "/api/cron/crawl", Some(ADMIN), None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(denied).await["error"]["code"], "unauthorized");
        assert_eq!(f.adapter.calls(), 0);

        f.adapter.push_success(
            f.connector.id,
            vec![DealCandidate::new("1+1 Kimbap", "https://cu.test/p/1")],
            300,
        );
        let resp = f
            .router
            .oneshot(request("POST", "/api/cron/crawl", Some(CRON), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["succeeded"], 1);
        assert_eq!(body["newDeals"], 1);
        assert_eq!(body["trigger"], "scheduled");
    }

    #[tokio::test]
    async fn lifecycle_route_returns_summary() {
        let f = fixture().await;
        let resp = f
            .router
            .oneshot(request("GET", "/api/cron/lifecycle", Some(CRON), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["expired"], 0);
        assert_eq!(body["merchantsRecounted"], 1);
    }

    #[tokio::test]
    async fn admin_batch_runs_listed_connectors() {
        let f = fixture().await;
        f.adapter.push_failure(f.connector.id, "blocked by robots");
        let body = json!({
            "connectorIds": [f.connector.id, Uuid::new_v4()],
            "autoApprove": false,
            "expireOldDeals": true
        });
        let resp = f
            .router
            .clone()
            .oneshot(request("POST", "/api/admin/crawl/batch", Some(ADMIN), Some(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = json_body(resp).await;
        assert_eq!(summary["failed"], 1);
        assert_eq!(summary["skipped"], 1);
        assert_eq!(summary["results"][0]["status"], "failed");
        assert_eq!(summary["results"][0]["error"], "blocked by robots");

        let empty = f
            .router
            .oneshot(request(
                "POST",
                "/api/admin/crawl/batch",
                Some(ADMIN),
                Some(json!({ "connectorIds": [] })),
            ))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn single_run_maps_refusals_to_status_codes() {
        let f = fixture().await;
        let missing = f
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/admin/connectors/{}/run", Uuid::new_v4()),
                Some(ADMIN),
                Some(json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let mut busy = f.connector.clone();
        busy.claimed_at = Some(Utc::now());
        f.store.put_connector(busy).await;
        let conflict = f
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/admin/connectors/{}/run", f.connector.id),
                Some(ADMIN),
                Some(json!({ "autoApprove": true })),
            ))
            .await
            .unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let listed = f
            .router
            .oneshot(request("GET", "/api/admin/connectors", Some(ADMIN), None))
            .await
            .unwrap();
        let connectors = json_body(listed).await;
        assert_eq!(connectors[0]["status"], "running");
    }

    #[tokio::test]
    async fn single_run_succeeds_and_shows_in_runs() {
        let f = fixture().await;
        f.adapter.push_success(
            f.connector.id,
            vec![DealCandidate::new("Milk 2+1", "https://cu.test/p/milk")],
            42,
        );
        let resp = f
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/admin/connectors/{}/run", f.connector.id),
                Some(ADMIN),
                Some(json!({ "autoApprove": true })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = json_body(resp).await;
        assert_eq!(outcome["status"], "success");
        assert_eq!(outcome["newCount"], 1);

        let runs = f
            .router
            .oneshot(request(
                "GET",
                &format!("/api/admin/runs?connectorId={}&limit=5", f.connector.id),
                Some(ADMIN),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(runs.status(), StatusCode::OK);
        let runs = json_body(runs).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["status"], "success");
        assert_eq!(runs[0]["trigger"], "manual");
        assert_eq!(runs[0]["tokensUsed"], 42);
    }

    #[tokio::test]
    async fn single_run_body_is_optional_and_only_carries_auto_approve() {
        let f = fixture().await;
        let run_uri = format!("/api/admin/connectors/{}/run", f.connector.id);
        f.adapter.push_success(
            f.connector.id,
            vec![
                DealCandidate::new("Ramen 1+1", "https://cu.test/p/ramen"),
                DealCandidate::new("Soda 2+1", "https://cu.test/p/soda"),
            ],
            10,
        );
        let bare = f
            .router
            .clone()
            .oneshot(request("POST", &run_uri, Some(ADMIN), None))
            .await
            .unwrap();
        assert_eq!(bare.status(), StatusCode::OK);
        assert_eq!(json_body(bare).await["newCount"], 2);
        assert!(f
            .store
            .all_deals()
            .await
            .iter()
            .all(|d| d.status == dealcrawl_core::DealStatus::Pending));

        f.adapter.push_success(
            f.connector.id,
            vec![DealCandidate::new("Ramen 1+1", "https://cu.test/p/ramen")],
            10,
        );
        let resp = f
            .router
            .clone()
            .oneshot(request(
                "POST",
                &run_uri,
                Some(ADMIN),
                Some(json!({ "autoApprove": true, "expireOldDeals": true })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["expiredCount"], 0);
        assert!(f
            .store
            .all_deals()
            .await
            .iter()
            .all(|d| d.status == dealcrawl_core::DealStatus::Pending));

        let garbage = f
            .router
            .oneshot(request("POST", &run_uri, Some(ADMIN), Some(json!("yes please"))))
            .await
            .unwrap();
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(f.adapter.calls(), 2);
    }
}
