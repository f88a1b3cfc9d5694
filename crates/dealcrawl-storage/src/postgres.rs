use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealcrawl_core::{
    Connector, ConnectorStatus, CrawlRun, Deal, DealStatus, HealthTransition, Merchant, RunCompletion,
};
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::{DealStore, ExpiredDeals, StoreError};

// Path relative to crates/dealcrawl-storage/Cargo.toml.
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const MERCHANT_COLUMNS: &str = "id, name, active_deal_count, updated_at";

const CONNECTOR_COLUMNS: &str = "id, merchant_id, name, source_url, extraction_config, status, \
     fail_count, last_run_at, last_error, claimed_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, connector_id, trigger, status, started_at, completed_at, \
     new_count, updated_count, skipped_count, tokens_used, error_message";

const DEAL_COLUMNS: &str = "id, merchant_id, connector_id, natural_key, slug, title, \
     benefit_summary, coupon_code, price, original_price, starts_at, ends_at, is_evergreen, \
     landing_url, image_url, status, expired_at, view_count, click_count, created_at, updated_at";

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Postgres-backed store. The pool is expected to connect as the pipeline's
/// service role, which is not subject to the consumer-facing row policies.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!(migrations = MIGRATOR.iter().count(), "database migrations applied");
        Ok(())
    }

    async fn write_health<F>(&self, id: Uuid, transition_for: F) -> Result<Connector, StoreError>
    where
        F: FnOnce(&Connector) -> HealthTransition + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ConnectorRow>(&format!(
            "SELECT {CONNECTOR_COLUMNS} FROM connectors WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "connector",
            id,
        })?;
        let mut connector = Connector::try_from(row)?;
        let transition = transition_for(&connector);

        sqlx::query(
            "UPDATE connectors \
             SET status = $2, fail_count = $3, last_run_at = $4, last_error = $5, \
                 claimed_at = NULL, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(transition.status.as_str())
        .bind(transition.fail_count)
        .bind(transition.last_run_at)
        .bind(transition.last_error.as_deref())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        connector.apply_health(&transition);
        Ok(connector)
    }

    async fn exists(&self, table: &'static str, id: Uuid) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar(&format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE id = $1)"))
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

fn classify_write_error(err: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(format!("{what}: {}", db.message()));
        }
        if db.is_foreign_key_violation() {
            return StoreError::Conflict(format!("{what}: missing parent row ({})", db.message()));
        }
    }
    StoreError::Sqlx(err)
}

#[derive(Debug, sqlx::FromRow)]
struct MerchantRow {
    id: Uuid,
    name: String,
    active_deal_count: i32,
    updated_at: DateTime<Utc>,
}

impl From<MerchantRow> for Merchant {
    fn from(row: MerchantRow) -> Self {
        Merchant {
            id: row.id,
            name: row.name,
            active_deal_count: row.active_deal_count,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ConnectorRow {
    id: Uuid,
    merchant_id: Uuid,
    name: String,
    source_url: String,
    extraction_config: serde_json::Value,
    status: String,
    fail_count: i32,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConnectorRow> for Connector {
    type Error = StoreError;

    fn try_from(row: ConnectorRow) -> Result<Self, Self::Error> {
        Ok(Connector {
            id: row.id,
            merchant_id: row.merchant_id,
            name: row.name,
            source_url: row.source_url,
            extraction_config: row.extraction_config,
            status: row.status.parse()?,
            fail_count: row.fail_count,
            last_run_at: row.last_run_at,
            last_error: row.last_error,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    connector_id: Uuid,
    trigger: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    new_count: i32,
    updated_count: i32,
    skipped_count: i32,
    tokens_used: i64,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for CrawlRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(CrawlRun {
            id: row.id,
            connector_id: row.connector_id,
            trigger: row.trigger.parse()?,
            status: row.status.parse()?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            new_count: row.new_count,
            updated_count: row.updated_count,
            skipped_count: row.skipped_count,
            tokens_used: row.tokens_used,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DealRow {
    id: Uuid,
    merchant_id: Uuid,
    connector_id: Option<Uuid>,
    natural_key: String,
    slug: String,
    title: String,
    benefit_summary: Option<String>,
    coupon_code: Option<String>,
    price: Option<Decimal>,
    original_price: Option<Decimal>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    is_evergreen: bool,
    landing_url: String,
    image_url: Option<String>,
    status: String,
    expired_at: Option<DateTime<Utc>>,
    view_count: i64,
    click_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DealRow> for Deal {
    type Error = StoreError;

    fn try_from(row: DealRow) -> Result<Self, Self::Error> {
        Ok(Deal {
            id: row.id,
            merchant_id: row.merchant_id,
            connector_id: row.connector_id,
            natural_key: row.natural_key,
            slug: row.slug,
            title: row.title,
            benefit_summary: row.benefit_summary,
            coupon_code: row.coupon_code,
            price: row.price,
            original_price: row.original_price,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            is_evergreen: row.is_evergreen,
            landing_url: row.landing_url,
            image_url: row.image_url,
            status: row.status.parse()?,
            expired_at: row.expired_at,
            view_count: row.view_count,
            click_count: row.click_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn collect_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl DealStore for PgStore {
    async fn upsert_merchant(&self, merchant: &Merchant) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO merchants (id, name, active_deal_count, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name",
        )
        .bind(merchant.id)
        .bind(&merchant.name)
        .bind(merchant.active_deal_count)
        .bind(merchant.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_write_error(e, "upserting merchant"))?;
        Ok(())
    }

    async fn get_merchant(&self, id: Uuid) -> Result<Option<Merchant>, StoreError> {
        let row = sqlx::query_as::<_, MerchantRow>(&format!(
            "SELECT {MERCHANT_COLUMNS} FROM merchants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Merchant::from))
    }

    async fn list_merchants(&self) -> Result<Vec<Merchant>, StoreError> {
        let rows = sqlx::query_as::<_, MerchantRow>(&format!(
            "SELECT {MERCHANT_COLUMNS} FROM merchants ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Merchant::from).collect())
    }

    async fn upsert_connector(&self, connector: &Connector) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO connectors (id, merchant_id, name, source_url, extraction_config, \
                 status, fail_count, last_run_at, last_error, claimed_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO UPDATE SET \
                 merchant_id = EXCLUDED.merchant_id, \
                 name = EXCLUDED.name, \
                 source_url = EXCLUDED.source_url, \
                 extraction_config = EXCLUDED.extraction_config, \
                 status = CASE \
                     WHEN EXCLUDED.status = 'disabled' THEN 'disabled' \
                     WHEN connectors.status = 'disabled' THEN 'active' \
                     ELSE connectors.status END, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(connector.id)
        .bind(connector.merchant_id)
        .bind(&connector.name)
        .bind(&connector.source_url)
        .bind(&connector.extraction_config)
        .bind(connector.status.as_str())
        .bind(connector.fail_count)
        .bind(connector.last_run_at)
        .bind(connector.last_error.as_deref())
        .bind(connector.claimed_at)
        .bind(connector.created_at)
        .bind(connector.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(StoreError::NotFound {
                    entity: "merchant",
                    id: connector.merchant_id,
                })
            }
            Err(err) => Err(classify_write_error(err, "upserting connector")),
        }
    }

    async fn get_connector(&self, id: Uuid) -> Result<Option<Connector>, StoreError> {
        let row = sqlx::query_as::<_, ConnectorRow>(&format!(
            "SELECT {CONNECTOR_COLUMNS} FROM connectors WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Connector::try_from).transpose()
    }

    async fn list_connectors(&self) -> Result<Vec<Connector>, StoreError> {
        let rows = sqlx::query_as::<_, ConnectorRow>(&format!(
            "SELECT {CONNECTOR_COLUMNS} FROM connectors ORDER BY name, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows)
    }

    async fn list_connectors_with_status(
        &self,
        status: ConnectorStatus,
    ) -> Result<Vec<Connector>, StoreError> {
        let rows = sqlx::query_as::<_, ConnectorRow>(&format!(
            "SELECT {CONNECTOR_COLUMNS} FROM connectors WHERE status = $1 ORDER BY name, id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows)
    }

    async fn claim_connector(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE connectors SET claimed_at = $2 \
             WHERE id = $1 \
               AND status <> 'disabled' \
               AND (claimed_at IS NULL OR claimed_at < $3)",
        )
        .bind(id)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists("connectors", id).await? {
            return Err(StoreError::NotFound {
                entity: "connector",
                id,
            });
        }
        Ok(false)
    }

    async fn record_connector_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Connector, StoreError> {
        self.write_health(id, |c| c.health_after_success(at)).await
    }

    async fn record_connector_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<Connector, StoreError> {
        self.write_health(id, |c| c.health_after_failure(at, message))
            .await
    }

    async fn release_claim(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE connectors SET claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_run(&self, run: &CrawlRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO crawl_runs (id, connector_id, trigger, status, started_at, completed_at, \
                 new_count, updated_count, skipped_count, tokens_used, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(run.id)
        .bind(run.connector_id)
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.new_count)
        .bind(run.updated_count)
        .bind(run.skipped_count)
        .bind(run.tokens_used)
        .bind(run.error_message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| classify_write_error(e, "inserting crawl run"))?;
        Ok(())
    }

    async fn finish_run(
        &self,
        id: Uuid,
        completion: &RunCompletion,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = match completion {
            RunCompletion::Success {
                new_count,
                updated_count,
                skipped_count,
                tokens_used,
            } => {
                sqlx::query(
                    "UPDATE crawl_runs \
                     SET status = 'success', completed_at = $2, new_count = $3, \
                         updated_count = $4, skipped_count = $5, tokens_used = $6 \
                     WHERE id = $1 AND status = 'running'",
                )
                .bind(id)
                .bind(at)
                .bind(new_count)
                .bind(updated_count)
                .bind(skipped_count)
                .bind(tokens_used)
                .execute(&self.pool)
                .await?
            }
            RunCompletion::Failed { error_message } => {
                sqlx::query(
                    "UPDATE crawl_runs \
                     SET status = 'failed', completed_at = $2, error_message = $3 \
                     WHERE id = $1 AND status = 'running'",
                )
                .bind(id)
                .bind(at)
                .bind(error_message)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists("crawl_runs", id).await? {
            return Err(StoreError::NotFound {
                entity: "crawl run",
                id,
            });
        }
        Ok(false)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<CrawlRun>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM crawl_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CrawlRun::try_from).transpose()
    }

    async fn list_runs(
        &self,
        connector_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CrawlRun>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM crawl_runs \
             WHERE ($1::uuid IS NULL OR connector_id = $1) \
             ORDER BY started_at DESC, id DESC \
             LIMIT $2"
        ))
        .bind(connector_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows)
    }

    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE crawl_runs \
             SET status = 'failed', completed_at = $2, error_message = $3 \
             WHERE status = 'running' AND started_at < $1",
        )
        .bind(started_before)
        .bind(at)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deals_for_merchant(&self, merchant_id: Uuid) -> Result<Vec<Deal>, StoreError> {
        let rows = sqlx::query_as::<_, DealRow>(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE merchant_id = $1 ORDER BY created_at, id"
        ))
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows)
    }

    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, StoreError> {
        let row = sqlx::query_as::<_, DealRow>(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Deal::try_from).transpose()
    }

    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO deals ({DEAL_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21)"
        ))
        .bind(deal.id)
        .bind(deal.merchant_id)
        .bind(deal.connector_id)
        .bind(&deal.natural_key)
        .bind(&deal.slug)
        .bind(&deal.title)
        .bind(deal.benefit_summary.as_deref())
        .bind(deal.coupon_code.as_deref())
        .bind(deal.price)
        .bind(deal.original_price)
        .bind(deal.starts_at)
        .bind(deal.ends_at)
        .bind(deal.is_evergreen)
        .bind(&deal.landing_url)
        .bind(deal.image_url.as_deref())
        .bind(deal.status.as_str())
        .bind(deal.expired_at)
        .bind(deal.view_count)
        .bind(deal.click_count)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_write_error(e, "inserting deal"))?;
        Ok(())
    }

    async fn update_deal_fields(&self, deal: &Deal) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE deals \
             SET title = $2, benefit_summary = $3, coupon_code = $4, price = $5, \
                 original_price = $6, starts_at = $7, ends_at = $8, is_evergreen = $9, \
                 image_url = $10, updated_at = $11 \
             WHERE id = $1",
        )
        .bind(deal.id)
        .bind(&deal.title)
        .bind(deal.benefit_summary.as_deref())
        .bind(deal.coupon_code.as_deref())
        .bind(deal.price)
        .bind(deal.original_price)
        .bind(deal.starts_at)
        .bind(deal.ends_at)
        .bind(deal.is_evergreen)
        .bind(deal.image_url.as_deref())
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| classify_write_error(e, "updating deal"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "deal",
                id: deal.id,
            });
        }
        Ok(())
    }

    async fn relist_deal(
        &self,
        id: Uuid,
        status: DealStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE deals SET status = $2, expired_at = NULL, updated_at = $3 \
             WHERE id = $1 AND status IN ('expired', 'hidden')",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_deals(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE deals SET status = 'expired', expired_at = $2, updated_at = $2 \
             WHERE id = ANY($1) AND status IN ('active', 'pending')",
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn expire_overdue_deals(&self, now: DateTime<Utc>) -> Result<ExpiredDeals, StoreError> {
        let merchant_ids: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE deals SET status = 'expired', expired_at = $1, updated_at = $1 \
             WHERE status = 'active' AND NOT is_evergreen AND ends_at < $1 \
             RETURNING merchant_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ExpiredDeals {
            count: merchant_ids.len() as u64,
            merchant_ids: merchant_ids.into_iter().collect(),
        })
    }

    async fn hide_expired_deals(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE deals SET status = 'hidden' \
             WHERE status = 'expired' AND expired_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recount_active_deals(
        &self,
        merchant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        sqlx::query_scalar::<_, i32>(
            "UPDATE merchants \
             SET active_deal_count = ( \
                     SELECT COUNT(*)::int FROM deals \
                     WHERE merchant_id = $1 AND status = 'active'), \
                 updated_at = $2 \
             WHERE id = $1 \
             RETURNING active_deal_count",
        )
        .bind(merchant_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "merchant",
            id: merchant_id,
        })
    }
}
