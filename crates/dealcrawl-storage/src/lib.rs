//! Persistence for connectors, crawl runs, deals and merchant aggregates.
//!
//! [`DealStore`] is the seam the pipeline writes through. [`PgStore`] is the
//! production implementation (a service connection that bypasses row-level
//! access control); [`MemoryStore`] backs local runs and tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealcrawl_core::{
    Connector, ConnectorStatus, CrawlRun, Deal, DealStatus, Merchant, ParseStatusError,
    RunCompletion,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PoolConfig};

pub const CRATE_NAME: &str = "dealcrawl-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<ParseStatusError> for StoreError {
    fn from(err: ParseStatusError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Result of the expire phase: number of rows flipped and the merchants they belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredDeals {
    pub count: u64,
    pub merchant_ids: BTreeSet<Uuid>,
}

#[async_trait]
pub trait DealStore: Send + Sync {
    async fn upsert_merchant(&self, merchant: &Merchant) -> Result<(), StoreError>;
    async fn get_merchant(&self, id: Uuid) -> Result<Option<Merchant>, StoreError>;
    async fn list_merchants(&self) -> Result<Vec<Merchant>, StoreError>;

    /// Inserts a connector or refreshes its definition. Health columns of an
    /// existing row are kept, except that disabling/enabling is honoured.
    async fn upsert_connector(&self, connector: &Connector) -> Result<(), StoreError>;
    async fn get_connector(&self, id: Uuid) -> Result<Option<Connector>, StoreError>;
    async fn list_connectors(&self) -> Result<Vec<Connector>, StoreError>;
    async fn list_connectors_with_status(
        &self,
        status: ConnectorStatus,
    ) -> Result<Vec<Connector>, StoreError>;

    /// Atomically takes the run claim on a runnable connector. Returns `false`
    /// when another run holds a claim newer than `stale_before`.
    async fn claim_connector(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Applies the success transition and releases the claim.
    async fn record_connector_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Connector, StoreError>;
    /// Applies the failure transition and releases the claim.
    async fn record_connector_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<Connector, StoreError>;
    /// Drops the run claim without touching health. Used when the health write failed.
    async fn release_claim(&self, id: Uuid) -> Result<(), StoreError>;

    async fn insert_run(&self, run: &CrawlRun) -> Result<(), StoreError>;
    /// Terminal write. Returns `false` if the run was no longer `running`.
    async fn finish_run(
        &self,
        id: Uuid,
        completion: &RunCompletion,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn get_run(&self, id: Uuid) -> Result<Option<CrawlRun>, StoreError>;
    async fn list_runs(
        &self,
        connector_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CrawlRun>, StoreError>;
    /// Fails every run still `running` that started before `started_before`.
    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError>;

    async fn deals_for_merchant(&self, merchant_id: Uuid) -> Result<Vec<Deal>, StoreError>;
    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, StoreError>;
    /// Fails with [`StoreError::Conflict`] on a duplicate `(merchant_id, natural_key)`.
    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError>;
    /// Writes the candidate-tracked columns of `deal` and `updated_at`.
    async fn update_deal_fields(&self, deal: &Deal) -> Result<(), StoreError>;
    /// Moves an `expired` or `hidden` deal back to `status` and clears
    /// `expired_at`. Returns `false` if the deal was not in either state.
    async fn relist_deal(
        &self,
        id: Uuid,
        status: DealStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Expires the given deals if they are still `active` or `pending`.
    async fn expire_deals(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64, StoreError>;
    /// Expire phase: non-evergreen active deals whose `ends_at` has passed.
    async fn expire_overdue_deals(&self, now: DateTime<Utc>) -> Result<ExpiredDeals, StoreError>;
    /// Hide phase: expired deals with `expired_at < cutoff`.
    async fn hide_expired_deals(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
    /// Recomputes and persists `active_deal_count`, returning the new value.
    async fn recount_active_deals(
        &self,
        merchant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError>;
}
