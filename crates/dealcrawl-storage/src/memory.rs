use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealcrawl_core::{
    Connector, ConnectorStatus, CrawlRun, Deal, DealStatus, Merchant, RunCompletion, RunStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{DealStore, ExpiredDeals, StoreError};

/// In-process store with the same semantics as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    runs_unavailable: AtomicBool,
    health_unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    merchants: HashMap<Uuid, Merchant>,
    connectors: HashMap<Uuid, Connector>,
    runs: HashMap<Uuid, CrawlRun>,
    deals: HashMap<Uuid, Deal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every crawl-run write fail with [`StoreError::Unavailable`].
    pub fn set_runs_unavailable(&self, unavailable: bool) {
        self.runs_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every connector health write fail with [`StoreError::Unavailable`].
    pub fn set_health_unavailable(&self, unavailable: bool) {
        self.health_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrites a deal wholesale, bypassing the reconciler's column rules.
    pub async fn put_deal(&self, deal: Deal) {
        self.state.lock().await.deals.insert(deal.id, deal);
    }

    /// Overwrites a connector wholesale, including its health columns.
    pub async fn put_connector(&self, connector: Connector) {
        self.state
            .lock()
            .await
            .connectors
            .insert(connector.id, connector);
    }

    pub async fn all_deals(&self) -> Vec<Deal> {
        let mut deals: Vec<_> = self.state.lock().await.deals.values().cloned().collect();
        deals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.slug.cmp(&b.slug)));
        deals
    }

    fn check_health_available(&self) -> Result<(), StoreError> {
        if self.health_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connector health".to_string()));
        }
        Ok(())
    }

    fn check_runs_available(&self) -> Result<(), StoreError> {
        if self.runs_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("crawl_runs".to_string()));
        }
        Ok(())
    }
}

fn connector_mut<'a>(
    state: &'a mut MemoryState,
    id: Uuid,
) -> Result<&'a mut Connector, StoreError> {
    state.connectors.get_mut(&id).ok_or(StoreError::NotFound {
        entity: "connector",
        id,
    })
}

#[async_trait]
impl DealStore for MemoryStore {
    async fn upsert_merchant(&self, merchant: &Merchant) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .merchants
            .entry(merchant.id)
            .and_modify(|m| m.name = merchant.name.clone())
            .or_insert_with(|| merchant.clone());
        Ok(())
    }

    async fn get_merchant(&self, id: Uuid) -> Result<Option<Merchant>, StoreError> {
        Ok(self.state.lock().await.merchants.get(&id).cloned())
    }

    async fn list_merchants(&self) -> Result<Vec<Merchant>, StoreError> {
        let mut merchants: Vec<_> = self.state.lock().await.merchants.values().cloned().collect();
        merchants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(merchants)
    }

    async fn upsert_connector(&self, connector: &Connector) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.merchants.contains_key(&connector.merchant_id) {
            return Err(StoreError::NotFound {
                entity: "merchant",
                id: connector.merchant_id,
            });
        }
        match state.connectors.get_mut(&connector.id) {
            Some(existing) => {
                existing.merchant_id = connector.merchant_id;
                existing.name = connector.name.clone();
                existing.source_url = connector.source_url.clone();
                existing.extraction_config = connector.extraction_config.clone();
                existing.status = match (connector.status, existing.status) {
                    (ConnectorStatus::Disabled, _) => ConnectorStatus::Disabled,
                    (_, ConnectorStatus::Disabled) => ConnectorStatus::Active,
                    (_, current) => current,
                };
                existing.updated_at = connector.updated_at;
            }
            None => {
                state.connectors.insert(connector.id, connector.clone());
            }
        }
        Ok(())
    }

    async fn get_connector(&self, id: Uuid) -> Result<Option<Connector>, StoreError> {
        Ok(self.state.lock().await.connectors.get(&id).cloned())
    }

    async fn list_connectors(&self) -> Result<Vec<Connector>, StoreError> {
        let mut connectors: Vec<_> = self
            .state
            .lock()
            .await
            .connectors
            .values()
            .cloned()
            .collect();
        connectors.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(connectors)
    }

    async fn list_connectors_with_status(
        &self,
        status: ConnectorStatus,
    ) -> Result<Vec<Connector>, StoreError> {
        Ok(self
            .list_connectors()
            .await?
            .into_iter()
            .filter(|c| c.status == status)
            .collect())
    }

    async fn claim_connector(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let connector = connector_mut(&mut state, id)?;
        if !connector.is_runnable() {
            return Ok(false);
        }
        if matches!(connector.claimed_at, Some(claimed) if claimed >= stale_before) {
            return Ok(false);
        }
        connector.claimed_at = Some(now);
        Ok(true)
    }

    async fn record_connector_success(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Connector, StoreError> {
        self.check_health_available()?;
        let mut state = self.state.lock().await;
        let connector = connector_mut(&mut state, id)?;
        let transition = connector.health_after_success(at);
        connector.apply_health(&transition);
        Ok(connector.clone())
    }

    async fn record_connector_failure(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<Connector, StoreError> {
        self.check_health_available()?;
        let mut state = self.state.lock().await;
        let connector = connector_mut(&mut state, id)?;
        let transition = connector.health_after_failure(at, message);
        connector.apply_health(&transition);
        Ok(connector.clone())
    }

    async fn release_claim(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        connector_mut(&mut state, id)?.claimed_at = None;
        Ok(())
    }

    async fn insert_run(&self, run: &CrawlRun) -> Result<(), StoreError> {
        self.check_runs_available()?;
        let mut state = self.state.lock().await;
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("crawl run {} exists", run.id)));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish_run(
        &self,
        id: Uuid,
        completion: &RunCompletion,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_runs_available()?;
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&id) {
            Some(run) if run.status == RunStatus::Running => {
                run.apply_completion(completion, at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "crawl run",
                id,
            }),
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<CrawlRun>, StoreError> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }

    async fn list_runs(
        &self,
        connector_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CrawlRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| connector_id.map_or(true, |id| r.connector_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(runs)
    }

    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        at: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, StoreError> {
        self.check_runs_available()?;
        let mut state = self.state.lock().await;
        let completion = RunCompletion::Failed {
            error_message: message.to_string(),
        };
        let mut reaped = 0;
        for run in state.runs.values_mut() {
            if run.status == RunStatus::Running && run.started_at < started_before {
                run.apply_completion(&completion, at);
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn deals_for_merchant(&self, merchant_id: Uuid) -> Result<Vec<Deal>, StoreError> {
        let state = self.state.lock().await;
        let mut deals: Vec<_> = state
            .deals
            .values()
            .filter(|d| d.merchant_id == merchant_id)
            .cloned()
            .collect();
        deals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deals)
    }

    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, StoreError> {
        Ok(self.state.lock().await.deals.get(&id).cloned())
    }

    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let duplicate = state.deals.values().any(|d| {
            d.merchant_id == deal.merchant_id
                && (d.natural_key == deal.natural_key || d.slug == deal.slug)
        });
        if duplicate || state.deals.contains_key(&deal.id) {
            return Err(StoreError::Conflict(format!(
                "deal {} for merchant {} already exists",
                deal.natural_key, deal.merchant_id
            )));
        }
        state.deals.insert(deal.id, deal.clone());
        Ok(())
    }

    async fn update_deal_fields(&self, deal: &Deal) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let existing = state.deals.get_mut(&deal.id).ok_or(StoreError::NotFound {
            entity: "deal",
            id: deal.id,
        })?;
        existing.title = deal.title.clone();
        existing.benefit_summary = deal.benefit_summary.clone();
        existing.coupon_code = deal.coupon_code.clone();
        existing.price = deal.price;
        existing.original_price = deal.original_price;
        existing.starts_at = deal.starts_at;
        existing.ends_at = deal.ends_at;
        existing.is_evergreen = deal.is_evergreen;
        existing.image_url = deal.image_url.clone();
        existing.updated_at = deal.updated_at;
        Ok(())
    }

    async fn relist_deal(
        &self,
        id: Uuid,
        status: DealStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let deal = state.deals.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "deal",
            id,
        })?;
        if !matches!(deal.status, DealStatus::Expired | DealStatus::Hidden) {
            return Ok(false);
        }
        deal.status = status;
        deal.expired_at = None;
        deal.updated_at = at;
        Ok(true)
    }

    async fn expire_deals(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for id in ids {
            if let Some(deal) = state.deals.get_mut(id) {
                if matches!(deal.status, DealStatus::Active | DealStatus::Pending) {
                    deal.status = DealStatus::Expired;
                    deal.expired_at = Some(at);
                    deal.updated_at = at;
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    async fn expire_overdue_deals(&self, now: DateTime<Utc>) -> Result<ExpiredDeals, StoreError> {
        let mut state = self.state.lock().await;
        let mut out = ExpiredDeals::default();
        for deal in state.deals.values_mut() {
            let overdue = matches!(deal.ends_at, Some(ends_at) if ends_at < now);
            if deal.status == DealStatus::Active && !deal.is_evergreen && overdue {
                deal.status = DealStatus::Expired;
                deal.expired_at = Some(now);
                deal.updated_at = now;
                out.count += 1;
                out.merchant_ids.insert(deal.merchant_id);
            }
        }
        Ok(out)
    }

    async fn hide_expired_deals(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut hidden = 0;
        for deal in state.deals.values_mut() {
            let past_cutoff = matches!(deal.expired_at, Some(expired_at) if expired_at < cutoff);
            if deal.status == DealStatus::Expired && past_cutoff {
                deal.status = DealStatus::Hidden;
                hidden += 1;
            }
        }
        Ok(hidden)
    }

    async fn recount_active_deals(
        &self,
        merchant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let mut state = self.state.lock().await;
        let count = state
            .deals
            .values()
            .filter(|d| d.merchant_id == merchant_id && d.status == DealStatus::Active)
            .count();
        let count = i32::try_from(count).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let merchant = state
            .merchants
            .get_mut(&merchant_id)
            .ok_or(StoreError::NotFound {
                entity: "merchant",
                id: merchant_id,
            })?;
        merchant.active_deal_count = count;
        merchant.updated_at = at;
        Ok(count)
    }
}
