use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealcrawl_core::{Connector, Deal, DealStatus, ExtractedCandidate};
use dealcrawl_storage::DealStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{NaturalKeyStrategy, SyncError, TitleUrlKey};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileOptions {
    /// Insert new deals as `active` instead of `pending`.
    pub auto_approve: bool,
    /// Expire this connector's live deals that are absent from the candidate set.
    pub expire_old_deals: bool,
}

/// One entry of [`ReconcileResult::errors`]. `index` is `None` for batch-level
/// failures (the expire step), otherwise the candidate's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailure {
    pub index: Option<usize>,
    pub title: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub new_count: i32,
    pub updated_count: i32,
    pub skipped_count: i32,
    pub expired_count: u64,
    pub errors: Vec<ReconcileFailure>,
}

/// Decides insert / update / skip per candidate against the merchant's deals.
pub struct Reconciler {
    store: Arc<dyn DealStore>,
    keys: Arc<dyn NaturalKeyStrategy>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self {
            store,
            keys: Arc::new(TitleUrlKey),
        }
    }

    pub fn with_key_strategy(mut self, keys: Arc<dyn NaturalKeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    /// Only the initial load of existing deals is fatal. Every later failure
    /// is collected into the result.
    pub async fn reconcile(
        &self,
        connector: &Connector,
        candidates: &[ExtractedCandidate],
        options: ReconcileOptions,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, SyncError> {
        let mut existing: HashMap<String, Deal> = self
            .store
            .deals_for_merchant(connector.merchant_id)
            .await?
            .into_iter()
            .map(|deal| (deal.natural_key.clone(), deal))
            .collect();

        let mut result = ReconcileResult::default();
        let mut seen = HashSet::new();
        let insert_status = if options.auto_approve {
            DealStatus::Active
        } else {
            DealStatus::Pending
        };

        for (index, extracted) in candidates.iter().enumerate() {
            let fail = |message: String| ReconcileFailure {
                index: Some(index),
                title: extracted
                    .title()
                    .map(str::to_string)
                    .filter(|t| !t.is_empty()),
                message,
            };

            let (candidate, landing_url) = match extracted
                .parsed()
                .and_then(|candidate| Ok((candidate, candidate.validate()?)))
            {
                Ok(ok) => ok,
                Err(err) => {
                    result.errors.push(fail(err.to_string()));
                    continue;
                }
            };
            let key = self.keys.natural_key(candidate, &landing_url);
            seen.insert(key.clone());

            if let Some(current) = existing.get_mut(&key) {
                let changed = current.changed_fields(candidate);
                let relisted = current.relisted_by(candidate, now);
                if changed.is_empty() && !relisted {
                    result.skipped_count += 1;
                    continue;
                }

                let mut updated = current.clone();
                if !changed.is_empty() {
                    updated.apply_candidate(candidate, now);
                    if let Err(err) = self.store.update_deal_fields(&updated).await {
                        result.errors.push(fail(err.to_string()));
                        continue;
                    }
                    debug!(deal_id = %updated.id, fields = ?changed, "deal updated");
                }
                if relisted {
                    match self.store.relist_deal(updated.id, insert_status, now).await {
                        Ok(_) => {
                            debug!(deal_id = %updated.id, from = %updated.status, to = %insert_status, "deal relisted");
                            updated.status = insert_status;
                            updated.expired_at = None;
                            updated.updated_at = now;
                        }
                        Err(err) => {
                            result.errors.push(fail(format!("relisting deal: {err}")));
                            if changed.is_empty() {
                                continue;
                            }
                        }
                    }
                }
                *current = updated;
                result.updated_count += 1;
                continue;
            }

            let deal = Deal::from_candidate(
                connector.merchant_id,
                Some(connector.id),
                key.clone(),
                candidate,
                insert_status,
                now,
            );
            match self.store.insert_deal(&deal).await {
                Ok(()) => {
                    debug!(deal_id = %deal.id, slug = %deal.slug, "deal inserted");
                    existing.insert(key, deal);
                    result.new_count += 1;
                }
                Err(err) => result.errors.push(fail(err.to_string())),
            }
        }

        // An empty set usually means a broken extraction, not a merchant with no deals.
        if options.expire_old_deals && !seen.is_empty() {
            let stale: Vec<Uuid> = existing
                .values()
                .filter(|d| d.connector_id == Some(connector.id))
                .filter(|d| matches!(d.status, DealStatus::Active | DealStatus::Pending))
                .filter(|d| !seen.contains(&d.natural_key))
                .map(|d| d.id)
                .collect();
            if !stale.is_empty() {
                match self.store.expire_deals(&stale, now).await {
                    Ok(count) => result.expired_count = count,
                    Err(err) => {
                        warn!(connector_id = %connector.id, error = %err, "expiring absent deals failed");
                        result.errors.push(ReconcileFailure {
                            index: None,
                            title: None,
                            message: format!("expiring absent deals: {err}"),
                        });
                    }
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dealcrawl_core::{DealCandidate, Merchant};
    use dealcrawl_storage::MemoryStore;
    use rust_decimal::Decimal;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, Reconciler, Connector) {
        let store = Arc::new(MemoryStore::new());
        let merchant = Merchant::new(Uuid::new_v4(), "CU", now());
        store.upsert_merchant(&merchant).await.unwrap();
        let connector = Connector::new(merchant.id, "cu-promo", "https://cu.test/promo", now());
        store.upsert_connector(&connector).await.unwrap();
        let reconciler = Reconciler::new(store.clone());
        (store, reconciler, connector)
    }

    fn offer(title: &str, path: &str, price: i64) -> DealCandidate {
        let mut c = DealCandidate::new(title, format!("https://cu.test{path}"));
        c.price = Some(Decimal::new(price, 0));
        c
    }

    fn candidate(title: &str, path: &str, price: i64) -> ExtractedCandidate {
        offer(title, path, price).into()
    }

    #[tokio::test]
    async fn new_deals_respect_auto_approve() {
        let (store, reconciler, connector) = setup().await;
        let pending = reconciler
            .reconcile(&connector, &[candidate("A", "/a", 1000)], ReconcileOptions::default(), now())
            .await
            .unwrap();
        assert_eq!(pending.new_count, 1);

        let approve = ReconcileOptions {
            auto_approve: true,
            ..Default::default()
        };
        reconciler
            .reconcile(&connector, &[candidate("B", "/b", 1000)], approve, now())
            .await
            .unwrap();

        let deals = store.all_deals().await;
        let status_of = |title: &str| deals.iter().find(|d| d.title == title).unwrap().status;
        assert_eq!(status_of("A"), DealStatus::Pending);
        assert_eq!(status_of("B"), DealStatus::Active);
        assert!(deals.iter().all(|d| d.connector_id == Some(connector.id)));
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let (_store, reconciler, connector) = setup().await;
        let batch = vec![candidate("A", "/a", 1000), candidate("B", "/b", 2000)];

        let first = reconciler
            .reconcile(&connector, &batch, ReconcileOptions::default(), now())
            .await
            .unwrap();
        let second = reconciler
            .reconcile(&connector, &batch, ReconcileOptions::default(), now())
            .await
            .unwrap();

        assert_eq!(first.new_count, 2);
        assert_eq!(second.new_count, 0);
        assert_eq!(second.updated_count, 0);
        assert_eq!(second.skipped_count, 2);
    }

    #[tokio::test]
    async fn changed_price_updates_in_place_and_keeps_identity() {
        let (store, reconciler, connector) = setup().await;
        let approve = ReconcileOptions {
            auto_approve: true,
            ..Default::default()
        };
        reconciler
            .reconcile(&connector, &[candidate("A", "/a", 1000)], approve, now())
            .await
            .unwrap();
        let before = store.all_deals().await.remove(0);

        let later = now() + chrono::Duration::hours(6);
        let result = reconciler
            .reconcile(&connector, &[candidate("A", "/a", 900)], ReconcileOptions::default(), later)
            .await
            .unwrap();
        assert_eq!(result.updated_count, 1);

        let after = store.get_deal(before.id).await.unwrap().unwrap();
        assert_eq!(after.price, Some(Decimal::new(900, 0)));
        assert_eq!(after.slug, before.slug);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.status, DealStatus::Active);
        assert_eq!(after.updated_at, later);
    }

    #[tokio::test]
    async fn malformed_candidate_is_isolated() {
        let (store, reconciler, connector) = setup().await;
        let batch = vec![
            candidate("A", "/a", 1000),
            DealCandidate::new("", "https://cu.test/x").into(),
            candidate("B", "/b", 1000),
            DealCandidate::new("Relative", "/c").into(),
        ];

        let result = reconciler
            .reconcile(&connector, &batch, ReconcileOptions::default(), now())
            .await
            .unwrap();

        assert_eq!(result.new_count, 2);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].index, Some(1));
        assert_eq!(result.errors[1].title.as_deref(), Some("Relative"));
        assert_eq!(store.all_deals().await.len(), 2);
    }

    #[tokio::test]
    async fn repeated_candidate_in_one_batch_matches_earlier_row() {
        let (store, reconciler, connector) = setup().await;
        let batch = vec![
            candidate("A", "/a", 1000),
            candidate("A", "/a/", 1000),
            candidate("A", "/a?utm_source=feed", 800),
        ];

        let result = reconciler
            .reconcile(&connector, &batch, ReconcileOptions::default(), now())
            .await
            .unwrap();

        assert_eq!(result.new_count, 1);
        assert_eq!(result.skipped_count, 1);
        assert_eq!(result.updated_count, 1);
        assert!(result.errors.is_empty());
        let deals = store.all_deals().await;
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].price, Some(Decimal::new(800, 0)));
    }

    #[tokio::test]
    async fn expire_old_deals_only_touches_this_connector() {
        let (store, reconciler, connector) = setup().await;
        let approve = ReconcileOptions {
            auto_approve: true,
            ..Default::default()
        };
        reconciler
            .reconcile(
                &connector,
                &[candidate("A", "/a", 1), candidate("B", "/b", 1)],
                approve,
                now(),
            )
            .await
            .unwrap();

        let manual = Deal::from_candidate(
            connector.merchant_id,
            None,
            "manual-key",
            &offer("Manual", "/m", 1),
            DealStatus::Active,
            now(),
        );
        store.put_deal(manual.clone()).await;

        let expire = ReconcileOptions {
            auto_approve: true,
            expire_old_deals: true,
        };
        let result = reconciler
            .reconcile(&connector, &[candidate("A", "/a", 1)], expire, now())
            .await
            .unwrap();
        assert_eq!(result.expired_count, 1);

        let deals = store.all_deals().await;
        let b = deals.iter().find(|d| d.title == "B").unwrap();
        assert_eq!(b.status, DealStatus::Expired);
        assert_eq!(b.expired_at, Some(now()));
        let m = store.get_deal(manual.id).await.unwrap().unwrap();
        assert_eq!(m.status, DealStatus::Active);

        let empty = reconciler
            .reconcile(&connector, &[], expire, now())
            .await
            .unwrap();
        assert_eq!(empty.expired_count, 0);
        let a = store
            .all_deals()
            .await
            .into_iter()
            .find(|d| d.title == "A")
            .unwrap();
        assert_eq!(a.status, DealStatus::Active);
    }

    #[tokio::test]
    async fn wire_level_decode_failure_is_collected_at_its_index() {
        let (store, reconciler, connector) = setup().await;
        let batch: Vec<ExtractedCandidate> = serde_json::from_str(
            r#"[
                {"title":"A","landingUrl":"https://cu.test/a","price":"1000"},
                {"title":"B","landingUrl":"https://cu.test/b","price":"free"},
                {"title":"C","landingUrl":"https://cu.test/c"}
            ]"#,
        )
        .unwrap();

        let result = reconciler
            .reconcile(&connector, &batch, ReconcileOptions::default(), now())
            .await
            .unwrap();

        assert_eq!(result.new_count, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].index, Some(1));
        assert_eq!(result.errors[0].title.as_deref(), Some("B"));
        assert!(result.errors[0].message.starts_with("malformed candidate"));
        assert_eq!(store.all_deals().await.len(), 2);
    }

    #[tokio::test]
    async fn relisted_offer_revives_expired_deal() {
        let (store, reconciler, connector) = setup().await;
        let approve = ReconcileOptions {
            auto_approve: true,
            ..Default::default()
        };
        let mut promo = offer("Weekend 1+1", "/w", 1500);
        promo.ends_at = Some(now() + chrono::Duration::hours(1));
        reconciler
            .reconcile(&connector, &[promo.clone().into()], approve, now())
            .await
            .unwrap();
        let later = now() + chrono::Duration::hours(2);
        store.expire_overdue_deals(later).await.unwrap();
        let expired = store.all_deals().await.remove(0);
        assert_eq!(expired.status, DealStatus::Expired);

        // Same title and url, now running for another month.
        promo.ends_at = Some(later + chrono::Duration::days(30));
        let result = reconciler
            .reconcile(&connector, &[promo.clone().into()], ReconcileOptions::default(), later)
            .await
            .unwrap();
        assert_eq!((result.new_count, result.updated_count), (0, 1));

        let revived = store.get_deal(expired.id).await.unwrap().unwrap();
        assert_eq!(revived.status, DealStatus::Pending);
        assert_eq!(revived.expired_at, None);
        assert_eq!(revived.ends_at, promo.ends_at);
        assert_eq!(revived.slug, expired.slug);

        // A stale re-extraction of an expired deal stays expired.
        store.expire_deals(&[expired.id], later).await.unwrap();
        let mut stale = promo.clone();
        stale.ends_at = Some(later - chrono::Duration::minutes(5));
        let result = reconciler
            .reconcile(&connector, &[stale.into()], approve, later)
            .await
            .unwrap();
        assert_eq!(result.updated_count, 1);
        let still = store.get_deal(expired.id).await.unwrap().unwrap();
        assert_eq!(still.status, DealStatus::Expired);
    }
}
