use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dealcrawl_core::HIDE_AFTER_DAYS;
use dealcrawl_storage::DealStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSummary {
    pub expired: u64,
    pub hidden: u64,
    pub merchants_recounted: u64,
}

/// Expire, hide, then recount merchant aggregates. Independent of crawling.
///
/// Deals also leave or enter `active` outside this sweep (auto-approved
/// inserts, relists, `expireOldDeals`). Scheduled sweeps therefore recount
/// every merchant unless that is switched off, which bounds the staleness of
/// `active_deal_count` by the lifecycle schedule.
pub struct LifecycleSweeper {
    store: Arc<dyn DealStore>,
    recount_all_on_schedule: bool,
}

impl LifecycleSweeper {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self {
            store,
            recount_all_on_schedule: true,
        }
    }

    pub fn with_scheduled_recount_all(mut self, recount_all: bool) -> Self {
        self.recount_all_on_schedule = recount_all;
        self
    }

    /// Entry point for the cron job and the cron endpoint.
    pub async fn run_scheduled(&self, now: DateTime<Utc>) -> Result<LifecycleSummary, SyncError> {
        self.run(now, self.recount_all_on_schedule).await
    }

    /// Recounts merchants touched by the expire phase, or all merchants when
    /// `recount_all` is set.
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        recount_all: bool,
    ) -> Result<LifecycleSummary, SyncError> {
        let expired = self.store.expire_overdue_deals(now).await?;
        let hidden = self
            .store
            .hide_expired_deals(now - Duration::days(HIDE_AFTER_DAYS))
            .await?;

        let merchants: BTreeSet<_> = if recount_all {
            self.store
                .list_merchants()
                .await?
                .into_iter()
                .map(|m| m.id)
                .collect()
        } else {
            expired.merchant_ids
        };

        let mut recounted = 0;
        for merchant_id in merchants {
            match self.store.recount_active_deals(merchant_id, now).await {
                Ok(count) => {
                    recounted += 1;
                    info!(merchant_id = %merchant_id, active_deals = count, "merchant aggregate refreshed");
                }
                // A stale aggregate is repaired by the next sweep.
                Err(err) => warn!(merchant_id = %merchant_id, error = %err, "recount failed"),
            }
        }

        let summary = LifecycleSummary {
            expired: expired.count,
            hidden,
            merchants_recounted: recounted,
        };
        info!(
            expired = summary.expired,
            hidden = summary.hidden,
            merchants = summary.merchants_recounted,
            "lifecycle sweep finished"
        );
        Ok(summary)
    }
}
