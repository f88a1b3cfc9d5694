//! YAML connector registry used to seed merchants and connectors.
//!
//! ```yaml
//! merchants:
//!   - name: CU
//!     connectors:
//!       - name: cu-promo
//!         source_url: https://cu.example/promo
//!         extraction_config: { list_selector: ".prod_list" }
//! ```
//!
//! Ids are optional; missing ids are derived from names so re-seeding the
//! same file updates rows in place.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use dealcrawl_core::{Connector, ConnectorStatus, Merchant};
use dealcrawl_storage::DealStore;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub merchants: Vec<MerchantEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MerchantEntry {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorEntry {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub source_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub extraction_config: Option<serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedSummary {
    pub merchants: usize,
    pub connectors: usize,
}

impl MerchantEntry {
    pub fn merchant_id(&self) -> Uuid {
        self.id.unwrap_or_else(|| {
            Uuid::new_v5(
                &Uuid::NAMESPACE_OID,
                format!("dealcrawl:merchant:{}", self.name).as_bytes(),
            )
        })
    }
}

impl ConnectorEntry {
    pub fn connector_id(&self, merchant_id: Uuid) -> Uuid {
        self.id.unwrap_or_else(|| {
            Uuid::new_v5(
                &Uuid::NAMESPACE_OID,
                format!("dealcrawl:connector:{merchant_id}:{}", self.name).as_bytes(),
            )
        })
    }
}

impl Registry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: Registry = serde_yaml::from_str(text).context("parsing connector registry")?;
        for merchant in &registry.merchants {
            anyhow::ensure!(!merchant.name.trim().is_empty(), "merchant with empty name");
            for connector in &merchant.connectors {
                anyhow::ensure!(
                    url::Url::parse(&connector.source_url).is_ok(),
                    "connector {} has invalid source_url {}",
                    connector.name,
                    connector.source_url
                );
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }
}

/// Upserts every merchant and connector in the registry file.
pub async fn seed_registry(store: &dyn DealStore, path: &Path) -> Result<SeedSummary> {
    let registry = Registry::load(path).await?;
    let now = Utc::now();
    let mut summary = SeedSummary::default();

    for entry in &registry.merchants {
        let merchant = Merchant::new(entry.merchant_id(), entry.name.trim(), now);
        store
            .upsert_merchant(&merchant)
            .await
            .with_context(|| format!("upserting merchant {}", entry.name))?;
        summary.merchants += 1;

        for c in &entry.connectors {
            let mut connector = Connector::new(merchant.id, c.name.trim(), c.source_url.trim(), now);
            connector.id = c.connector_id(merchant.id);
            if let Some(config) = &c.extraction_config {
                connector.extraction_config = config.clone();
            }
            if !c.enabled {
                connector.status = ConnectorStatus::Disabled;
            }
            store
                .upsert_connector(&connector)
                .await
                .with_context(|| format!("upserting connector {}", c.name))?;
            summary.connectors += 1;
        }
    }

    info!(
        merchants = summary.merchants,
        connectors = summary.connectors,
        path = %path.display(),
        "connector registry seeded"
    );
    Ok(summary)
}
