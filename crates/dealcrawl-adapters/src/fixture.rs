use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dealcrawl_core::Connector;
use tracing::debug;

use crate::{AdapterError, Extraction, ExtractionAdapter, ExtractionResponse};

/// Reads canned extraction responses from disk.
///
/// Looks up `<dir>/<connector id>.json` first, then `<dir>/<connector name>.json`.
/// Files use the same wire format as the extraction service.
#[derive(Debug, Clone)]
pub struct FixtureExtractionAdapter {
    dir: PathBuf,
}

impl FixtureExtractionAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn locate(&self, connector: &Connector) -> Option<PathBuf> {
        let candidates = [
            self.dir.join(format!("{}.json", connector.id)),
            self.dir.join(format!("{}.json", connector.name)),
        ];
        for path in candidates {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }
}

#[async_trait]
impl ExtractionAdapter for FixtureExtractionAdapter {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn extract(&self, connector: &Connector) -> Result<Extraction, AdapterError> {
        let path = self
            .locate(connector)
            .await
            .ok_or_else(|| AdapterError::Fixture {
                path: self.dir.display().to_string(),
                message: format!("no fixture for connector {}", connector.name),
            })?;

        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| AdapterError::Fixture {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        let parsed: ExtractionResponse =
            serde_json::from_slice(&raw).map_err(|e| AdapterError::Fixture {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        debug!(path = %path.display(), "loaded extraction fixture");
        parsed.into_result()
    }
}
