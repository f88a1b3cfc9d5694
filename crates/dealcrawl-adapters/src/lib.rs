//! Extraction adapter contract + implementations.
//!
//! The extraction capability (browser automation, model prompting) lives
//! outside this repository. Adapters hand a [`Connector`] to it and return
//! the candidates it found, or a failure. There is no retry in here: a failed
//! connector is retried by the next scheduled sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dealcrawl_core::{Connector, DealCandidate, ExtractedCandidate};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

mod fixture;
mod http;

pub use fixture::FixtureExtractionAdapter;
pub use http::{HttpExtractionAdapter, HttpExtractionConfig};

pub const CRATE_NAME: &str = "dealcrawl-adapters";

/// Successful extraction for one connector. Candidates keep their wire order
/// so reconcile errors can point back at the element.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub candidates: Vec<ExtractedCandidate>,
    pub tokens_used: i64,
}

/// Wire form returned by the extraction service and stored in fixtures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExtractionResponse {
    Success {
        #[serde(default)]
        candidates: Vec<ExtractedCandidate>,
        #[serde(rename = "tokensUsed", default)]
        tokens_used: i64,
    },
    Failed {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl ExtractionResponse {
    pub fn into_result(self) -> Result<Extraction, AdapterError> {
        match self {
            ExtractionResponse::Success {
                candidates,
                tokens_used,
            } => Ok(Extraction {
                candidates,
                tokens_used: tokens_used.max(0),
            }),
            ExtractionResponse::Failed { error_message } => {
                Err(AdapterError::Extraction(error_message))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Extraction(String),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction service returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid extraction response: {0}")]
    Decode(String),
    #[error("extraction request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fixture {path}: {message}")]
    Fixture { path: String, message: String },
}

#[async_trait]
pub trait ExtractionAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, connector: &Connector) -> Result<Extraction, AdapterError>;

    /// Tears down any shared crawling resource. Called once after every batch.
    async fn shutdown(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Adapter answering from per-connector queues of canned results.
///
/// Test double for the orchestrator and the HTTP surface. An exhausted queue
/// yields a failure.
#[derive(Debug, Default)]
pub struct ScriptedExtractionAdapter {
    scripts: Mutex<HashMap<Uuid, VecDeque<Result<Extraction, String>>>>,
    calls: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScriptedExtractionAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success(&self, connector_id: Uuid, candidates: Vec<DealCandidate>, tokens_used: i64) {
        self.push(
            connector_id,
            Ok(Extraction {
                candidates: candidates.into_iter().map(ExtractedCandidate::from).collect(),
                tokens_used,
            }),
        );
    }

    pub fn push_failure(&self, connector_id: Uuid, message: impl Into<String>) {
        self.push(connector_id, Err(message.into()));
    }

    fn push(&self, connector_id: Uuid, result: Result<Extraction, String>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(connector_id).or_default().push_back(result);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionAdapter for ScriptedExtractionAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn extract(&self, connector: &Connector) -> Result<Extraction, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.get_mut(&connector.id).and_then(VecDeque::pop_front));
        match next {
            Some(Ok(extraction)) => Ok(extraction),
            Some(Err(message)) => Err(AdapterError::Extraction(message)),
            None => Err(AdapterError::Extraction(format!(
                "no scripted extraction for connector {}",
                connector.name
            ))),
        }
    }

    async fn shutdown(&self) -> Result<(), AdapterError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
