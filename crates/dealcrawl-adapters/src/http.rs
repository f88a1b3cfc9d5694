use std::time::Duration;

use async_trait::async_trait;
use dealcrawl_core::Connector;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::{AdapterError, Extraction, ExtractionAdapter, ExtractionResponse};

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpExtractionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl HttpExtractionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

/// Calls an external extraction service with the connector definition.
#[derive(Debug)]
pub struct HttpExtractionAdapter {
    client: reqwest::Client,
    config: HttpExtractionConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionRequest<'a> {
    connector_id: Uuid,
    merchant_id: Uuid,
    name: &'a str,
    source_url: &'a str,
    extraction_config: &'a serde_json::Value,
}

impl HttpExtractionAdapter {
    pub fn new(config: HttpExtractionConfig) -> Result<Self, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    fn classify(&self, err: reqwest::Error) -> AdapterError {
        if err.is_timeout() {
            AdapterError::Timeout(self.config.timeout)
        } else {
            AdapterError::Request(err)
        }
    }
}

#[async_trait]
impl ExtractionAdapter for HttpExtractionAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn extract(&self, connector: &Connector) -> Result<Extraction, AdapterError> {
        let body = ExtractionRequest {
            connector_id: connector.id,
            merchant_id: connector.merchant_id,
            name: &connector.name,
            source_url: &connector.source_url,
            extraction_config: &connector.extraction_config,
        };

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            let mut body = String::from_utf8_lossy(&bytes).into_owned();
            if body.len() > ERROR_BODY_LIMIT {
                let cut = (0..=ERROR_BODY_LIMIT)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ExtractionResponse =
            serde_json::from_slice(&bytes).map_err(|e| AdapterError::Decode(e.to_string()))?;
        let extraction = parsed.into_result()?;
        debug!(
            connector = %connector.name,
            candidates = extraction.candidates.len(),
            tokens = extraction.tokens_used,
            "extraction service responded"
        );
        Ok(extraction)
    }
}
