//! Remote point configuration source.
//!
//! The gauge configuration service returns the organization's full point
//! list on every fetch; the scheduler diffs it against the points already
//! being polled.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::config::{PointConfig, RawPointRecord, SourceConfig, normalize_records};

/// Error type for configuration fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Malformed response body: {0}")]
    Body(String),
}

/// Capability to fetch the current list of pollable points.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<PointConfig>, FetchError>;
}

/// Response envelope served by the configuration service.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// Parse a response body, logging and skipping records that do not even
/// deserialize. One broken record never fails the batch.
fn parse_body(body: &[u8]) -> Result<Vec<RawPointRecord>, FetchError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| FetchError::Body(e.to_string()))?;

    let mut records = Vec::with_capacity(envelope.data.len());
    for raw in envelope.data {
        match serde_json::from_value::<RawPointRecord>(raw) {
            Ok(record) => records.push(record),
            Err(e) => warn!(error = %e, "Skipping malformed point record"),
        }
    }
    Ok(records)
}

/// Configuration source backed by the gauge HTTP API.
pub struct HttpConfigSource {
    client: reqwest::Client,
    url: String,
}

impl HttpConfigSource {
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> Result<Vec<PointConfig>, FetchError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let records = parse_body(&body)?;
        Ok(normalize_records(&records))
    }
}
