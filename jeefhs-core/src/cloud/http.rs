//! HTTP client for the cloud ingest API
//!
//! Batches are sent as `POST {endpoint}/devices/{device_id}/events`. The server
//! upserts each record on `(device_id, seq)` and answers with how many rows
//! were new and how many were already present.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::types::{EventRecord, Payload, SequenceNumber};

use super::{BatchReceipt, CloudStore};

/// Response from POST /devices/{device_id}/events
#[derive(Debug, Deserialize)]
struct WriteBatchResponse {
    /// Records newly inserted
    #[serde(default)]
    inserted: usize,
    /// Records already present for the same key
    #[serde(default)]
    duplicates: usize,
}

/// Request body for POST /devices/{device_id}/events
#[derive(Serialize)]
struct WriteBatchRequest<'a> {
    batch_id: String,
    records: Vec<WireRecord<'a>>,
}

#[derive(Serialize)]
struct WireRecord<'a> {
    device_id: &'a str,
    seq: SequenceNumber,
    category: &'static str,
    captured_at: DateTime<Utc>,
    payload: &'a Payload,
    checksum: &'a str,
}

/// Cloud store reached over HTTP
pub struct HttpCloudStore {
    http_client: reqwest::Client,
    events_url: String,
    device_id: String,
}

impl HttpCloudStore {
    /// Create a new client from configuration
    ///
    /// `timeout` bounds each request; the daemon applies its own write timeout
    /// on top of it.
    pub fn new(config: &CloudConfig, device_id: &str, timeout: Duration) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config("cloud.endpoint is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        headers.insert(
            "X-Device-ID",
            HeaderValue::from_str(device_id)
                .map_err(|e| Error::Config(format!("invalid device id: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            events_url: format!(
                "{}/devices/{}/events",
                base_url,
                urlencoding::encode(device_id)
            ),
            device_id: device_id.to_string(),
        })
    }

    /// The URL batches are posted to
    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    fn build_request<'a>(&'a self, records: &'a [EventRecord]) -> WriteBatchRequest<'a> {
        WriteBatchRequest {
            batch_id: uuid::Uuid::new_v4().to_string(),
            records: records
                .iter()
                .map(|r| WireRecord {
                    device_id: &self.device_id,
                    seq: r.seq,
                    category: r.category.as_str(),
                    captured_at: r.captured_at,
                    payload: &r.payload,
                    checksum: &r.checksum,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl CloudStore for HttpCloudStore {
    async fn write_batch(&self, records: &[EventRecord]) -> Result<BatchReceipt> {
        let request_body = self.build_request(records);

        let response = self
            .http_client
            .post(&self.events_url)
            .header("X-Request-ID", &request_body.batch_id)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(classify_status(status, &error_text));
        }

        // Any 2xx means the batch is committed; the receipt is informational
        let body = response.text().await.unwrap_or_default();
        let receipt = parse_receipt(&body, records.len());
        tracing::debug!(
            batch_id = %request_body.batch_id,
            %status,
            inserted = receipt.inserted,
            duplicates = receipt.duplicates,
            "Cloud accepted batch"
        );
        Ok(receipt)
    }
}

/// Read the receipt from a 2xx body.
///
/// An empty or unreadable body still acknowledges the whole batch, so every
/// record counts as inserted.
fn parse_receipt(body: &str, batch_len: usize) -> BatchReceipt {
    match serde_json::from_str::<WriteBatchResponse>(body) {
        Ok(response) => BatchReceipt {
            inserted: response.inserted,
            duplicates: response.duplicates,
        },
        Err(e) => {
            if !body.trim().is_empty() {
                tracing::debug!(error = %e, "Unreadable batch receipt, assuming all inserted");
            }
            BatchReceipt {
                inserted: batch_len,
                duplicates: 0,
            }
        }
    }
}

/// Map a non-success status onto the fault taxonomy
fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = format!("API error ({}): {}", status, body);
    if is_transient_status(status) {
        Error::Connectivity(message)
    } else {
        Error::Replication(message)
    }
}

/// Server-side or throttling statuses that say nothing about the batch itself
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}
