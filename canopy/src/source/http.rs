//! HTTP client for the metadata document store gateway

use crate::config::SourceConfig;
use crate::error::{CacheError, Result};
use crate::source::{MetadataSource, RecordQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of probing the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub reachable: bool,
    pub response_time_ms: u64,
    /// Documents in the collection, when reachable
    pub document_count: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Metadata source reached over the REST gateway
pub struct HttpMetadataSource {
    client: Client,
    base_url: String,
    config: SourceConfig,
}

impl HttpMetadataSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CacheError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = format!(
            "https://{}/{}/{}/{}",
            config.host, config.version, config.database, config.collection
        );
        info!(base_url = %base_url, "Configured metadata source");

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Delay before retry `attempt` (1-based): exponential with ±25% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * base * 0.25;
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    /// Send a request, retrying connection failures, timeouts and 5xx/429
    async fn send_json<F>(&self, endpoint: &str, build: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let outcome = match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<Value>().await?);
                    }
                    let body = response.text().await.unwrap_or_default();
                    let err = CacheError::SourceError(format!(
                        "{} returned {}: {}",
                        endpoint, status, body
                    ));
                    if !is_transient(status) {
                        return Err(err);
                    }
                    err
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => e.into(),
                Err(e) => return Err(e.into()),
            };

            if attempt >= self.config.max_retries {
                return Err(outcome);
            }
            attempt += 1;
            let delay = self.backoff(attempt);
            warn!(
                endpoint,
                error = %outcome,
                "Request failed (attempt {}/{}), retrying after {:?}",
                attempt,
                self.config.max_retries + 1,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn find_page(&self, query: &RecordQuery, skip: u64, limit: u64) -> Result<Vec<Value>> {
        let url = format!("{}/find", self.base_url);
        let params = [
            ("filter", query.filter.to_string()),
            ("projection", query.projection.to_string()),
            ("limit", limit.to_string()),
            ("skip", skip.to_string()),
        ];
        let body = self
            .send_json("find", || self.client.get(&url).query(&params))
            .await?;
        documents(body)
    }

    /// Count documents in the collection to check reachability
    pub async fn count_documents(&self) -> Result<u64> {
        let url = format!("{}/count_documents", self.base_url);
        let params = [("filter", "{}".to_string())];
        let body = self
            .send_json("count_documents", || self.client.get(&url).query(&params))
            .await?;

        body.as_u64()
            .or_else(|| body.get("count").and_then(Value::as_u64))
            .ok_or_else(|| CacheError::SourceError(format!("unexpected count response: {}", body)))
    }

    /// Probe the gateway, retrying up to the configured limit
    pub async fn health_check(&self) -> SourceHealth {
        let start = Instant::now();
        // send_json already retries; a failure here means every attempt failed
        let (count, error) = match self.count_documents().await {
            Ok(count) => (Some(count), None),
            Err(e) => (None, Some(e.to_string())),
        };

        SourceHealth {
            reachable: count.is_some(),
            response_time_ms: start.elapsed().as_millis() as u64,
            document_count: count,
            timestamp: Utc::now(),
            retry_count: if error.is_some() { self.config.max_retries } else { 0 },
            error,
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Accept either a bare array or `{"data": [...]}`
fn documents(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(docs) => Ok(docs),
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(docs)) => Ok(docs),
            _ => Err(CacheError::SourceError(
                "response has no document array".to_string(),
            )),
        },
        other => Err(CacheError::SourceError(format!(
            "unexpected response shape: {}",
            other
        ))),
    }
}

/// Documents to ask for next; `limit` 0 means unlimited
fn page_request(limit: u64, page_size: u64, fetched: usize) -> u64 {
    if limit == 0 {
        page_size
    } else {
        page_size.min(limit.saturating_sub(fetched as u64))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn retrieve(&self, query: &RecordQuery) -> Result<Vec<Value>> {
        let page_size = self.config.page_size as u64;
        let mut records = Vec::new();
        let mut skip = 0;

        loop {
            let want = page_request(query.limit, page_size, records.len());
            if want == 0 {
                break;
            }

            let page = self.find_page(query, skip, want).await?;
            let fetched = page.len() as u64;
            records.extend(page);
            debug!(skip, fetched, total = records.len(), "Fetched page");

            if fetched < want {
                break;
            }
            skip += fetched;
        }

        if query.limit > 0 {
            records.truncate(query.limit as usize);
        }
        Ok(records)
    }

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Value>> {
        let url = format!("{}/aggregate", self.base_url);
        let body = self
            .send_json("aggregate", || self.client.post(&url).json(pipeline))
            .await?;
        documents(body)
    }
}
