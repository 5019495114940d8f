//! HTTP Store
//!
//! Remote tier talking to a [`CacheService`](crate::service::CacheService)
//! (or anything speaking the same routes). Packages crossing the network are
//! never trusted: every fetched payload is verified against its raw hash.
//!
//! Transient failures (connect errors, timeouts, 5xx, 429) are retried with
//! exponential backoff up to `max_attempts`; everything else fails the element
//! immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::metrics::{LatencyTracker, MetricsSnapshot, StoreMetrics};
use super::{chunk_of, finish_record, finish_value, validate_put, validate_value, CacheStore};
use crate::cache::package::{decode_record, decode_value, encode_record, encode_value};
use crate::cache::{
    CacheKey, CachePolicy, CacheRecord, CacheRecordPolicy, CompressedBuffer, ContentHash, Value,
    ValueId,
};
use crate::error::{Error, Result};
use crate::request::ChunkData;

/// Content type of record and value packages
pub const PACKAGE_CONTENT_TYPE: &str = "application/x-ddc-package";

/// Response header carrying the raw hash of a chunked value
pub const RAW_HASH_HEADER: &str = "x-ddc-raw-hash";

/// Response header carrying the raw size of a chunked value
pub const RAW_SIZE_HEADER: &str = "x-ddc-raw-size";

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// HTTP store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStoreConfig {
    /// Name used in logs and metrics
    pub name: String,
    /// Service base URL, e.g. `http://cache.internal:8558`
    pub base_url: String,
    /// Namespace on the service
    pub namespace: String,
    /// Whole-request deadline in milliseconds
    pub request_timeout_ms: u64,
    /// Connect deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// Attempts per request, including the first
    pub max_attempts: u32,
    /// Backoff before the first retry in milliseconds (doubles per retry)
    pub retry_backoff_ms: u64,
    /// Requests in flight at once across all batches
    pub max_concurrent_requests: usize,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            base_url: "http://127.0.0.1:8558".to_string(),
            namespace: "ddc".to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            max_attempts: 3,
            retry_backoff_ms: 100,
            max_concurrent_requests: 32,
        }
    }
}

/// Cache store backed by a remote cache service
#[derive(Debug)]
pub struct HttpCacheStore {
    config: HttpStoreConfig,
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    metrics: StoreMetrics,
}

impl HttpCacheStore {
    /// Create a new HTTP store
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        if config.namespace.is_empty() || config.namespace.contains('/') {
            return Err(Error::Config(format!(
                "invalid namespace '{}'",
                config.namespace
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            client,
            config,
            metrics: StoreMetrics::new(),
        })
    }

    fn refs_url(&self, key: &CacheKey) -> String {
        format!(
            "{}/api/v1/refs/{}/{}/{}",
            self.base_url, self.config.namespace, key.bucket, key.hash
        )
    }

    fn values_url(&self, key: &CacheKey) -> String {
        format!(
            "{}/api/v1/values/{}/{}/{}",
            self.base_url, self.config.namespace, key.bucket, key.hash
        )
    }

    fn chunk_url(&self, key: &CacheKey, id: ValueId) -> String {
        format!("{}/{}", self.refs_url(key), id)
    }

    fn exists_url(&self) -> String {
        format!("{}/api/v1/exists/{}", self.base_url, self.config.namespace)
    }

    /// Send with retries. `Ok(None)` means the service answered 404.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<(Bytes, &'static str)>,
    ) -> Result<Option<reqwest::Response>> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| Error::Internal("request limiter closed".into()))?;

        let mut attempt = 1;
        loop {
            match self.send_once(method.clone(), url, body.clone()).await {
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let backoff = Duration::from_millis(
                        self.config
                            .retry_backoff_ms
                            .saturating_mul(1 << (attempt - 1).min(16)),
                    )
                    .min(MAX_BACKOFF);
                    warn!(
                        store = %self.config.name,
                        %url,
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying cache request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<(Bytes, &'static str)>,
    ) -> Result<Option<reqwest::Response>> {
        let mut request = self.client.request(method, url);
        if let Some((body, content_type)) = body {
            request = request.header(CONTENT_TYPE, content_type).body(body);
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(Some(response)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    async fn fetch(&self, url: &str, key: &CacheKey) -> Result<Bytes> {
        match self.send(Method::GET, url, None).await? {
            Some(response) => Ok(response.bytes().await?),
            None => {
                self.metrics.record_miss();
                Err(Error::NotFound(key.clone()))
            }
        }
    }

    async fn upload(&self, url: &str, package: Bytes) -> Result<()> {
        let size = package.len() as u64;
        let tracker = LatencyTracker::start();
        let result = self
            .send(Method::PUT, url, Some((package, PACKAGE_CONTENT_TYPE)))
            .await;
        match result {
            Ok(Some(_)) => {
                self.metrics.record_write(size);
                self.metrics.record_write_latency(tracker.elapsed());
                Ok(())
            }
            Ok(None) => {
                self.metrics.record_write_failure();
                Err(Error::UnexpectedStatus {
                    status: StatusCode::NOT_FOUND.as_u16(),
                    url: url.to_string(),
                })
            }
            Err(e) => {
                self.metrics.record_write_failure();
                Err(e)
            }
        }
    }
}

/// Query string for a record fetch.
///
/// Payloads are only skipped remotely when no value wants them; the local
/// policy pass strips the rest.
pub(crate) fn record_query(policy: &CacheRecordPolicy) -> String {
    let skip_data = policy.record_policy().contains(CachePolicy::SKIP_DATA)
        && policy
            .overrides()
            .all(|(_, p)| p.contains(CachePolicy::SKIP_DATA));
    let mut flags = policy.record_policy() & (CachePolicy::SKIP_META | CachePolicy::PARTIAL_RECORD);
    if skip_data {
        flags |= CachePolicy::SKIP_DATA;
    }
    value_query(flags)
}

/// Query string for a value or chunk fetch
pub(crate) fn value_query(policy: CachePolicy) -> String {
    let mut skip = Vec::new();
    if policy.contains(CachePolicy::SKIP_META) {
        skip.push("meta");
    }
    if policy.contains(CachePolicy::SKIP_DATA) {
        skip.push("data");
    }

    let mut params = Vec::new();
    if !skip.is_empty() {
        params.push(format!("skip={}", skip.join(",")));
    }
    if policy.contains(CachePolicy::PARTIAL_RECORD) {
        params.push("partial=1".to_string());
    }
    if params.is_empty() {
        String::new()
    } else {
        format!("?{}", params.join("&"))
    }
}

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl CacheStore for HttpCacheStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, record, _policy), fields(store = %self.config.name, key = %record.key()))]
    async fn put_record(&self, record: &CacheRecord, _policy: &CacheRecordPolicy) -> Result<()> {
        validate_put(record)?;
        let package = encode_record(record)?;
        self.upload(&self.refs_url(record.key()), package).await
    }

    #[instrument(skip(self, policy), fields(store = %self.config.name, key = %key))]
    async fn get_record(&self, key: &CacheKey, policy: &CacheRecordPolicy) -> Result<CacheRecord> {
        let tracker = LatencyTracker::start();
        let url = format!("{}{}", self.refs_url(key), record_query(policy));
        let package = self.fetch(&url, key).await?;
        let size = package.len() as u64;

        let record = decode_record(package)?;
        if record.key() != key {
            return Err(Error::MalformedPackage(format!(
                "requested {key}, service returned {}",
                record.key()
            )));
        }
        let record = finish_record(record, policy, &self.metrics)?;
        self.metrics.record_hit(size);
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(record)
    }

    #[instrument(skip(self, value, _policy), fields(store = %self.config.name, key = %key))]
    async fn put_value(&self, key: &CacheKey, value: &Value, _policy: CachePolicy) -> Result<()> {
        validate_value(value)?;
        let package = encode_value(key, value)?;
        self.upload(&self.values_url(key), package).await
    }

    #[instrument(skip(self, policy), fields(store = %self.config.name, key = %key))]
    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Result<Value> {
        let tracker = LatencyTracker::start();
        let url = format!("{}{}", self.values_url(key), value_query(policy));
        let package = self.fetch(&url, key).await?;
        let size = package.len() as u64;

        let (stored_key, value) = decode_value(package)?;
        if &stored_key != key {
            return Err(Error::MalformedPackage(format!(
                "requested {key}, service returned {stored_key}"
            )));
        }
        let value = finish_value(value, policy, &self.metrics)?;
        self.metrics.record_hit(size);
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(value)
    }

    #[instrument(skip(self, policy), fields(store = %self.config.name, key = %key, %id))]
    async fn get_chunk(
        &self,
        key: &CacheKey,
        id: ValueId,
        offset: u64,
        size: u64,
        policy: CachePolicy,
    ) -> Result<ChunkData> {
        let tracker = LatencyTracker::start();
        let skip_data = policy.contains(CachePolicy::SKIP_DATA);
        // A partial range cannot be checked against the raw hash, so the
        // whole value is fetched and sliced here.
        let mut url = self.chunk_url(key, id);
        if skip_data {
            url.push_str("?skip=data");
        }

        let Some(response) = self.send(Method::GET, &url, None).await? else {
            self.metrics.record_miss();
            return Err(Error::NotFound(key.clone()));
        };

        let raw_hash = header(&response, RAW_HASH_HEADER)
            .ok_or_else(|| Error::MalformedPackage(format!("missing {RAW_HASH_HEADER}")))?
            .parse::<ContentHash>()?;
        let raw_size = header(&response, RAW_SIZE_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::MalformedPackage(format!("missing {RAW_SIZE_HEADER}")))?;
        let body = response.bytes().await?;

        let value = if skip_data {
            Value::from_parts(raw_hash, raw_size, None)
        } else {
            let value = Value::from_parts(raw_hash, raw_size, Some(CompressedBuffer::uncompressed(body.clone())));
            finish_value(value, policy, &self.metrics)?
        };
        let chunk = chunk_of(&value, offset, size, policy)?;

        self.metrics.record_hit(body.len() as u64);
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(chunk)
    }

    async fn probably_exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self
            .exists_remote(std::slice::from_ref(key))
            .await?
            .first()
            .copied()
            .unwrap_or(false))
    }

    async fn probably_exists_batch(&self, keys: &[CacheKey]) -> Vec<bool> {
        match self.exists_remote(keys).await {
            Ok(found) => found,
            Err(e) => {
                warn!(store = %self.config.name, count = keys.len(), error = %e, "Existence check failed");
                vec![false; keys.len()]
            }
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl HttpCacheStore {
    async fn exists_remote(&self, keys: &[CacheKey]) -> Result<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let body: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let body = Bytes::from(serde_json::to_vec(&body)?);
        let url = self.exists_url();

        let response = self
            .send(Method::POST, &url, Some((body, "application/json")))
            .await?
            .ok_or_else(|| Error::UnexpectedStatus {
                status: StatusCode::NOT_FOUND.as_u16(),
                url: url.clone(),
            })?;
        let found: Vec<bool> = serde_json::from_slice(&response.bytes().await?)?;
        if found.len() != keys.len() {
            return Err(Error::MalformedPackage(format!(
                "asked about {} keys, service answered {}",
                keys.len(),
                found.len()
            )));
        }
        debug!(store = %self.config.name, count = keys.len(), "Existence check");
        Ok(found)
    }
}

// =============================================================================
// Tests
// =============================================================================
