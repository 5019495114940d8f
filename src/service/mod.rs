//! Cache Service
//!
//! Serves one [`CacheStore`] per namespace over HTTP/1. The routes are the ones
//! [`HttpCacheStore`](crate::store::HttpCacheStore) speaks, so a service can
//! itself be the upstream of another node. Serving a hierarchical store makes
//! this a caching proxy.
//!
//! # Routes
//!
//! ```text
//! PUT|GET|HEAD  /api/v1/refs/{ns}/{bucket}/{hash}
//! GET           /api/v1/refs/{ns}/{bucket}/{hash}/{value_id}?offset=&size=
//! PUT|GET|HEAD  /api/v1/values/{ns}/{bucket}/{hash}
//! POST          /api/v1/exists/{ns}
//! GET           /healthz
//! GET           /metrics
//! ```
//!
//! Fetch policy travels as `?skip=meta,data&partial=1`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::package::{decode_record, decode_value, encode_record, encode_value};
use crate::cache::{CacheBucket, CacheKey, CachePolicy, ContentHash, ValueId};
use crate::error::{Error, Result};
use crate::store::http::{PACKAGE_CONTENT_TYPE, RAW_HASH_HEADER, RAW_SIZE_HEADER};
use crate::store::CacheStore;

type HttpResponse = Response<Full<Bytes>>;

// =============================================================================
// Errors
// =============================================================================

/// Error answered to a client
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A store refused an upload: content problems are the client's fault
    fn rejected(e: Error) -> Self {
        match e {
            Error::MissingData(_)
            | Error::HashMismatch { .. }
            | Error::SizeMismatch { .. }
            | Error::DecompressionFailed { .. } => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            other => other.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(_) | Error::ValueNotFound { .. } => StatusCode::NOT_FOUND,
            Error::ChunkOutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::InvalidBucket { .. }
            | Error::InvalidKey(_)
            | Error::InvalidHash(_)
            | Error::DuplicateValueId(_)
            | Error::NullValueId
            | Error::MalformedPackage(_)
            | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Canceled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

type ApiResult = std::result::Result<HttpResponse, ApiError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Default request body limit (512 MiB)
pub const DEFAULT_MAX_BODY_BYTES: u64 = 512 * 1024 * 1024;

// =============================================================================
// Metrics
// =============================================================================

struct ServiceMetrics {
    registry: Registry,
    requests: IntCounterVec,
    store_counters: IntGaugeVec,
}

impl ServiceMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("ddc_requests_total", "Cache service requests by operation and status"),
            &["op", "status"],
        )
        .map_err(|e| Error::Internal(format!("metrics: {e}")))?;
        let store_counters = IntGaugeVec::new(
            Opts::new("ddc_store_counter", "Store counters by namespace"),
            &["namespace", "counter"],
        )
        .map_err(|e| Error::Internal(format!("metrics: {e}")))?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(|e| Error::Internal(format!("metrics: {e}")))?;
        registry
            .register(Box::new(store_counters.clone()))
            .map_err(|e| Error::Internal(format!("metrics: {e}")))?;

        Ok(Self {
            registry,
            requests,
            store_counters,
        })
    }

    fn observe(&self, op: &str, status: StatusCode) {
        self.requests
            .with_label_values(&[op, status.as_str()])
            .inc();
    }

    fn refresh(&self, namespaces: &HashMap<String, Arc<dyn CacheStore>>) {
        for (namespace, store) in namespaces {
            let snapshot = store.metrics();
            let counters = [
                ("hits", snapshot.hits),
                ("misses", snapshot.misses),
                ("bytes_read", snapshot.bytes_read),
                ("hash_mismatches", snapshot.hash_mismatches),
                ("writes", snapshot.writes),
                ("write_failures", snapshot.write_failures),
                ("bytes_written", snapshot.bytes_written),
                ("upstream_queued", snapshot.upstream_queued),
                ("upstream_completed", snapshot.upstream_completed),
                ("upstream_failed", snapshot.upstream_failed),
                ("write_backs", snapshot.write_backs),
                ("evictions", snapshot.evictions),
            ];
            for (counter, value) in counters {
                self.store_counters
                    .with_label_values(&[namespace.as_str(), counter])
                    .set(i64::try_from(value).unwrap_or(i64::MAX));
            }
        }
    }
}

// =============================================================================
// Query parsing
// =============================================================================

#[derive(Debug, Default, PartialEq)]
struct Query {
    policy: CachePolicy,
    offset: Option<u64>,
    size: Option<u64>,
}

fn parse_query(query: Option<&str>) -> std::result::Result<Query, ApiError> {
    let mut parsed = Query::default();
    let Some(query) = query else {
        return Ok(parsed);
    };

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, raw) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(raw)
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid {name} encoding")))?;
        let value = value.as_ref();
        match name {
            "skip" => parsed.policy |= CachePolicy::from_query(value),
            "partial" if value == "1" || value == "true" => {
                parsed.policy |= CachePolicy::PARTIAL_RECORD
            }
            "offset" => parsed.offset = Some(parse_number(name, value)?),
            "size" => parsed.size = Some(parse_number(name, value)?),
            _ => {}
        }
    }
    Ok(parsed)
}

fn parse_number(name: &str, value: &str) -> std::result::Result<u64, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid {name} '{value}'")))
}

fn parse_key(bucket: &str, hash: &str) -> std::result::Result<CacheKey, ApiError> {
    Ok(CacheKey::new(CacheBucket::new(bucket)?, ContentHash::from_hex(hash)?))
}

// =============================================================================
// Responses
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn respond_typed(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = respond(status, body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn package(body: Bytes) -> HttpResponse {
    respond_typed(StatusCode::OK, PACKAGE_CONTENT_TYPE, body)
}

fn exists(found: bool) -> HttpResponse {
    let status = if found {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    respond(status, Bytes::new())
}

// =============================================================================
// Service
// =============================================================================

/// HTTP front end for cache stores
pub struct CacheService {
    namespaces: HashMap<String, Arc<dyn CacheStore>>,
    max_body_bytes: u64,
    metrics: ServiceMetrics,
}

impl CacheService {
    /// Create a service with no namespaces
    pub fn new() -> Result<Self> {
        Ok(Self {
            namespaces: HashMap::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            metrics: ServiceMetrics::new()?,
        })
    }

    /// Serve `store` under `namespace`
    pub fn with_namespace(mut self, namespace: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        self.namespaces.insert(namespace.into(), store);
        self
    }

    /// Reject request bodies larger than `limit` with 413
    pub fn with_max_body_bytes(mut self, limit: u64) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Served namespaces
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, namespaces = self.namespaces.len(), "Cache service listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };

            let io = TokioIo::new(stream);
            let service = self.clone();
            tokio::spawn(async move {
                let handler = service_fn(move |req| {
                    let service = service.clone();
                    async move { Ok::<_, Infallible>(service.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                    debug!(%peer, error = %e, "Cache service connection error");
                }
            });
        }

        info!(%addr, "Cache service stopped");
        Ok(())
    }

    /// Bind `addr` and serve until `shutdown` fires
    pub async fn bind_and_serve(self: Arc<Self>, addr: &str, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address '{addr}': {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Answer one request
    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let (op, result) = self.route(req).await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if e.status.is_server_error() {
                    warn!(%method, %path, error = %e, "Cache request failed");
                } else {
                    debug!(%method, %path, error = %e, "Cache request rejected");
                }
                respond_typed(e.status, "text/plain", e.message)
            }
        };
        self.metrics.observe(op, response.status());
        response
    }

    async fn route<B>(&self, req: Request<B>) -> (&'static str, ApiResult)
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match (method.clone(), path.as_str()) {
            (Method::GET, "/healthz") => return ("health", Ok(respond(StatusCode::OK, "ok"))),
            (Method::GET, "/metrics") => return ("metrics", self.render_metrics()),
            _ => {}
        }

        let query = match parse_query(req.uri().query()) {
            Ok(query) => query,
            Err(e) => return ("unknown", Err(e)),
        };
        let segments: Vec<&str> = match path.strip_prefix("/api/v1/") {
            Some(rest) => rest.split('/').collect(),
            None => Vec::new(),
        };

        match (method, segments.as_slice()) {
            (Method::GET, ["refs", ns, bucket, hash]) => {
                ("get_record", self.get_record(ns, bucket, hash, &query).await)
            }
            (Method::HEAD, ["refs", ns, bucket, hash] | ["values", ns, bucket, hash]) => {
                ("head", self.head(ns, bucket, hash).await)
            }
            (Method::PUT, ["refs", ns, bucket, hash]) => {
                let (ns, bucket, hash) = (ns.to_string(), bucket.to_string(), hash.to_string());
                ("put_record", self.put_record(&ns, &bucket, &hash, req).await)
            }
            (Method::GET, ["refs", ns, bucket, hash, id]) => {
                ("get_chunk", self.get_chunk(ns, bucket, hash, id, &query).await)
            }
            (Method::GET, ["values", ns, bucket, hash]) => {
                ("get_value", self.get_value(ns, bucket, hash, &query).await)
            }
            (Method::PUT, ["values", ns, bucket, hash]) => {
                let (ns, bucket, hash) = (ns.to_string(), bucket.to_string(), hash.to_string());
                ("put_value", self.put_value(&ns, &bucket, &hash, req).await)
            }
            (Method::POST, ["exists", ns]) => {
                let ns = ns.to_string();
                ("exists", self.exists(&ns, req).await)
            }
            _ => (
                "unknown",
                Err(ApiError::new(StatusCode::NOT_FOUND, format!("no route for {path}"))),
            ),
        }
    }

    fn store(&self, namespace: &str) -> std::result::Result<&Arc<dyn CacheStore>, ApiError> {
        self.namespaces.get(namespace).ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("unknown namespace '{namespace}'"),
            )
        })
    }

    async fn get_record(&self, ns: &str, bucket: &str, hash: &str, query: &Query) -> ApiResult {
        let store = self.store(ns)?;
        let key = parse_key(bucket, hash)?;
        let record = store.get_record(&key, &query.policy.into()).await?;
        Ok(package(encode_record(&record)?))
    }

    async fn put_record<B>(&self, ns: &str, bucket: &str, hash: &str, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let store = self.store(ns)?;
        let key = parse_key(bucket, hash)?;
        let record = decode_record(self.read_body(req).await?)?;
        if record.key() != &key {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("package is for {}, not {key}", record.key()),
            ));
        }
        store
            .put_record(&record, &CachePolicy::DEFAULT.into())
            .await
            .map_err(ApiError::rejected)?;
        Ok(respond(StatusCode::NO_CONTENT, Bytes::new()))
    }

    async fn get_chunk(&self, ns: &str, bucket: &str, hash: &str, id: &str, query: &Query) -> ApiResult {
        let store = self.store(ns)?;
        let key = parse_key(bucket, hash)?;
        let id: ValueId = id.parse()?;
        let chunk = store
            .get_chunk(
                &key,
                id,
                query.offset.unwrap_or(0),
                query.size.unwrap_or(u64::MAX),
                query.policy,
            )
            .await?;

        let mut response = respond_typed(
            StatusCode::OK,
            "application/octet-stream",
            chunk.data.unwrap_or_default(),
        );
        let headers = response.headers_mut();
        headers.insert(RAW_HASH_HEADER, header_value(chunk.raw_hash.to_hex())?);
        headers.insert(RAW_SIZE_HEADER, header_value(chunk.raw_size.to_string())?);
        Ok(response)
    }

    async fn get_value(&self, ns: &str, bucket: &str, hash: &str, query: &Query) -> ApiResult {
        let store = self.store(ns)?;
        let key = parse_key(bucket, hash)?;
        let value = store.get_value(&key, query.policy).await?;
        Ok(package(encode_value(&key, &value)?))
    }

    async fn put_value<B>(&self, ns: &str, bucket: &str, hash: &str, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let store = self.store(ns)?;
        let key = parse_key(bucket, hash)?;
        let (stored_key, value) = decode_value(self.read_body(req).await?)?;
        if stored_key != key {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("package is for {stored_key}, not {key}"),
            ));
        }
        store
            .put_value(&key, &value, CachePolicy::DEFAULT)
            .await
            .map_err(ApiError::rejected)?;
        Ok(respond(StatusCode::NO_CONTENT, Bytes::new()))
    }

    async fn head(&self, ns: &str, bucket: &str, hash: &str) -> ApiResult {
        let store = self.store(ns)?;
        let key = parse_key(bucket, hash)?;
        Ok(exists(store.probably_exists(&key).await?))
    }

    async fn exists<B>(&self, ns: &str, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let store = self.store(ns)?;
        let keys: Vec<String> = serde_json::from_slice(&self.read_body(req).await?).map_err(Error::from)?;
        let keys = keys
            .iter()
            .map(|k| k.parse::<CacheKey>())
            .collect::<Result<Vec<_>>>()?;

        let found = store.probably_exists_batch(&keys).await;
        let body = serde_json::to_vec(&found).map_err(Error::from)?;
        Ok(respond_typed(StatusCode::OK, "application/json", body))
    }

    async fn read_body<B>(&self, req: Request<B>) -> std::result::Result<Bytes, ApiError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let limit = usize::try_from(self.max_body_bytes).unwrap_or(usize::MAX);
        match Limited::new(req.into_body(), limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", self.max_body_bytes),
            )),
            Err(e) => Err(ApiError::new(StatusCode::BAD_REQUEST, format!("reading body: {e}"))),
        }
    }

    fn render_metrics(&self) -> ApiResult {
        self.metrics.refresh(&self.namespaces);
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.metrics.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics: {e}")))?;

        let mut response = respond(StatusCode::OK, buffer);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, header_value(encoder.format_type().to_string())?);
        Ok(response)
    }
}


fn header_value(text: String) -> std::result::Result<HeaderValue, ApiError> {
    HeaderValue::try_from(text).map_err(|e| {
        error!(error = %e, "Invalid response header");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRecord, CacheRecordBuilder, RecordMeta, Value};
    use crate::store::MemoryCacheStore;

    fn service() -> (Arc<MemoryCacheStore>, CacheService) {
        let store = Arc::new(MemoryCacheStore::default());
        let service = CacheService::new().unwrap().with_namespace("ddc", store.clone());
        (store, service)
    }

    fn record() -> CacheRecord {
        CacheRecordBuilder::anonymous(CacheBucket::new("ServiceTests").unwrap())
            .add_bytes(Some(ValueId::from_name("Out")), (0u8..10).collect::<Vec<_>>())
            .set_meta(RecordMeta::new().with("Build", 7))
            .build()
            .unwrap()
    }

    fn request(method: Method, uri: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body.into()))
            .unwrap()
    }

    fn refs_path(key: &CacheKey) -> String {
        format!("/api/v1/refs/ddc/{}/{}", key.bucket, key.hash)
    }

    async fn body(response: HttpResponse) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn test_parse_query() {
        assert_eq!(parse_query(None).unwrap(), Query::default());

        let query = parse_query(Some("skip=meta%2Cdata&partial=1&offset=5&size=10")).unwrap();
        assert_eq!(
            query.policy,
            CachePolicy::SKIP_META | CachePolicy::SKIP_DATA | CachePolicy::PARTIAL_RECORD
        );
        assert_eq!(query.offset, Some(5));
        assert_eq!(query.size, Some(10));

        assert_eq!(
            parse_query(Some("offset=x")).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_put_then_get_record() {
        let (store, service) = service();
        let record = record();
        let path = refs_path(record.key());

        let put = service
            .handle(request(Method::PUT, &path, encode_record(&record).unwrap()))
            .await;
        assert_eq!(put.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.record_count(), 1);

        let get = service.handle(request(Method::GET, &path, Bytes::new())).await;
        assert_eq!(get.status(), StatusCode::OK);
        let fetched = decode_record(body(get).await).unwrap();
        assert_eq!(fetched, record);
        assert_eq!(fetched.meta(), record.meta());

        let skipped = service
            .handle(request(Method::GET, &format!("{path}?skip=meta,data"), Bytes::new()))
            .await;
        let skipped = decode_record(body(skipped).await).unwrap();
        assert!(skipped.meta().is_none());
        assert!(!skipped.values()[0].has_data());

        let head = service.handle(request(Method::HEAD, &path, Bytes::new())).await;
        assert_eq!(head.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_key() {
        let (_, service) = service();
        let record = record();
        let other = CacheKey::new(record.key().bucket.clone(), ContentHash::of(b"elsewhere"));

        let response = service
            .handle(request(
                Method::PUT,
                &refs_path(&other),
                encode_record(&record).unwrap(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_and_unknown() {
        let (_, service) = service();
        let key = CacheKey::new(CacheBucket::new("ServiceTests").unwrap(), ContentHash::of(b"none"));

        let get = service
            .handle(request(Method::GET, &refs_path(&key), Bytes::new()))
            .await;
        assert_eq!(get.status(), StatusCode::NOT_FOUND);

        let head = service
            .handle(request(Method::HEAD, &refs_path(&key), Bytes::new()))
            .await;
        assert_eq!(head.status(), StatusCode::NOT_FOUND);

        let unknown_ns = service
            .handle(request(
                Method::GET,
                &format!("/api/v1/refs/other/{}/{}", key.bucket, key.hash),
                Bytes::new(),
            ))
            .await;
        assert_eq!(unknown_ns.status(), StatusCode::NOT_FOUND);

        let bad_hash = service
            .handle(request(Method::GET, "/api/v1/refs/ddc/ServiceTests/xyz", Bytes::new()))
            .await;
        assert_eq!(bad_hash.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chunk_route() {
        let (store, service) = service();
        let record = record();
        store
            .put_record(&record, &CachePolicy::DEFAULT.into())
            .await
            .unwrap();

        let id = ValueId::from_name("Out");
        let response = service
            .handle(request(
                Method::GET,
                &format!("{}/{id}?offset=5&size=5", refs_path(record.key())),
                Bytes::new(),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(RAW_SIZE_HEADER).unwrap().to_str().unwrap(),
            "10"
        );
        assert_eq!(body(response).await.as_ref(), &[5, 6, 7, 8, 9]);

        let out_of_range = service
            .handle(request(
                Method::GET,
                &format!("{}/{id}?offset=11&size=1", refs_path(record.key())),
                Bytes::new(),
            ))
            .await;
        assert_eq!(out_of_range.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_values_and_exists() {
        let (_, service) = service();
        let key = CacheKey::new(CacheBucket::new("ServiceTests").unwrap(), ContentHash::of(b"v"));
        let value = Value::compress(vec![3u8; 40]).unwrap();
        let path = format!("/api/v1/values/ddc/{}/{}", key.bucket, key.hash);

        let put = service
            .handle(request(Method::PUT, &path, encode_value(&key, &value).unwrap()))
            .await;
        assert_eq!(put.status(), StatusCode::NO_CONTENT);

        let get = service.handle(request(Method::GET, &path, Bytes::new())).await;
        let (_, fetched) = decode_value(body(get).await).unwrap();
        assert_eq!(fetched.decompress().unwrap().as_ref(), &[3u8; 40][..]);

        let absent = CacheKey::new(key.bucket.clone(), ContentHash::of(b"absent"));
        let keys = serde_json::to_vec(&vec![key.to_string(), absent.to_string()]).unwrap();
        let response = service
            .handle(request(Method::POST, "/api/v1/exists/ddc", keys))
            .await;
        let found: Vec<bool> = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(found, vec![true, false]);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let store = Arc::new(MemoryCacheStore::default());
        let service = CacheService::new()
            .unwrap()
            .with_namespace("ddc", store.clone())
            .with_max_body_bytes(64);
        let record = record();
        let package = encode_record(&record).unwrap();
        assert!(package.len() > 64);

        let put = service
            .handle(request(Method::PUT, &refs_path(record.key()), package))
            .await;
        assert_eq!(put.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(store.record_count(), 0);

        let keys = serde_json::to_vec(&vec![record.key().to_string(); 8]).unwrap();
        let exists = service
            .handle(request(Method::POST, "/api/v1/exists/ddc", keys))
            .await;
        assert_eq!(exists.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Small bodies still pass
        let keys = serde_json::to_vec(&Vec::<String>::new()).unwrap();
        let empty = service
            .handle(request(Method::POST, "/api/v1/exists/ddc", keys))
            .await;
        assert_eq!(empty.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (_, service) = service();
        let health = service.handle(request(Method::GET, "/healthz", Bytes::new())).await;
        assert_eq!(health.status(), StatusCode::OK);

        let metrics = service.handle(request(Method::GET, "/metrics", Bytes::new())).await;
        assert_eq!(metrics.status(), StatusCode::OK);
        let text = String::from_utf8(body(metrics).await.to_vec()).unwrap();
        assert!(text.contains("ddc_requests_total"));
        assert!(text.contains("op=\"health\""));
        assert!(text.contains("ddc_store_counter"));
    }
}
