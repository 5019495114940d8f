//! Hierarchical Store
//!
//! Composes a local tier with an upstream tier.
//!
//! ```text
//!            put ──▶ local ──(ack)──▶ caller
//!                      │
//!                      └──▶ push queue ──▶ workers ──▶ upstream
//!
//!            get ──▶ local ──miss──▶ upstream ──hit──▶ caller
//!                                        └──▶ write-back ──▶ local
//! ```
//!
//! # Consistency
//!
//! - A Put is acknowledged once the local tier holds it; upstream visibility
//!   is eventual. [`CacheStore::flush`] waits for every queued push and
//!   write-back.
//! - Existence checks are answered by the local tier only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, instrument, warn};

use super::metrics::{LatencyTracker, MetricsSnapshot, StoreMetrics};
use super::{record_bytes, value_bytes, CacheStore};
use crate::cache::{CacheKey, CachePolicy, CacheRecord, CacheRecordPolicy, Value, ValueId};
use crate::error::{Error, Result};
use crate::request::ChunkData;

/// Hierarchical store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchicalStoreConfig {
    /// Name used in logs and metrics
    pub name: String,
    /// Number of tasks pushing to upstream
    pub push_workers: usize,
    /// Queued pushes before Put waits for room
    pub queue_capacity: usize,
    /// Copy upstream hits into the local tier
    pub write_back: bool,
}

impl Default for HierarchicalStoreConfig {
    fn default() -> Self {
        Self {
            name: "hierarchical".to_string(),
            push_workers: 4,
            queue_capacity: 1024,
            write_back: true,
        }
    }
}

enum Push {
    Record(CacheRecord, CacheRecordPolicy),
    Value(CacheKey, Value, CachePolicy),
}

/// State shared with push workers and write-back tasks
struct Shared {
    local: Arc<dyn CacheStore>,
    upstream: Arc<dyn CacheStore>,
    metrics: StoreMetrics,
    /// Pushes and write-backs not yet finished
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Local tier plus asynchronously fed upstream tier
pub struct HierarchicalCacheStore {
    config: HierarchicalStoreConfig,
    shared: Arc<Shared>,
    push_tx: mpsc::Sender<Push>,
    runtime: Handle,
}

impl HierarchicalCacheStore {
    /// Compose two tiers and start the push workers on the current runtime
    pub fn new(
        config: HierarchicalStoreConfig,
        local: Arc<dyn CacheStore>,
        upstream: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("hierarchical store needs a Tokio runtime: {e}")))?;

        let shared = Arc::new(Shared {
            local,
            upstream,
            metrics: StoreMetrics::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..config.push_workers.max(1) {
            runtime.spawn(push_worker(worker, rx.clone(), shared.clone()));
        }
        debug!(
            store = %config.name,
            local = shared.local.name(),
            upstream = shared.upstream.name(),
            workers = config.push_workers.max(1),
            "Started hierarchical cache store"
        );

        Ok(Self {
            config,
            shared,
            push_tx: tx,
            runtime,
        })
    }

    /// Get the local tier
    pub fn local(&self) -> &Arc<dyn CacheStore> {
        &self.shared.local
    }

    /// Get the upstream tier
    pub fn upstream(&self) -> &Arc<dyn CacheStore> {
        &self.shared.upstream
    }

    /// Pushes and write-backs not yet finished
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    async fn enqueue(&self, push: Push) -> Result<()> {
        self.shared.begin();
        if self.push_tx.send(push).await.is_err() {
            self.shared.finish();
            return Err(Error::Internal("upstream push queue closed".into()));
        }
        self.shared.metrics.record_upstream_queued();
        Ok(())
    }

    fn write_back_record(&self, record: CacheRecord) {
        let shared = self.shared.clone();
        shared.begin();
        self.runtime.spawn(async move {
            match shared.local.put_record(&record, &CachePolicy::DEFAULT.into()).await {
                Ok(()) => shared.metrics.record_write_back(),
                Err(e) => warn!(key = %record.key(), error = %e, "Write-back to local tier failed"),
            }
            shared.finish();
        });
    }

    fn write_back_value(&self, key: CacheKey, value: Value) {
        let shared = self.shared.clone();
        shared.begin();
        self.runtime.spawn(async move {
            match shared.local.put_value(&key, &value, CachePolicy::DEFAULT).await {
                Ok(()) => shared.metrics.record_write_back(),
                Err(e) => warn!(%key, error = %e, "Write-back to local tier failed"),
            }
            shared.finish();
        });
    }

    /// Whether a fetch under `policy` returns everything needed to write back
    fn wants_full(&self, policy: &CacheRecordPolicy) -> bool {
        self.config.write_back && !policy.combined().contains(CachePolicy::SKIP_DATA)
    }
}

async fn push_worker(worker: usize, rx: Arc<Mutex<mpsc::Receiver<Push>>>, shared: Arc<Shared>) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(push) = next else {
            break;
        };

        let tracker = LatencyTracker::start();
        let (key, result) = match &push {
            Push::Record(record, policy) => (
                record.key().clone(),
                shared.upstream.put_record(record, policy).await,
            ),
            Push::Value(key, value, policy) => {
                (key.clone(), shared.upstream.put_value(key, value, *policy).await)
            }
        };
        match result {
            Ok(()) => {
                shared.metrics.record_upstream_completed();
                shared.metrics.record_write_latency(tracker.elapsed());
            }
            Err(e) => {
                shared.metrics.record_upstream_failed();
                warn!(worker, %key, upstream = shared.upstream.name(), error = %e, "Upstream push failed");
            }
        }
        shared.finish();
    }
    debug!(worker, "Upstream push worker stopped");
}

#[async_trait]
impl CacheStore for HierarchicalCacheStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, record, policy), fields(store = %self.config.name, key = %record.key()))]
    async fn put_record(&self, record: &CacheRecord, policy: &CacheRecordPolicy) -> Result<()> {
        if let Err(e) = self.shared.local.put_record(record, policy).await {
            self.shared.metrics.record_write_failure();
            return Err(e);
        }
        self.shared.metrics.record_write(record_bytes(record));

        if !policy.record_policy().contains(CachePolicy::STORE_LOCAL_ONLY) {
            self.enqueue(Push::Record(record.clone(), policy.clone()))
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, policy), fields(store = %self.config.name, key = %key))]
    async fn get_record(&self, key: &CacheKey, policy: &CacheRecordPolicy) -> Result<CacheRecord> {
        let tracker = LatencyTracker::start();
        let local_error = match self.shared.local.get_record(key, policy).await {
            Ok(record) => {
                self.shared.metrics.record_hit(record_bytes(&record));
                self.shared.metrics.record_read_latency(tracker.elapsed());
                return Ok(record);
            }
            Err(e) => e,
        };
        if !local_error.is_not_found() {
            debug!(error = %local_error, "Local tier failed, trying upstream");
        }
        if policy.record_policy().contains(CachePolicy::QUERY_LOCAL_ONLY) {
            self.shared.metrics.record_miss();
            return Err(local_error);
        }

        let record = if self.wants_full(policy) {
            // Partial flags still apply upstream; only skips are dropped
            let full_policy = policy.without(CachePolicy::SKIP_META | CachePolicy::SKIP_DATA);
            match self.shared.upstream.get_record(key, &full_policy).await {
                Ok(full) => {
                    let shaped = full.apply_policy(policy);
                    if full.has_all_data() {
                        self.write_back_record(full);
                    } else {
                        debug!("Upstream record is incomplete, not writing back");
                    }
                    Ok(shaped)
                }
                Err(e) => Err(e),
            }
        } else {
            self.shared.upstream.get_record(key, policy).await
        };

        match record {
            Ok(record) => {
                self.shared.metrics.record_hit(record_bytes(&record));
                self.shared.metrics.record_read_latency(tracker.elapsed());
                Ok(record)
            }
            Err(e) => {
                self.shared.metrics.record_miss();
                Err(e)
            }
        }
    }

    #[instrument(skip(self, value, policy), fields(store = %self.config.name, key = %key))]
    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> Result<()> {
        if let Err(e) = self.shared.local.put_value(key, value, policy).await {
            self.shared.metrics.record_write_failure();
            return Err(e);
        }
        self.shared.metrics.record_write(value_bytes(value));

        if !policy.contains(CachePolicy::STORE_LOCAL_ONLY) {
            self.enqueue(Push::Value(key.clone(), value.clone(), policy))
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, policy), fields(store = %self.config.name, key = %key))]
    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Result<Value> {
        let tracker = LatencyTracker::start();
        let local_error = match self.shared.local.get_value(key, policy).await {
            Ok(value) => {
                self.shared.metrics.record_hit(value_bytes(&value));
                self.shared.metrics.record_read_latency(tracker.elapsed());
                return Ok(value);
            }
            Err(e) => e,
        };
        if policy.contains(CachePolicy::QUERY_LOCAL_ONLY) {
            self.shared.metrics.record_miss();
            return Err(local_error);
        }

        let write_back = self.config.write_back && !policy.contains(CachePolicy::SKIP_DATA);
        match self.shared.upstream.get_value(key, policy).await {
            Ok(value) => {
                if write_back {
                    self.write_back_value(key.clone(), value.clone());
                }
                self.shared.metrics.record_hit(value_bytes(&value));
                self.shared.metrics.record_read_latency(tracker.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.shared.metrics.record_miss();
                Err(e)
            }
        }
    }

    /// Chunk reads fall through to upstream without writing back; a chunk
    /// does not carry the rest of the record the local tier would need.
    async fn get_chunk(
        &self,
        key: &CacheKey,
        id: ValueId,
        offset: u64,
        size: u64,
        policy: CachePolicy,
    ) -> Result<ChunkData> {
        match self.shared.local.get_chunk(key, id, offset, size, policy).await {
            Ok(chunk) => Ok(chunk),
            Err(e) if policy.contains(CachePolicy::QUERY_LOCAL_ONLY) => Err(e),
            Err(_) => {
                self.shared
                    .upstream
                    .get_chunk(key, id, offset, size, policy)
                    .await
            }
        }
    }

    async fn probably_exists(&self, key: &CacheKey) -> Result<bool> {
        self.shared.local.probably_exists(key).await
    }

    async fn probably_exists_batch(&self, keys: &[CacheKey]) -> Vec<bool> {
        self.shared.local.probably_exists_batch(keys).await
    }

    async fn flush(&self) -> Result<()> {
        self.shared.drained().await;
        self.shared.local.flush().await?;
        self.shared.upstream.flush().await
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
