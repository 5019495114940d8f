//! Memory Store
//!
//! Sharded in-process store. Used as a fast local tier and as the reference
//! backend in tests.
//!
//! Records are immutable and replaced whole under a shard write lock, so a
//! reader sees either the previous record or the new one, never a mix.
//!
//! # Capacity
//!
//! Once held bytes would reach `high_watermark * capacity_bytes`, the least
//! recently used records and values are dropped until usage falls to
//! `low_watermark * capacity_bytes`. A capacity of 0 disables eviction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::metrics::{LatencyTracker, MetricsSnapshot, StoreMetrics};
use super::shard::ShardedMap;
use super::{
    finish_record, finish_value, record_bytes, validate_put, validate_value, value_bytes,
    CacheStore,
};
use crate::cache::{CacheKey, CachePolicy, CacheRecord, CacheRecordPolicy, Value};
use crate::error::{Error, Result};

/// Default capacity (1 GiB)
pub const DEFAULT_MEMORY_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Memory store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// Name used in logs and metrics
    pub name: String,
    /// Number of shards (rounded up to a power of 2)
    pub shard_count: usize,
    /// Maximum encoded bytes held; 0 means unbounded
    pub capacity_bytes: u64,
    /// Fill ratio that starts eviction
    pub high_watermark: f64,
    /// Fill ratio eviction stops at
    pub low_watermark: f64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            shard_count: 64,
            capacity_bytes: DEFAULT_MEMORY_CAPACITY,
            high_watermark: 0.90, // Start eviction at 90%
            low_watermark: 0.80,  // Stop eviction at 80%
        }
    }
}

/// Stored item plus the tick of its last use
#[derive(Clone)]
struct Resident<T> {
    item: T,
    last_used: Arc<AtomicU64>,
}

fn resident_record_bytes(resident: &Resident<CacheRecord>) -> u64 {
    record_bytes(&resident.item)
}

fn resident_value_bytes(resident: &Resident<Value>) -> u64 {
    value_bytes(&resident.item)
}

enum Victim {
    Record(CacheKey),
    Value(CacheKey),
}

/// In-memory cache store
pub struct MemoryCacheStore {
    config: MemoryStoreConfig,
    records: ShardedMap<CacheKey, Resident<CacheRecord>>,
    values: ShardedMap<CacheKey, Resident<Value>>,
    clock: AtomicU64,
    evicting: AtomicBool,
    metrics: StoreMetrics,
}

impl MemoryCacheStore {
    /// Create a new memory store
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            records: ShardedMap::new(config.shard_count),
            values: ShardedMap::new(config.shard_count),
            clock: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
            metrics: StoreMetrics::new(),
            config,
        }
    }

    /// Number of stored records
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of stored bare values
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Encoded bytes held
    pub fn size_bytes(&self) -> u64 {
        self.records.size_bytes() + self.values.size_bytes()
    }

    /// Get capacity (0 when unbounded)
    pub fn capacity(&self) -> u64 {
        self.config.capacity_bytes
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn resident<T>(&self, item: T) -> Resident<T> {
        Resident {
            item,
            last_used: Arc::new(AtomicU64::new(self.tick())),
        }
    }

    fn touch<T>(&self, resident: Resident<T>) -> T {
        resident.last_used.store(self.tick(), Ordering::Relaxed);
        resident.item
    }

    /// Refuse payloads that can never fit, then make room for `incoming` bytes
    fn reserve(&self, incoming: u64) -> Result<()> {
        let capacity = self.config.capacity_bytes;
        if capacity == 0 {
            return Ok(());
        }
        if incoming > capacity {
            return Err(Error::TooLarge {
                size: incoming,
                limit: capacity,
            });
        }

        let high = (capacity as f64 * self.config.high_watermark) as u64;
        if self.size_bytes() + incoming >= high {
            self.evict(incoming);
        }
        Ok(())
    }

    /// Drop least recently used entries until usage plus `incoming` is at
    /// the low watermark. One evictor runs at a time.
    fn evict(&self, incoming: u64) {
        if self
            .evicting
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let low = (self.config.capacity_bytes as f64 * self.config.low_watermark) as u64;
        let target = low.saturating_sub(incoming);

        let mut candidates = Vec::new();
        self.records.for_each(|key, resident| {
            candidates.push((resident.last_used.load(Ordering::Relaxed), Victim::Record(key.clone())));
        });
        self.values.for_each(|key, resident| {
            candidates.push((resident.last_used.load(Ordering::Relaxed), Victim::Value(key.clone())));
        });
        candidates.sort_unstable_by_key(|(last_used, _)| *last_used);

        let mut evicted = 0;
        for (_, victim) in candidates {
            if self.size_bytes() <= target {
                break;
            }
            let removed = match &victim {
                Victim::Record(key) => self.records.remove(key, resident_record_bytes).is_some(),
                Victim::Value(key) => self.values.remove(key, resident_value_bytes).is_some(),
            };
            if removed {
                evicted += 1;
            }
        }
        self.evicting.store(false, Ordering::Release);

        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            debug!(store = %self.config.name, evicted, size = self.size_bytes(), "Evicted entries");
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn put_record(&self, record: &CacheRecord, _policy: &CacheRecordPolicy) -> Result<()> {
        let tracker = LatencyTracker::start();
        let size = record_bytes(record);
        if let Err(e) = validate_put(record).and_then(|()| self.reserve(size)) {
            self.metrics.record_write_failure();
            return Err(e);
        }

        self.records.insert(
            record.key().clone(),
            self.resident(record.clone()),
            size,
            resident_record_bytes,
        );
        self.metrics.record_write(size);
        self.metrics.record_write_latency(tracker.elapsed());
        trace!(store = %self.config.name, key = %record.key(), size, "Stored record");
        Ok(())
    }

    async fn get_record(&self, key: &CacheKey, policy: &CacheRecordPolicy) -> Result<CacheRecord> {
        let tracker = LatencyTracker::start();
        let Some(resident) = self.records.get(key) else {
            self.metrics.record_miss();
            return Err(Error::NotFound(key.clone()));
        };

        let record = finish_record(self.touch(resident), policy, &self.metrics)?;
        self.metrics.record_hit(record_bytes(&record));
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(record)
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, _policy: CachePolicy) -> Result<()> {
        let tracker = LatencyTracker::start();
        let size = value_bytes(value);
        if let Err(e) = validate_value(value).and_then(|()| self.reserve(size)) {
            self.metrics.record_write_failure();
            return Err(e);
        }

        self.values
            .insert(key.clone(), self.resident(value.clone()), size, resident_value_bytes);
        self.metrics.record_write(size);
        self.metrics.record_write_latency(tracker.elapsed());
        Ok(())
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Result<Value> {
        let tracker = LatencyTracker::start();
        let Some(resident) = self.values.get(key) else {
            self.metrics.record_miss();
            return Err(Error::NotFound(key.clone()));
        };

        let value = finish_value(self.touch(resident), policy, &self.metrics)?;
        self.metrics.record_hit(value_bytes(&value));
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(value)
    }

    async fn probably_exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.records.contains_key(key) || self.values.contains_key(key))
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBucket, CacheRecordBuilder, ContentHash, RecordMeta, ValueId};
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn bucket() -> CacheBucket {
        CacheBucket::new("MemoryTests").unwrap()
    }

    fn record() -> CacheRecord {
        CacheRecordBuilder::anonymous(bucket())
            .add_bytes(Some(ValueId::from_name("A")), vec![1u8; 100])
            .add_bytes(Some(ValueId::from_name("B")), (0u8..10).collect::<Vec<_>>())
            .set_meta(RecordMeta::new().with("MetaKey", 42))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_record() {
        let store = MemoryCacheStore::default();
        let record = record();
        store.put_record(&record, &CachePolicy::DEFAULT.into()).await.unwrap();

        let fetched = store
            .get_record(record.key(), &CachePolicy::DEFAULT.into())
            .await
            .unwrap();
        assert_eq!(fetched, record);
        assert_eq!(fetched.meta(), record.meta());
        assert!(fetched.has_all_data());
        assert_eq!(store.record_count(), 1);
        assert!(store.probably_exists(record.key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_policies_strip_parts() {
        let store = MemoryCacheStore::default();
        let record = record();
        store.put_record(&record, &CachePolicy::DEFAULT.into()).await.unwrap();

        let no_meta = store
            .get_record(record.key(), &CachePolicy::SKIP_META.into())
            .await
            .unwrap();
        assert!(no_meta.meta().is_none());
        assert!(no_meta.has_all_data());

        let no_data = store
            .get_record(record.key(), &CachePolicy::SKIP_DATA.into())
            .await
            .unwrap();
        assert!(no_data.meta().is_some());
        assert!(no_data.values().iter().all(|v| !v.has_data()));
    }

    #[tokio::test]
    async fn test_idempotent_put() {
        let store = MemoryCacheStore::default();
        let record = record();
        store.put_record(&record, &CachePolicy::DEFAULT.into()).await.unwrap();
        store.put_record(&record, &CachePolicy::DEFAULT.into()).await.unwrap();

        assert_eq!(store.record_count(), 1);
        assert_eq!(store.size_bytes(), record_bytes(&record));
        let fetched = store
            .get_record(record.key(), &CachePolicy::DEFAULT.into())
            .await
            .unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_miss() {
        let store = MemoryCacheStore::default();
        let key = CacheKey::new(bucket(), ContentHash::of(b"absent"));
        assert_matches!(
            store.get_record(&key, &CachePolicy::DEFAULT.into()).await,
            Err(Error::NotFound(_))
        );
        assert!(!store.probably_exists(&key).await.unwrap());
        assert_eq!(store.metrics().misses, 1);
    }

    #[tokio::test]
    async fn test_rejects_record_without_data() {
        let store = MemoryCacheStore::default();
        let stripped = record().apply_policy(&CachePolicy::SKIP_DATA.into());
        assert_matches!(
            store.put_record(&stripped, &CachePolicy::DEFAULT.into()).await,
            Err(Error::MissingData(_))
        );
        assert_eq!(store.metrics().write_failures, 1);
    }

    #[tokio::test]
    async fn test_values() {
        let store = MemoryCacheStore::default();
        let key = CacheKey::new(bucket(), ContentHash::of(b"value"));
        let value = Value::compress(vec![9u8; 64]).unwrap();
        store.put_value(&key, &value, CachePolicy::DEFAULT).await.unwrap();

        let fetched = store.get_value(&key, CachePolicy::DEFAULT).await.unwrap();
        assert_eq!(fetched.decompress().unwrap().as_ref(), &[9u8; 64][..]);
        let skipped = store.get_value(&key, CachePolicy::SKIP_DATA).await.unwrap();
        assert!(!skipped.has_data());
        assert_eq!(skipped, value);
        assert_eq!(store.value_count(), 1);
        assert!(store.probably_exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_default_chunk() {
        let store = MemoryCacheStore::default();
        let record = record();
        store.put_record(&record, &CachePolicy::DEFAULT.into()).await.unwrap();

        let chunk = store
            .get_chunk(record.key(), ValueId::from_name("B"), 5, 5, CachePolicy::DEFAULT)
            .await
            .unwrap();
        assert_eq!(chunk.data.unwrap().as_ref(), &[5, 6, 7, 8, 9]);
        assert_eq!(chunk.raw_size, 10);

        assert_matches!(
            store
                .get_chunk(record.key(), ValueId::from_name("C"), 0, 1, CachePolicy::DEFAULT)
                .await,
            Err(Error::ValueNotFound { .. })
        );
    }

    fn bounded(capacity_bytes: u64) -> MemoryCacheStore {
        MemoryCacheStore::new(MemoryStoreConfig {
            capacity_bytes,
            high_watermark: 0.80,
            low_watermark: 0.50,
            ..Default::default()
        })
    }

    fn raw_value(fill: u8, len: usize) -> Value {
        Value::from_raw(Bytes::from(vec![fill; len]))
    }

    fn value_key(n: u8) -> CacheKey {
        CacheKey::new(bucket(), ContentHash::of(&[n]))
    }

    #[tokio::test]
    async fn test_eviction_keeps_recent_entries() {
        let store = bounded(1000);
        for n in 0..7u8 {
            store
                .put_value(&value_key(n), &raw_value(n, 100), CachePolicy::DEFAULT)
                .await
                .unwrap();
        }
        assert_eq!(store.size_bytes(), 700);

        // Reading the oldest entry makes it recent
        store.get_value(&value_key(0), CachePolicy::DEFAULT).await.unwrap();

        // Reaching 800 bytes triggers eviction down to 500 including the new entry
        store
            .put_value(&value_key(7), &raw_value(7, 100), CachePolicy::DEFAULT)
            .await
            .unwrap();
        assert!(store.size_bytes() <= 500);
        assert!(store.probably_exists(&value_key(0)).await.unwrap());
        assert!(store.probably_exists(&value_key(7)).await.unwrap());
        assert!(!store.probably_exists(&value_key(1)).await.unwrap());
        assert_eq!(store.metrics().evictions, 3);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let store = bounded(50);
        assert_matches!(
            store
                .put_value(&value_key(1), &raw_value(1, 100), CachePolicy::DEFAULT)
                .await,
            Err(Error::TooLarge { size: 100, limit: 50 })
        );
        assert_eq!(store.value_count(), 0);
        assert_eq!(store.metrics().write_failures, 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_unbounded() {
        let store = bounded(0);
        for n in 0..20u8 {
            store
                .put_value(&value_key(n), &raw_value(n, 100), CachePolicy::DEFAULT)
                .await
                .unwrap();
        }
        assert_eq!(store.value_count(), 20);
        assert_eq!(store.metrics().evictions, 0);
    }
}
