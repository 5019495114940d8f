//! Cache Stores
//!
//! The [`CacheStore`] trait is the per-element contract every backend
//! implements. Batching, correlation and status reporting live in
//! [`crate::request`]; a store only ever sees one element at a time and
//! reports failures as [`Error`](crate::Error) values.
//!
//! # Backends
//!
//! ```text
//! ┌────────────────────────┐
//! │  HierarchicalCacheStore│── local tier ──▶ Memory / FileSystem
//! │                        │── upstream ────▶ Http (or any CacheStore)
//! └────────────────────────┘
//! LegacyCacheStore ── flat string keys over any CacheStore
//! ```

pub mod filesystem;
pub mod hierarchical;
pub mod http;
pub mod legacy;
pub mod memory;
pub mod metrics;
mod shard;

pub use filesystem::{FileSystemCacheStore, FileSystemStoreConfig};
pub use hierarchical::{HierarchicalCacheStore, HierarchicalStoreConfig};
pub use http::{HttpCacheStore, HttpStoreConfig};
pub use legacy::LegacyCacheStore;
pub use memory::{MemoryCacheStore, MemoryStoreConfig};
pub use metrics::{MetricsSnapshot, StoreMetrics};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::cache::{CacheKey, CachePolicy, CacheRecord, CacheRecordPolicy, Value, ValueId};
use crate::error::{Error, Result};
use crate::request::ChunkData;

/// Asynchronous key/record store
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Store a record. Re-storing identical content succeeds.
    async fn put_record(&self, record: &CacheRecord, policy: &CacheRecordPolicy) -> Result<()>;

    /// Fetch a record shaped by `policy`. Resident payloads are verified.
    async fn get_record(&self, key: &CacheKey, policy: &CacheRecordPolicy) -> Result<CacheRecord>;

    /// Store a bare value
    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> Result<()>;

    /// Fetch a bare value
    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Result<Value>;

    /// Fetch raw bytes `[offset, offset + size)` of value `id` in a record
    async fn get_chunk(
        &self,
        key: &CacheKey,
        id: ValueId,
        offset: u64,
        size: u64,
        policy: CachePolicy,
    ) -> Result<ChunkData> {
        let record_policy = CacheRecordPolicy::builder(CachePolicy::SKIP_META | CachePolicy::SKIP_DATA)
            .value(id, policy)
            .build();
        let record = self.get_record(key, &record_policy).await?;
        let value = record.value(id).ok_or_else(|| Error::ValueNotFound {
            key: key.clone(),
            id,
        })?;
        chunk_of(value, offset, size, policy)
    }

    /// Best-effort check for a record or value under `key`
    async fn probably_exists(&self, key: &CacheKey) -> Result<bool>;

    /// Existence check for many keys. Failed lookups report `false`.
    async fn probably_exists_batch(&self, keys: &[CacheKey]) -> Vec<bool> {
        join_all(keys.iter().map(|key| async move {
            self.probably_exists(key).await.unwrap_or_else(|e| {
                warn!(store = self.name(), %key, error = %e, "Existence check failed");
                false
            })
        }))
        .await
    }

    /// Wait until writes accepted so far have reached every tier
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Get metrics snapshot
    fn metrics(&self) -> MetricsSnapshot;
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Encoded payload bytes carried by a record
pub(crate) fn record_bytes(record: &CacheRecord) -> u64 {
    record
        .values()
        .iter()
        .filter_map(|v| v.data().map(|d| d.len() as u64))
        .sum()
}

/// Encoded payload bytes carried by a value
pub(crate) fn value_bytes(value: &Value) -> u64 {
    value.data().map(|d| d.len() as u64).unwrap_or(0)
}

/// Reject records that cannot be stored: every value must carry a payload
/// matching its raw hash.
pub(crate) fn validate_put(record: &CacheRecord) -> Result<()> {
    if let Some(missing) = record.values().iter().find(|v| !v.has_data()) {
        return Err(Error::MissingData(*missing.raw_hash()));
    }
    record.verify()
}

/// Same check for a bare value
pub(crate) fn validate_value(value: &Value) -> Result<()> {
    if !value.has_data() {
        return Err(Error::MissingData(*value.raw_hash()));
    }
    value.verify()
}

/// Shape a stored record for a fetch and verify what is returned.
///
/// A value whose payload fails verification is stripped when its policy
/// allows a partial record; otherwise the whole fetch fails.
pub(crate) fn finish_record(
    record: CacheRecord,
    policy: &CacheRecordPolicy,
    metrics: &StoreMetrics,
) -> Result<CacheRecord> {
    let shaped = record.apply_policy(policy);
    if shaped.values().iter().all(|v| v.verify().is_ok()) {
        return Ok(shaped);
    }

    let (key, meta, values) = shaped.into_parts();
    let mut builder = crate::cache::CacheRecordBuilder::new(key);
    for value in values {
        let value = match value.verify() {
            Ok(()) => value,
            Err(e) => {
                if matches!(e, Error::HashMismatch { .. } | Error::SizeMismatch { .. }) {
                    metrics.record_hash_mismatch();
                }
                if !policy.value_policy(value.id()).contains(CachePolicy::PARTIAL_RECORD) {
                    return Err(e);
                }
                value.remove_data()
            }
        };
        let (id, value) = value.into_parts();
        builder = builder.add_value(id, value);
    }
    if let Some(meta) = meta {
        builder = builder.set_meta(meta);
    }
    builder.build()
}

/// Shape a stored value for a fetch
pub(crate) fn finish_value(value: Value, policy: CachePolicy, metrics: &StoreMetrics) -> Result<Value> {
    if policy.contains(CachePolicy::SKIP_DATA) {
        return Ok(value.remove_data());
    }
    if let Err(e) = value.verify() {
        if matches!(e, Error::HashMismatch { .. } | Error::SizeMismatch { .. }) {
            metrics.record_hash_mismatch();
        }
        return Err(e);
    }
    Ok(value)
}

/// Slice a fetched value; `SKIP_DATA` returns only the identity
pub(crate) fn chunk_of(value: &Value, offset: u64, size: u64, policy: CachePolicy) -> Result<ChunkData> {
    let data = if policy.contains(CachePolicy::SKIP_DATA) {
        None
    } else {
        Some(value.chunk(offset, size)?)
    };
    Ok(ChunkData {
        raw_hash: *value.raw_hash(),
        raw_size: value.raw_size(),
        data,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBucket, CacheRecordBuilder, CompressedBuffer, ContentHash};
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn bucket() -> CacheBucket {
        CacheBucket::new("StoreHelpers").unwrap()
    }

    fn forged(id: &str) -> (ValueId, Value) {
        let good = Value::from_raw(Bytes::from_static(b"genuine"));
        let bad = Value::from_parts(
            *good.raw_hash(),
            good.raw_size(),
            Some(CompressedBuffer::uncompressed(Bytes::from_static(b"forgery"))),
        );
        (ValueId::from_name(id), bad)
    }

    #[test]
    fn test_validate_put_requires_data() {
        let record = CacheRecordBuilder::anonymous(bucket())
            .add_bytes(None, vec![1u8; 10])
            .build()
            .unwrap();
        assert!(validate_put(&record).is_ok());

        let stripped = record.apply_policy(&CachePolicy::SKIP_DATA.into());
        assert_matches!(validate_put(&stripped), Err(Error::MissingData(_)));
    }

    #[test]
    fn test_finish_record_rejects_corruption() {
        let (id, bad) = forged("Bad");
        let record = CacheRecordBuilder::new(CacheKey::new(bucket(), ContentHash::of(b"r")))
            .add_value(id, bad)
            .build()
            .unwrap();
        let metrics = StoreMetrics::new();

        assert_matches!(
            finish_record(record.clone(), &CachePolicy::DEFAULT.into(), &metrics),
            Err(Error::HashMismatch { .. })
        );
        assert_eq!(metrics.snapshot().hash_mismatches, 1);

        // Skipping the payload skips its verification
        let skipped = finish_record(record.clone(), &CachePolicy::SKIP_DATA.into(), &metrics).unwrap();
        assert!(!skipped.values()[0].has_data());

        // Partial records drop the bad payload instead of failing
        let partial = finish_record(record, &CachePolicy::PARTIAL_RECORD.into(), &metrics).unwrap();
        assert!(!partial.values()[0].has_data());
    }

    #[test]
    fn test_chunk_of_skip_data() {
        let value = Value::compress((0u8..10).collect::<Vec<_>>()).unwrap();
        let chunk = chunk_of(&value, 5, 5, CachePolicy::DEFAULT).unwrap();
        assert_eq!(chunk.data.unwrap().as_ref(), &[5, 6, 7, 8, 9]);

        let skipped = chunk_of(&value, 5, 5, CachePolicy::SKIP_DATA).unwrap();
        assert!(skipped.data.is_none());
        assert_eq!(skipped.raw_size, 10);
        assert_eq!(&skipped.raw_hash, value.raw_hash());
    }
}
