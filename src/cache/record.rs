//! Cache Records
//!
//! A record is a key, optional structured metadata and a set of values with
//! unique ids. Records are frozen once built; [`CacheRecordBuilder`] is the only
//! way to assemble one.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::bucket::CacheBucket;
use super::key::CacheKey;
use super::policy::CacheRecordPolicy;
use super::value::{combine_hashes, Value, ValueId, ValueWithId};
use crate::error::{Error, Result};

// =============================================================================
// Metadata
// =============================================================================

/// Structured metadata attached to a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordMeta(serde_json::Map<String, serde_json::Value>);

impl RecordMeta {
    /// Empty metadata object
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Read a field
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    /// Read an integer field
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(serde_json::Value::as_i64)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Record
// =============================================================================

/// Immutable cache record.
///
/// Values are kept sorted by id, which fixes the enumeration order used for
/// chunk requests independently of insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    key: CacheKey,
    meta: Option<RecordMeta>,
    values: Vec<ValueWithId>,
}

impl CacheRecord {
    /// Record key
    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Metadata, if present and not skipped
    #[inline]
    pub fn meta(&self) -> Option<&RecordMeta> {
        self.meta.as_ref()
    }

    /// Values in id order
    #[inline]
    pub fn values(&self) -> &[ValueWithId] {
        &self.values
    }

    /// Look up one value by id
    pub fn value(&self, id: ValueId) -> Option<&ValueWithId> {
        self.values
            .binary_search_by(|v| v.id().cmp(&id))
            .ok()
            .map(|index| &self.values[index])
    }

    /// Sum of raw value sizes
    pub fn total_raw_size(&self) -> u64 {
        self.values.iter().map(|v| v.raw_size()).sum()
    }

    /// Whether every value carries its payload
    pub fn has_all_data(&self) -> bool {
        self.values.iter().all(|v| v.has_data())
    }

    /// Copy of this record with metadata and payloads stripped per `policy`
    pub fn apply_policy(&self, policy: &CacheRecordPolicy) -> Self {
        Self {
            key: self.key.clone(),
            meta: if policy.wants_meta() {
                self.meta.clone()
            } else {
                None
            },
            values: self
                .values
                .iter()
                .map(|v| {
                    if policy.wants_data(v.id()) {
                        v.clone()
                    } else {
                        v.remove_data()
                    }
                })
                .collect(),
        }
    }

    /// Verify every resident payload against its raw hash
    pub fn verify(&self) -> Result<()> {
        self.values.iter().try_for_each(|v| v.verify())
    }

    /// Split into parts
    pub fn into_parts(self) -> (CacheKey, Option<RecordMeta>, Vec<ValueWithId>) {
        (self.key, self.meta, self.values)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`CacheRecord`]
#[derive(Debug)]
pub struct CacheRecordBuilder {
    bucket: CacheBucket,
    key: Option<CacheKey>,
    meta: Option<RecordMeta>,
    values: Vec<ValueWithId>,
    error: Option<Error>,
}

impl CacheRecordBuilder {
    /// Build a record under an explicit key
    pub fn new(key: CacheKey) -> Self {
        Self {
            bucket: key.bucket.clone(),
            key: Some(key),
            meta: None,
            values: Vec::new(),
            error: None,
        }
    }

    /// Build a record whose key hash is derived from its values at `build()`
    pub fn anonymous(bucket: CacheBucket) -> Self {
        Self {
            bucket,
            key: None,
            meta: None,
            values: Vec::new(),
            error: None,
        }
    }

    /// Add a value under `id`
    pub fn add_value(mut self, id: ValueId, value: Value) -> Self {
        self.values.push(ValueWithId::new(id, value));
        self
    }

    /// Compress raw bytes and add them; the id defaults to one derived from
    /// the content hash.
    pub fn add_bytes(mut self, id: Option<ValueId>, raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        match Value::compress(&raw) {
            Ok(value) => {
                let id = id.unwrap_or_else(|| ValueId::from_hash(value.raw_hash()));
                self.values.push(ValueWithId::new(id, value));
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Attach metadata
    pub fn set_meta(mut self, meta: RecordMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Freeze the record.
    ///
    /// Fails on null or duplicate value ids.
    pub fn build(mut self) -> Result<CacheRecord> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.values.sort_by_key(|v| v.id());
        for pair in self.values.windows(2) {
            if pair[0].id() == pair[1].id() {
                return Err(Error::DuplicateValueId(pair[0].id()));
            }
        }
        if self.values.iter().any(|v| v.id().is_null()) {
            return Err(Error::NullValueId);
        }

        let key = match self.key {
            Some(key) => key,
            None => CacheKey::new(
                self.bucket,
                combine_hashes(self.values.iter().map(|v| v.raw_hash())),
            ),
        };

        Ok(CacheRecord {
            key,
            meta: self.meta,
            values: self.values,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicy, ContentHash};
    use assert_matches::assert_matches;

    fn bucket() -> CacheBucket {
        CacheBucket::new("RecordTests").unwrap()
    }

    fn sized(n: usize) -> Vec<u8> {
        (0..n).map(|i| i as u8).collect()
    }

    #[test]
    fn test_values_sorted_by_id() {
        let record = CacheRecordBuilder::anonymous(bucket())
            .add_bytes(None, sized(50))
            .add_bytes(None, sized(10))
            .add_bytes(None, sized(30))
            .build()
            .unwrap();

        let ids: Vec<_> = record.values().iter().map(|v| v.id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(record.total_raw_size(), 90);
    }

    #[test]
    fn test_insertion_order_does_not_affect_equality() {
        let a = CacheRecordBuilder::anonymous(bucket())
            .add_bytes(None, sized(10))
            .add_bytes(None, sized(20))
            .build()
            .unwrap();
        let b = CacheRecordBuilder::anonymous(bucket())
            .add_bytes(None, sized(20))
            .add_bytes(None, sized(10))
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let id = ValueId::from_name("Same");
        let result = CacheRecordBuilder::anonymous(bucket())
            .add_bytes(Some(id), sized(3))
            .add_bytes(Some(id), sized(4))
            .build();
        assert_matches!(result, Err(Error::DuplicateValueId(dup)) if dup == id);
    }

    #[test]
    fn test_null_id_rejected() {
        let result = CacheRecordBuilder::anonymous(bucket())
            .add_bytes(Some(ValueId::NULL), sized(3))
            .build();
        assert_matches!(result, Err(Error::NullValueId));
    }

    #[test]
    fn test_explicit_key_preserved() {
        let key = CacheKey::new(bucket(), ContentHash::of(b"explicit"));
        let record = CacheRecordBuilder::new(key.clone())
            .add_bytes(None, sized(8))
            .build()
            .unwrap();
        assert_eq!(record.key(), &key);
    }

    #[test]
    fn test_apply_policy() {
        let big = ValueId::from_name("Big");
        let small = ValueId::from_name("Small");
        let record = CacheRecordBuilder::anonymous(bucket())
            .add_bytes(Some(big), sized(100))
            .add_bytes(Some(small), sized(5))
            .set_meta(RecordMeta::new().with("Version", 3))
            .build()
            .unwrap();

        let policy = CacheRecordPolicy::builder(CachePolicy::SKIP_META)
            .value(big, CachePolicy::SKIP_DATA)
            .build();
        let stripped = record.apply_policy(&policy);

        assert!(stripped.meta().is_none());
        assert!(!stripped.value(big).unwrap().has_data());
        assert!(stripped.value(small).unwrap().has_data());
        assert_eq!(stripped, CacheRecord { meta: None, ..record.clone() });
    }

    #[test]
    fn test_meta_fields() {
        let meta = RecordMeta::new().with("MetaKey", 42);
        assert_eq!(meta.get_i64("MetaKey"), Some(42));
        assert_eq!(meta.len(), 1);
        assert!(RecordMeta::new().is_empty());
    }
}
