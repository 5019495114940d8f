//! Legacy Flat Store
//!
//! String-keyed blobs on top of any [`CacheStore`]. Each string key maps to
//! `Legacy/<hash(key)>` holding a single value; entries are never removed.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::CacheStore;
use crate::cache::{CacheBucket, CacheKey, CachePolicy, ContentHash, Value};
use crate::error::Result;

/// Bucket used for flat keys
pub const LEGACY_BUCKET: &str = "Legacy";

/// Flat key/blob view over a cache store
#[derive(Clone)]
pub struct LegacyCacheStore {
    inner: Arc<dyn CacheStore>,
    bucket: CacheBucket,
}

impl LegacyCacheStore {
    /// Wrap a store
    pub fn new(inner: Arc<dyn CacheStore>) -> Result<Self> {
        Ok(Self {
            inner,
            bucket: CacheBucket::new(LEGACY_BUCKET)?,
        })
    }

    /// Key a flat string maps to
    pub fn key_for(&self, key: &str) -> CacheKey {
        CacheKey::new(self.bucket.clone(), ContentHash::of(key.as_bytes()))
    }

    /// Store `data` under `key`
    pub async fn put_cached_data(&self, key: &str, data: impl AsRef<[u8]>) -> Result<()> {
        let value = Value::compress(data)?;
        self.inner
            .put_value(&self.key_for(key), &value, CachePolicy::DEFAULT)
            .await
    }

    /// Fetch the blob under `key`; `None` on a miss
    pub async fn get_cached_data(&self, key: &str) -> Result<Option<Bytes>> {
        match self.inner.get_value(&self.key_for(key), CachePolicy::DEFAULT).await {
            Ok(value) => value.decompress().map(Some),
            Err(e) if e.is_not_found() => {
                debug!(key, "Legacy cache miss");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort existence check
    pub async fn cached_data_probably_exists(&self, key: &str) -> Result<bool> {
        self.inner.probably_exists(&self.key_for(key)).await
    }

    /// Existence check for many keys; failures report `false`
    pub async fn cached_data_probably_exists_batch(&self, keys: &[&str]) -> Vec<bool> {
        let keys: Vec<CacheKey> = keys.iter().map(|k| self.key_for(k)).collect();
        self.inner.probably_exists_batch(&keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCacheStore;

    fn legacy() -> (Arc<MemoryCacheStore>, LegacyCacheStore) {
        let store = Arc::new(MemoryCacheStore::default());
        let legacy = LegacyCacheStore::new(store.clone()).unwrap();
        (store, legacy)
    }

    #[tokio::test]
    async fn test_put_get_cached_data() {
        let (store, legacy) = legacy();
        legacy
            .put_cached_data("shaders/global.bin", b"compiled".repeat(50))
            .await
            .unwrap();

        let data = legacy.get_cached_data("shaders/global.bin").await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"compiled".repeat(50).as_slice());
        assert_eq!(store.value_count(), 1);
        assert!(legacy.key_for("shaders/global.bin").to_string().starts_with("Legacy/"));
    }

    #[tokio::test]
    async fn test_miss_is_none() {
        let (_, legacy) = legacy();
        assert!(legacy.get_cached_data("absent").await.unwrap().is_none());
        assert!(!legacy.cached_data_probably_exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_batch() {
        let (_, legacy) = legacy();
        legacy.put_cached_data("a", b"1").await.unwrap();
        legacy.put_cached_data("c", b"3").await.unwrap();

        assert_eq!(
            legacy.cached_data_probably_exists_batch(&["a", "b", "c"]).await,
            vec![true, false, true]
        );
    }
}
