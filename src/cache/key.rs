//! Cache Keys

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::bucket::CacheBucket;
use super::hash::ContentHash;
use crate::error::{Error, Result};

/// Key that uniquely identifies a cache record: `(bucket, hash)`.
///
/// Ordered by bucket (case-insensitive) then by hash. Textual form is
/// `<bucket>/<hash-hex>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub bucket: CacheBucket,
    pub hash: ContentHash,
}

impl CacheKey {
    /// Create a key
    pub fn new(bucket: CacheBucket, hash: ContentHash) -> Self {
        Self { bucket, hash }
    }

    /// The null bucket with the zero hash
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this is the empty key
    pub fn is_empty(&self) -> bool {
        self.bucket.is_null() && self.hash.is_zero()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.hash)
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (bucket, hash) = s
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidKey(s.to_string()))?;
        let bucket = CacheBucket::new(bucket).map_err(|_| Error::InvalidKey(s.to_string()))?;
        let hash = ContentHash::from_hex(hash).map_err(|_| Error::InvalidKey(s.to_string()))?;
        Ok(Self { bucket, hash })
    }
}
