//! Cache Buckets
//!
//! Interned, case-insensitive namespace labels. The first spelling seen for a
//! name becomes the canonical one; later spellings that differ only in case
//! resolve to the same interned entry, so identity is a pointer comparison.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Longest permitted bucket name in bytes
pub const MAX_BUCKET_LEN: usize = 255;

/// Interned names keyed by their lowercase form
static BUCKET_NAMES: Lazy<DashMap<String, Arc<str>>> = Lazy::new(DashMap::new);

/// Alphanumeric label grouping related records.
///
/// The default value is the null bucket, which is distinct from every real
/// bucket and sorts before all of them.
#[derive(Clone, Default)]
pub struct CacheBucket {
    name: Option<Arc<str>>,
}

impl CacheBucket {
    /// Intern a bucket name.
    ///
    /// Names must be 1..=255 ASCII alphanumeric bytes.
    pub fn new(name: &str) -> Result<Self> {
        Self::validate(name)?;
        let folded = name.to_ascii_lowercase();
        let interned = BUCKET_NAMES
            .entry(folded)
            .or_insert_with(|| Arc::from(name))
            .clone();
        Ok(Self {
            name: Some(interned),
        })
    }

    /// The null bucket
    pub const fn null() -> Self {
        Self { name: None }
    }

    fn validate(name: &str) -> Result<()> {
        let reason = if name.is_empty() {
            "must not be empty"
        } else if name.len() > MAX_BUCKET_LEN {
            "must be at most 255 bytes"
        } else if !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            "must be alphanumeric"
        } else {
            return Ok(());
        };
        Err(Error::InvalidBucket {
            name: name.to_string(),
            reason,
        })
    }

    /// Whether this is the null bucket
    #[inline]
    pub fn is_null(&self) -> bool {
        self.name.is_none()
    }

    /// Canonical name, empty for the null bucket
    #[inline]
    pub fn as_str(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Reference encoding: one length byte followed by the name and a NUL
    pub fn to_length_prefixed(&self) -> Vec<u8> {
        let name = self.as_str().as_bytes();
        let mut out = Vec::with_capacity(name.len() + 2);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.push(0);
        out
    }
}

impl PartialEq for CacheBucket {
    fn eq(&self, other: &Self) -> bool {
        match (&self.name, &other.name) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for CacheBucket {}

impl Hash for CacheBucket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Pointer identity is stable for the process lifetime
        self.name
            .as_ref()
            .map(|n| Arc::as_ptr(n) as *const u8 as usize)
            .hash(state);
    }
}

impl Ord for CacheBucket {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        let a = self.as_str().bytes().map(|b| b.to_ascii_lowercase());
        let b = other.as_str().bytes().map(|b| b.to_ascii_lowercase());
        a.cmp(b)
    }
}

impl PartialOrd for CacheBucket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CacheBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CacheBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "CacheBucket({})", name),
            None => f.write_str("CacheBucket(null)"),
        }
    }
}

impl Serialize for CacheBucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CacheBucket {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            return Ok(Self::null());
        }
        Self::new(&text).map_err(serde::de::Error::custom)
    }
}
