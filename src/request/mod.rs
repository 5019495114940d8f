//! Batched Request/Response Protocol
//!
//! Every store operation is submitted as a batch of requests under a
//! [`RequestOwner`]. Each request carries a caller-chosen `user_data` token that
//! is echoed verbatim on its response; that token is the only way responses,
//! which arrive in no particular order and on arbitrary worker threads, are
//! matched back to their requests.
//!
//! ```text
//! caller ── [Request; N] ──▶ dispatch ──▶ worker tasks ──▶ CacheStore
//!    ▲                                        │
//!    └──────── on_complete(Response) ◀────────┘  (exactly once per request)
//! ```

mod dispatch;
mod owner;

pub use dispatch::CacheStoreExt;
pub use owner::{OwnerState, Priority, RequestOwner};

use bytes::Bytes;

use crate::cache::{
    CacheKey, CachePolicy, CacheRecord, CacheRecordPolicy, ContentHash, Value, ValueId,
};

/// Outcome of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Completed successfully
    Ok,
    /// Not found, policy unsatisfiable, integrity or I/O failure
    Error,
    /// The owner was canceled before the request started
    Canceled,
}

impl Status {
    /// Whether the request succeeded
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::Error => write!(f, "error"),
            Status::Canceled => write!(f, "canceled"),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Store one record
#[derive(Debug, Clone)]
pub struct PutRequest {
    /// Debug label
    pub name: String,
    pub record: CacheRecord,
    pub policy: CacheRecordPolicy,
    pub user_data: u64,
}

impl PutRequest {
    pub fn new(
        name: impl Into<String>,
        record: CacheRecord,
        policy: impl Into<CacheRecordPolicy>,
        user_data: u64,
    ) -> Self {
        Self {
            name: name.into(),
            record,
            policy: policy.into(),
            user_data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResponse {
    pub name: String,
    pub key: CacheKey,
    pub status: Status,
    pub user_data: u64,
}

/// Fetch one record
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub name: String,
    pub key: CacheKey,
    pub policy: CacheRecordPolicy,
    pub user_data: u64,
}

impl GetRequest {
    pub fn new(
        name: impl Into<String>,
        key: CacheKey,
        policy: impl Into<CacheRecordPolicy>,
        user_data: u64,
    ) -> Self {
        Self {
            name: name.into(),
            key,
            policy: policy.into(),
            user_data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub name: String,
    pub key: CacheKey,
    /// Present only when `status` is [`Status::Ok`]
    pub record: Option<CacheRecord>,
    pub status: Status,
    pub user_data: u64,
}

// =============================================================================
// Values
// =============================================================================

/// Store one bare value
#[derive(Debug, Clone)]
pub struct PutValueRequest {
    pub name: String,
    pub key: CacheKey,
    pub value: Value,
    pub policy: CachePolicy,
    pub user_data: u64,
}

impl PutValueRequest {
    pub fn new(
        name: impl Into<String>,
        key: CacheKey,
        value: Value,
        policy: CachePolicy,
        user_data: u64,
    ) -> Self {
        Self {
            name: name.into(),
            key,
            value,
            policy,
            user_data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutValueResponse {
    pub name: String,
    pub key: CacheKey,
    pub status: Status,
    pub user_data: u64,
}

/// Fetch one bare value
#[derive(Debug, Clone)]
pub struct GetValueRequest {
    pub name: String,
    pub key: CacheKey,
    pub policy: CachePolicy,
    pub user_data: u64,
}

impl GetValueRequest {
    pub fn new(name: impl Into<String>, key: CacheKey, policy: CachePolicy, user_data: u64) -> Self {
        Self {
            name: name.into(),
            key,
            policy,
            user_data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetValueResponse {
    pub name: String,
    pub key: CacheKey,
    pub value: Option<Value>,
    pub status: Status,
    pub user_data: u64,
}

// =============================================================================
// Chunks
// =============================================================================

/// Fetch raw bytes `[offset, offset + size)` of one value in a record.
///
/// `raw_hash` names the expected content; the zero hash accepts any.
/// `size` is clamped to the end of the value.
#[derive(Debug, Clone)]
pub struct GetChunkRequest {
    pub name: String,
    pub key: CacheKey,
    pub id: ValueId,
    pub offset: u64,
    pub size: u64,
    pub raw_hash: ContentHash,
    pub policy: CachePolicy,
    pub user_data: u64,
}

impl GetChunkRequest {
    /// Request the whole value
    pub fn whole(name: impl Into<String>, key: CacheKey, id: ValueId, user_data: u64) -> Self {
        Self {
            name: name.into(),
            key,
            id,
            offset: 0,
            size: u64::MAX,
            raw_hash: ContentHash::ZERO,
            policy: CachePolicy::DEFAULT,
            user_data,
        }
    }

    /// Narrow to a byte range
    pub fn range(mut self, offset: u64, size: u64) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }

    /// Require specific content
    pub fn expect_hash(mut self, raw_hash: ContentHash) -> Self {
        self.raw_hash = raw_hash;
        self
    }

    /// Override the value policy
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// What a store returns for a chunk: the value identity, plus bytes unless
/// the policy skipped them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub raw_hash: ContentHash,
    pub raw_size: u64,
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct GetChunkResponse {
    pub name: String,
    pub key: CacheKey,
    pub id: ValueId,
    pub offset: u64,
    pub raw_size: u64,
    pub raw_hash: ContentHash,
    pub raw_data: Option<Bytes>,
    pub status: Status,
    pub user_data: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheBucket;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Ok.to_string(), "ok");
        assert_eq!(Status::Error.to_string(), "error");
        assert_eq!(Status::Canceled.to_string(), "canceled");
        assert!(Status::Ok.is_ok());
        assert!(!Status::Canceled.is_ok());
    }

    #[test]
    fn test_chunk_request_builder() {
        let key = CacheKey::new(CacheBucket::new("Chunks").unwrap(), ContentHash::of(b"k"));
        let id = ValueId::from_name("V");
        let request = GetChunkRequest::whole("test", key.clone(), id, 7)
            .range(5, 5)
            .expect_hash(ContentHash::of(b"v"))
            .policy(CachePolicy::SKIP_DATA);

        assert_eq!(request.key, key);
        assert_eq!((request.offset, request.size), (5, 5));
        assert_eq!(request.raw_hash, ContentHash::of(b"v"));
        assert_eq!(request.policy, CachePolicy::SKIP_DATA);
        assert_eq!(request.user_data, 7);
    }
}
