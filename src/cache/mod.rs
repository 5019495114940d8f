//! Cache Data Model
//!
//! Value types shared by every store: hashes, buckets, keys, values, records
//! and policies. All of them are immutable after construction and cheap to
//! clone (payloads are reference-counted [`bytes::Bytes`]).
//!
//! # Layout
//!
//! ```text
//! CacheRecord
//! ├── CacheKey ── (CacheBucket, ContentHash)
//! ├── RecordMeta (optional)
//! └── [ValueWithId] sorted by ValueId
//!      └── Value ── raw hash, raw size, CompressedBuffer (optional)
//! ```

mod bucket;
mod hash;
mod key;
mod policy;
mod record;
mod value;
pub mod compression;
pub mod package;

pub use bucket::{CacheBucket, MAX_BUCKET_LEN};
pub use compression::{CompressedBuffer, CompressionConfig, CompressionMethod};
pub use hash::{ContentHash, HashBuilder, HASH_SIZE};
pub use key::CacheKey;
pub use policy::{CachePolicy, CacheRecordPolicy, CacheRecordPolicyBuilder};
pub use record::{CacheRecord, CacheRecordBuilder, RecordMeta};
pub use value::{Value, ValueId, ValueWithId, VALUE_ID_SIZE};
