//! Derived-Data Cache
//!
//! A content-addressed cache for build artifacts. Records are keyed by
//! `(bucket, hash)` and hold optional metadata plus any number of values, each
//! identified by the hash of its raw content.
//!
//! # Architecture
//!
//! ```text
//! caller ── batch + RequestOwner ──▶ request dispatch ──▶ CacheStore
//!                                                           │
//!               ┌───────────────┬───────────────┬───────────┴──────┐
//!               ▼               ▼               ▼                  ▼
//!            Memory        FileSystem          Http          Hierarchical
//!                                               │            (local + upstream)
//!                                               ▼
//!                                         CacheService
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Keys, values, records, policies and the package format
//! - [`request`] - Batched requests, responses and the request owner
//! - [`store`] - The store trait and its backends
//! - [`service`] - HTTP front end serving stores by namespace
//! - [`config`] - Store trees loaded from YAML or JSON
//! - [`error`] - Error types

pub mod cache;
pub mod config;
pub mod error;
pub mod request;
pub mod service;
pub mod store;

pub use cache::{
    CacheBucket, CacheKey, CachePolicy, CacheRecord, CacheRecordBuilder, CacheRecordPolicy,
    ContentHash, RecordMeta, Value, ValueId,
};
pub use config::{CacheConfig, StoreConfig};
pub use error::{Error, Result};
pub use request::{CacheStoreExt, Priority, RequestOwner, Status};
pub use service::CacheService;
pub use store::CacheStore;
