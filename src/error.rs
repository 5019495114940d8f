//! Error types for the derived-data cache

use thiserror::Error;

use crate::cache::{CacheKey, ContentHash, ValueId};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised inside cache stores.
///
/// These never cross the batch boundary: the request dispatcher turns them into
/// a per-element [`Status`](crate::request::Status).
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Data Model Errors
    // =========================================================================
    /// Bucket name violates the naming rules
    #[error("Invalid cache bucket name '{name}': {reason}")]
    InvalidBucket { name: String, reason: &'static str },

    /// Textual cache key could not be parsed
    #[error("Invalid cache key '{0}'")]
    InvalidKey(String),

    /// Hex digest could not be parsed
    #[error("Invalid content hash '{0}'")]
    InvalidHash(String),

    /// A record builder received the same value id twice
    #[error("Duplicate value id {0} in record")]
    DuplicateValueId(ValueId),

    /// A record builder received the null value id
    #[error("Value id must not be null")]
    NullValueId,

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Record or value is not present in the store
    #[error("Cache miss for {0}")]
    NotFound(CacheKey),

    /// A chunk request named a value the record does not have
    #[error("Value {id} not found in record {key}")]
    ValueNotFound { key: CacheKey, id: ValueId },

    /// A chunk request reached past the end of the value
    #[error("Chunk [{offset}, +{size}) out of range for value of {raw_size} bytes")]
    ChunkOutOfRange { offset: u64, size: u64, raw_size: u64 },

    /// Payload is needed but the value does not carry it
    #[error("Value {0} has no resident data")]
    MissingData(ContentHash),

    /// Payload exceeds what the store or service accepts
    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Decompressed payload does not hash to the advertised raw hash
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Decompressed payload has the wrong length
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Record package could not be decoded
    #[error("Malformed record package: {0}")]
    MalformedPackage(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote answered with an unexpected status
    #[error("Remote cache returned {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },

    // =========================================================================
    // Configuration / Serialization Errors
    // =========================================================================
    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// Request owner was canceled before the element started
    #[error("Request canceled")]
    Canceled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is a plain cache miss rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let key = CacheKey::empty();
        assert!(Error::NotFound(key).is_not_found());
        assert!(!Error::Canceled.is_not_found());
    }

    #[test]
    fn test_transient_status() {
        let server = Error::UnexpectedStatus {
            status: 503,
            url: "http://cache/refs".into(),
        };
        let client = Error::UnexpectedStatus {
            status: 400,
            url: "http://cache/refs".into(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(!Error::Canceled.is_transient());
    }

    #[test]
    fn test_hash_mismatch_message() {
        let err = Error::HashMismatch {
            expected: ContentHash::of(b"a"),
            actual: ContentHash::of(b"b"),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Hash mismatch"));
        assert!(msg.contains(&ContentHash::of(b"a").to_string()));
    }
}
