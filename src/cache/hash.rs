//! Content Hash
//!
//! 160-bit BLAKE3 digest naming every piece of cached content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Digest width in bytes
pub const HASH_SIZE: usize = 20;

/// Fixed-width content digest.
///
/// Ordering is plain byte comparison. Two payloads are the same content exactly
/// when their hashes are equal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash([u8; HASH_SIZE]);

impl ContentHash {
    /// The all-zero hash
    pub const ZERO: ContentHash = ContentHash([0; HASH_SIZE]);

    /// Hash a buffer
    pub fn of(data: &[u8]) -> Self {
        let mut builder = HashBuilder::new();
        builder.update(data);
        builder.finalize()
    }

    /// Wrap raw digest bytes
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Digest bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Whether this is the zero hash
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_SIZE]
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from 40 hex digits
    pub fn from_hex(text: &str) -> Result<Self> {
        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(text, &mut bytes).map_err(|_| Error::InvalidHash(text.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher producing a [`ContentHash`]
#[derive(Clone, Default)]
pub struct HashBuilder {
    inner: blake3::Hasher,
}

impl HashBuilder {
    /// Start an empty hash
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Truncate the BLAKE3 output to the digest width
    pub fn finalize(&self) -> ContentHash {
        let full = self.inner.finalize();
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&full.as_bytes()[..HASH_SIZE]);
        ContentHash(bytes)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(ContentHash::of(b"payload"), ContentHash::of(b"payload"));
        assert_ne!(ContentHash::of(b"payload"), ContentHash::of(b"payloae"));
    }

    #[test]
    fn test_builder_matches_one_shot() {
        let mut builder = HashBuilder::new();
        builder.update(b"Hello, ").update(b"World!");
        assert_eq!(builder.finalize(), ContentHash::of(b"Hello, World!"));
    }

    #[test]
    fn test_hex_parse() {
        let hash = ContentHash::of(b"abc");
        let text = hash.to_string();
        assert_eq!(text.len(), HASH_SIZE * 2);
        assert_eq!(text.parse::<ContentHash>().unwrap(), hash);

        assert!(ContentHash::from_hex("xyz").is_err());
        assert!(ContentHash::from_hex(&text[..38]).is_err());
    }

    #[test]
    fn test_zero() {
        assert!(ContentHash::ZERO.is_zero());
        assert!(ContentHash::default().is_zero());
        assert!(!ContentHash::of(b"").is_zero());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = ContentHash::of(b"json");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    proptest! {
        #[test]
        fn prop_ordering_follows_bytes(a in any::<[u8; 20]>(), b in any::<[u8; 20]>()) {
            let ha = ContentHash::from_bytes(a);
            let hb = ContentHash::from_bytes(b);
            prop_assert_eq!(ha.cmp(&hb), a.cmp(&b));
            prop_assert_eq!(ha.to_hex().cmp(&hb.to_hex()), a.cmp(&b));
        }
    }
}
