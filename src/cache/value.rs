//! Values
//!
//! A value is a content-addressed payload: the hash and size of its raw bytes
//! plus an optionally compressed copy of those bytes. Policies may strip the
//! payload, leaving only the identity.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::compression::{CompressedBuffer, CompressionConfig};
use super::hash::{ContentHash, HashBuilder};
use crate::error::{Error, Result};

/// Width of a value id in bytes
pub const VALUE_ID_SIZE: usize = 12;

// =============================================================================
// Value Id
// =============================================================================

/// Short stable identifier of a value inside a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ValueId([u8; VALUE_ID_SIZE]);

impl ValueId {
    /// The null id
    pub const NULL: ValueId = ValueId([0; VALUE_ID_SIZE]);

    /// Derive from a content hash, so identical content gets the same id
    pub fn from_hash(hash: &ContentHash) -> Self {
        let mut bytes = [0u8; VALUE_ID_SIZE];
        bytes.copy_from_slice(&hash.as_bytes()[..VALUE_ID_SIZE]);
        Self(bytes)
    }

    /// Derive from a symbolic name such as `"Mip0"`
    pub fn from_name(name: &str) -> Self {
        Self::from_hash(&ContentHash::of(name.as_bytes()))
    }

    /// Wrap raw id bytes
    pub const fn from_bytes(bytes: [u8; VALUE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Id bytes
    pub fn as_bytes(&self) -> &[u8; VALUE_ID_SIZE] {
        &self.0
    }

    /// Whether this is the null id
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueId({})", hex::encode(self.0))
    }
}

impl FromStr for ValueId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; VALUE_ID_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ValueId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ValueId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Value
// =============================================================================

/// Content-addressed payload.
///
/// Equality compares identity (raw hash and size), not residency: a value
/// fetched with `SKIP_DATA` equals the value that was stored.
#[derive(Clone)]
pub struct Value {
    raw_hash: ContentHash,
    raw_size: u64,
    data: Option<CompressedBuffer>,
}

impl Value {
    /// Compress raw bytes with the default configuration
    pub fn compress(raw: impl AsRef<[u8]>) -> Result<Self> {
        Self::compress_with(raw.as_ref(), &CompressionConfig::default())
    }

    /// Compress raw bytes with an explicit configuration
    pub fn compress_with(raw: &[u8], config: &CompressionConfig) -> Result<Self> {
        Ok(Self {
            raw_hash: ContentHash::of(raw),
            raw_size: raw.len() as u64,
            data: Some(CompressedBuffer::compress(raw, config)?),
        })
    }

    /// Wrap raw bytes without compressing them
    pub fn from_raw(raw: Bytes) -> Self {
        Self {
            raw_hash: ContentHash::of(&raw),
            raw_size: raw.len() as u64,
            data: Some(CompressedBuffer::uncompressed(raw)),
        }
    }

    /// Reassemble a value from stored parts.
    ///
    /// Nothing is verified here; fetch paths call [`Value::verify`].
    pub fn from_parts(raw_hash: ContentHash, raw_size: u64, data: Option<CompressedBuffer>) -> Self {
        Self {
            raw_hash,
            raw_size,
            data,
        }
    }

    /// Hash of the raw bytes
    #[inline]
    pub fn raw_hash(&self) -> &ContentHash {
        &self.raw_hash
    }

    /// Size of the raw bytes
    #[inline]
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    /// Whether the payload is resident
    #[inline]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Encoded payload, if resident
    #[inline]
    pub fn data(&self) -> Option<&CompressedBuffer> {
        self.data.as_ref()
    }

    /// Copy of this value without its payload
    pub fn remove_data(&self) -> Self {
        Self {
            raw_hash: self.raw_hash,
            raw_size: self.raw_size,
            data: None,
        }
    }

    /// Decode the payload and check it against the raw hash and size.
    pub fn decompress(&self) -> Result<Bytes> {
        let data = self.data.as_ref().ok_or(Error::MissingData(self.raw_hash))?;

        // Refuse to allocate for a payload that claims a different size
        match data.decoded_size() {
            Some(size) if size == self.raw_size => {}
            other => {
                return Err(Error::SizeMismatch {
                    expected: self.raw_size,
                    actual: other.unwrap_or(0),
                })
            }
        }

        let raw = data.decompress()?;
        if raw.len() as u64 != self.raw_size {
            return Err(Error::SizeMismatch {
                expected: self.raw_size,
                actual: raw.len() as u64,
            });
        }
        let actual = ContentHash::of(&raw);
        if actual != self.raw_hash {
            return Err(Error::HashMismatch {
                expected: self.raw_hash,
                actual,
            });
        }
        Ok(raw)
    }

    /// Verify the payload if resident; values without data pass.
    pub fn verify(&self) -> Result<()> {
        if self.has_data() {
            self.decompress()?;
        }
        Ok(())
    }

    /// Raw bytes `[offset, offset + size)`, clamped to the end of the value.
    pub fn chunk(&self, offset: u64, size: u64) -> Result<Bytes> {
        if offset > self.raw_size {
            return Err(Error::ChunkOutOfRange {
                offset,
                size,
                raw_size: self.raw_size,
            });
        }
        let raw = self.decompress()?;
        let end = offset.saturating_add(size).min(self.raw_size);
        Ok(raw.slice(offset as usize..end as usize))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_hash == other.raw_hash && self.raw_size == other.raw_size
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("raw_hash", &self.raw_hash)
            .field("raw_size", &self.raw_size)
            .field("has_data", &self.has_data())
            .finish()
    }
}

/// A value and the id it has inside its record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueWithId {
    id: ValueId,
    value: Value,
}

impl ValueWithId {
    /// Pair a value with its id
    pub fn new(id: ValueId, value: Value) -> Self {
        Self { id, value }
    }

    /// Id within the record
    #[inline]
    pub fn id(&self) -> ValueId {
        self.id
    }

    /// The value
    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Split into parts
    pub fn into_parts(self) -> (ValueId, Value) {
        (self.id, self.value)
    }

    /// Copy without payload
    pub fn remove_data(&self) -> Self {
        Self {
            id: self.id,
            value: self.value.remove_data(),
        }
    }
}

impl std::ops::Deref for ValueWithId {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}

/// Hash over a sequence of raw hashes, used for anonymous record keys
pub(crate) fn combine_hashes<'a>(hashes: impl IntoIterator<Item = &'a ContentHash>) -> ContentHash {
    let mut builder = HashBuilder::new();
    for hash in hashes {
        builder.update(hash.as_bytes());
    }
    builder.finalize()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ten_bytes() -> Vec<u8> {
        (0u8..10).collect()
    }

    #[test]
    fn test_value_id_from_hash_is_stable() {
        let hash = ContentHash::of(b"same content");
        assert_eq!(ValueId::from_hash(&hash), ValueId::from_hash(&hash));
        assert_eq!(ValueId::from_name("Mip0"), ValueId::from_name("Mip0"));
        assert_ne!(ValueId::from_name("Mip0"), ValueId::from_name("Mip1"));
        assert!(ValueId::NULL.is_null());
    }

    #[test]
    fn test_value_id_text() {
        let id = ValueId::from_name("Payload");
        let text = id.to_string();
        assert_eq!(text.len(), VALUE_ID_SIZE * 2);
        assert_eq!(text.parse::<ValueId>().unwrap(), id);
    }

    #[test]
    fn test_value_compress_and_decompress() {
        let raw = vec![7u8; 4096];
        let value = Value::compress(&raw).unwrap();
        assert!(value.has_data());
        assert_eq!(value.raw_size(), 4096);
        assert_eq!(*value.raw_hash(), ContentHash::of(&raw));
        assert!(value.data().unwrap().len() < raw.len());
        assert_eq!(value.decompress().unwrap().as_ref(), &raw[..]);
    }

    #[test]
    fn test_remove_data_keeps_identity() {
        let value = Value::from_raw(Bytes::from(ten_bytes()));
        let stripped = value.remove_data();
        assert!(!stripped.has_data());
        assert_eq!(stripped, value);
        assert_matches!(stripped.decompress(), Err(Error::MissingData(_)));
        assert!(stripped.verify().is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let good = Value::from_raw(Bytes::from(ten_bytes()));
        let forged = Value::from_parts(
            *good.raw_hash(),
            10,
            Some(CompressedBuffer::uncompressed(Bytes::from(vec![9u8; 10]))),
        );
        assert_matches!(forged.decompress(), Err(Error::HashMismatch { .. }));

        let short = Value::from_parts(
            *good.raw_hash(),
            10,
            Some(CompressedBuffer::uncompressed(Bytes::from(vec![0u8; 4]))),
        );
        assert_matches!(short.decompress(), Err(Error::SizeMismatch { .. }));
    }

    #[test]
    fn test_chunk_slices_raw_bytes() {
        let value = Value::compress(ten_bytes()).unwrap();
        assert_eq!(value.chunk(5, 5).unwrap().as_ref(), &[5, 6, 7, 8, 9]);
        assert_eq!(value.chunk(8, 100).unwrap().as_ref(), &[8, 9]);
        assert!(value.chunk(10, 1).unwrap().is_empty());
        assert_matches!(value.chunk(11, 1), Err(Error::ChunkOutOfRange { .. }));
    }

    #[test]
    fn test_value_with_id_deref() {
        let value = Value::from_raw(Bytes::from_static(b"abc"));
        let with_id = ValueWithId::new(ValueId::from_hash(value.raw_hash()), value.clone());
        assert_eq!(with_id.raw_size(), 3);
        assert_eq!(with_id.value(), &value);
        assert!(!with_id.remove_data().has_data());
    }
}
