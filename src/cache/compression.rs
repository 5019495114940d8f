//! Value Compression
//!
//! LZ4 block compression for value payloads, with a pass-through method for
//! small or incompressible data.
//!
//! # Example
//!
//! ```
//! use derived_cache::cache::compression::{CompressedBuffer, CompressionConfig};
//!
//! let data = b"Hello, this is test data that should compress well! ".repeat(64);
//! let buffer = CompressedBuffer::compress(&data, &CompressionConfig::default()).unwrap();
//!
//! let decompressed = buffer.decompress().unwrap();
//! assert_eq!(decompressed.as_ref(), &data[..]);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Method
// =============================================================================

/// How a payload is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Stored as raw bytes
    #[default]
    None,
    /// LZ4 block with a prepended size
    Lz4,
}

impl CompressionMethod {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Method to try first
    pub method: CompressionMethod,
    /// Minimum size to compress (smaller payloads are stored raw)
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Lz4,
            min_size_bytes: 64,
            level: 4,
        }
    }
}

// =============================================================================
// Compressed Buffer
// =============================================================================

/// Encoded payload together with its method
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedBuffer {
    method: CompressionMethod,
    data: Bytes,
}

impl CompressedBuffer {
    /// Wrap raw bytes without compressing them
    pub fn uncompressed(data: Bytes) -> Self {
        Self {
            method: CompressionMethod::None,
            data,
        }
    }

    /// Wrap bytes that are already encoded with `method`
    pub fn from_encoded(method: CompressionMethod, data: Bytes) -> Self {
        Self { method, data }
    }

    /// Compress according to `config`.
    ///
    /// Falls back to [`CompressionMethod::None`] when the payload is below the
    /// size threshold or the encoded form would not be smaller.
    pub fn compress(raw: &[u8], config: &CompressionConfig) -> Result<Self> {
        if config.method == CompressionMethod::None || (raw.len() as u64) < config.min_size_bytes {
            return Ok(Self::uncompressed(Bytes::copy_from_slice(raw)));
        }

        let compressed = lz4::block::compress(
            raw,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(config.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?;

        if compressed.len() < raw.len() {
            Ok(Self {
                method: CompressionMethod::Lz4,
                data: Bytes::from(compressed),
            })
        } else {
            Ok(Self::uncompressed(Bytes::copy_from_slice(raw)))
        }
    }

    /// Decode back to raw bytes
    pub fn decompress(&self) -> Result<Bytes> {
        match self.method {
            CompressionMethod::None => Ok(self.data.clone()),
            CompressionMethod::Lz4 => lz4::block::decompress(&self.data, None)
                .map(Bytes::from)
                .map_err(|e| Error::DecompressionFailed {
                    algorithm: "LZ4".into(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Decoded size recorded in the encoding, if the method records one
    pub fn decoded_size(&self) -> Option<u64> {
        match self.method {
            CompressionMethod::None => Some(self.data.len() as u64),
            CompressionMethod::Lz4 => {
                let prefix: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
                u64::try_from(i32::from_le_bytes(prefix)).ok()
            }
        }
    }

    /// Encoding method
    #[inline]
    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Encoded bytes
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Encoded size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the encoded form is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    #[test]
    fn test_lz4_roundtrip() {
        let buffer = CompressedBuffer::compress(TEST_DATA, &CompressionConfig::default()).unwrap();
        assert_eq!(buffer.method(), CompressionMethod::Lz4);
        assert!(buffer.len() < TEST_DATA.len());
        assert_eq!(buffer.decompress().unwrap().as_ref(), TEST_DATA);
    }

    #[test]
    fn test_small_data_stays_raw() {
        let buffer = CompressedBuffer::compress(b"tiny", &CompressionConfig::default()).unwrap();
        assert_eq!(buffer.method(), CompressionMethod::None);
        assert_eq!(buffer.data().as_ref(), b"tiny");
    }

    #[test]
    fn test_incompressible_data_falls_back() {
        let config = CompressionConfig {
            min_size_bytes: 0,
            ..Default::default()
        };
        let noise: Vec<u8> = (0..97u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let buffer = CompressedBuffer::compress(&noise, &config).unwrap();
        assert!(buffer.len() <= noise.len());
        assert_eq!(buffer.decompress().unwrap().as_ref(), &noise[..]);
    }

    #[test]
    fn test_disabled_compression() {
        let config = CompressionConfig {
            method: CompressionMethod::None,
            ..Default::default()
        };
        let buffer = CompressedBuffer::compress(TEST_DATA, &config).unwrap();
        assert_eq!(buffer.method(), CompressionMethod::None);
    }

    #[test]
    fn test_corrupt_lz4_is_an_error() {
        let buffer = CompressedBuffer::from_encoded(
            CompressionMethod::Lz4,
            Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 1, 2, 3]),
        );
        assert!(matches!(
            buffer.decompress(),
            Err(Error::DecompressionFailed { .. })
        ));
    }

    #[test]
    fn test_decoded_size() {
        let buffer = CompressedBuffer::compress(TEST_DATA, &CompressionConfig::default()).unwrap();
        assert_eq!(buffer.decoded_size(), Some(TEST_DATA.len() as u64));

        let raw = CompressedBuffer::uncompressed(Bytes::from_static(b"abc"));
        assert_eq!(raw.decoded_size(), Some(3));

        let truncated = CompressedBuffer::from_encoded(CompressionMethod::Lz4, Bytes::from_static(&[1]));
        assert_eq!(truncated.decoded_size(), None);
    }

    #[test]
    fn test_method_names() {
        assert_eq!(CompressionMethod::None.to_string(), "none");
        assert_eq!(CompressionMethod::Lz4.to_string(), "lz4");
    }
}
