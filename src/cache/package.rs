//! Record Packages
//!
//! Self-contained binary container for a record or a bare value. Used as the
//! on-disk record file and as the HTTP body, so a record always travels (and is
//! renamed into place) as one unit.
//!
//! ```text
//! ┌──────┬─────────┬────────────────┬──────────────┬──────────────────────┐
//! │ DDCP │ version │ header len u32 │ JSON header  │ payloads (in order)  │
//! └──────┴─────────┴────────────────┴──────────────┴──────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::compression::{CompressedBuffer, CompressionMethod};
use super::hash::ContentHash;
use super::key::CacheKey;
use super::record::{CacheRecord, CacheRecordBuilder, RecordMeta};
use super::value::{Value, ValueId};
use crate::error::{Error, Result};

/// Leading magic bytes
pub const PACKAGE_MAGIC: &[u8; 4] = b"DDCP";

/// Current format version
pub const PACKAGE_VERSION: u8 = 1;

const PREAMBLE_LEN: usize = 4 + 1 + 4;

#[derive(Debug, Serialize, Deserialize)]
struct PackageHeader {
    key: CacheKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<RecordMeta>,
    values: Vec<ValueEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ValueEntry {
    id: ValueId,
    raw_hash: ContentHash,
    raw_size: u64,
    #[serde(default)]
    method: CompressionMethod,
    /// Encoded payload length; absent when the payload was not included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

impl ValueEntry {
    fn describe(id: ValueId, value: &Value) -> Self {
        Self {
            id,
            raw_hash: *value.raw_hash(),
            raw_size: value.raw_size(),
            method: value.data().map(|d| d.method()).unwrap_or_default(),
            size: value.data().map(|d| d.len() as u64),
        }
    }
}

fn encode(header: &PackageHeader, payloads: impl Iterator<Item = Bytes> + Clone) -> Result<Bytes> {
    let header_json = serde_json::to_vec(header)?;
    let payload_len: usize = payloads.clone().map(|p| p.len()).sum();
    let header_len = u32::try_from(header_json.len())
        .map_err(|_| Error::MalformedPackage("header too large".into()))?;

    let mut out = BytesMut::with_capacity(PREAMBLE_LEN + header_json.len() + payload_len);
    out.put_slice(PACKAGE_MAGIC);
    out.put_u8(PACKAGE_VERSION);
    out.put_u32_le(header_len);
    out.put_slice(&header_json);
    for payload in payloads {
        out.put_slice(&payload);
    }
    Ok(out.freeze())
}

fn decode(data: Bytes) -> Result<(PackageHeader, Vec<Value>)> {
    if data.len() < PREAMBLE_LEN || &data[..4] != PACKAGE_MAGIC {
        return Err(Error::MalformedPackage("bad magic".into()));
    }
    if data[4] != PACKAGE_VERSION {
        return Err(Error::MalformedPackage(format!(
            "unsupported version {}",
            data[4]
        )));
    }
    let header_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let body_start = PREAMBLE_LEN
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::MalformedPackage("truncated header".into()))?;

    let header: PackageHeader = serde_json::from_slice(&data[PREAMBLE_LEN..body_start])?;

    let mut cursor = body_start;
    let mut values = Vec::with_capacity(header.values.len());
    for entry in &header.values {
        let payload = match entry.size {
            Some(size) => {
                let end = usize::try_from(size)
                    .ok()
                    .and_then(|size| cursor.checked_add(size))
                    .filter(|end| *end <= data.len())
                    .ok_or_else(|| Error::MalformedPackage("truncated payload".into()))?;
                let slice = data.slice(cursor..end);
                cursor = end;
                Some(CompressedBuffer::from_encoded(entry.method, slice))
            }
            None => None,
        };
        values.push(Value::from_parts(entry.raw_hash, entry.raw_size, payload));
    }
    if cursor != data.len() {
        return Err(Error::MalformedPackage("trailing bytes".into()));
    }
    Ok((header, values))
}

/// Encode a record exactly as given (apply a policy first to strip parts)
pub fn encode_record(record: &CacheRecord) -> Result<Bytes> {
    let header = PackageHeader {
        key: record.key().clone(),
        meta: record.meta().cloned(),
        values: record
            .values()
            .iter()
            .map(|v| ValueEntry::describe(v.id(), v.value()))
            .collect(),
    };
    let payloads = record
        .values()
        .iter()
        .filter_map(|v| v.data().map(|d| d.data().clone()));
    encode(&header, payloads)
}

/// Decode a record package. Payloads are sliced, not copied, and not verified.
pub fn decode_record(data: Bytes) -> Result<CacheRecord> {
    let (header, values) = decode(data)?;
    let mut builder = CacheRecordBuilder::new(header.key);
    for (entry, value) in header.values.iter().zip(values) {
        builder = builder.add_value(entry.id, value);
    }
    if let Some(meta) = header.meta {
        builder = builder.set_meta(meta);
    }
    builder
        .build()
        .map_err(|e| Error::MalformedPackage(e.to_string()))
}

/// Encode a bare value stored under `key`
pub fn encode_value(key: &CacheKey, value: &Value) -> Result<Bytes> {
    let header = PackageHeader {
        key: key.clone(),
        meta: None,
        values: vec![ValueEntry::describe(ValueId::from_hash(value.raw_hash()), value)],
    };
    encode(&header, value.data().map(|d| d.data().clone()).into_iter())
}

/// Decode a bare value package
pub fn decode_value(data: Bytes) -> Result<(CacheKey, Value)> {
    let (header, mut values) = decode(data)?;
    if values.len() != 1 {
        return Err(Error::MalformedPackage(format!(
            "expected one value, found {}",
            values.len()
        )));
    }
    Ok((header.key, values.remove(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBucket, CachePolicy, CacheRecordPolicy};
    use assert_matches::assert_matches;

    fn sample_record() -> CacheRecord {
        CacheRecordBuilder::anonymous(CacheBucket::new("PackageTests").unwrap())
            .add_bytes(None, vec![1u8; 300])
            .add_bytes(None, (0u8..20).collect::<Vec<_>>())
            .set_meta(RecordMeta::new().with("Count", 2))
            .build()
            .unwrap()
    }

    #[test]
    fn test_record_package_preserves_everything() {
        let record = sample_record();
        let decoded = decode_record(encode_record(&record).unwrap()).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(decoded.meta(), record.meta());
        assert!(decoded.has_all_data());
        decoded.verify().unwrap();
    }

    #[test]
    fn test_stripped_package_has_no_payloads() {
        let record = sample_record();
        let stripped = record.apply_policy(&CacheRecordPolicy::new(
            CachePolicy::SKIP_DATA | CachePolicy::SKIP_META,
        ));
        let bytes = encode_record(&stripped).unwrap();
        let full = encode_record(&record).unwrap();
        assert!(bytes.len() < full.len());

        let decoded = decode_record(bytes).unwrap();
        assert!(decoded.meta().is_none());
        assert!(decoded.values().iter().all(|v| !v.has_data()));
        assert_eq!(decoded, stripped);
    }

    #[test]
    fn test_value_package() {
        let key = CacheKey::new(
            CacheBucket::new("PackageTests").unwrap(),
            ContentHash::of(b"value-key"),
        );
        let value = Value::compress(vec![4u8; 500]).unwrap();
        let (decoded_key, decoded) = decode_value(encode_value(&key, &value).unwrap()).unwrap();
        assert_eq!(decoded_key, key);
        assert_eq!(decoded, value);
        assert_eq!(decoded.decompress().unwrap().len(), 500);
    }

    #[test]
    fn test_rejects_corruption() {
        let bytes = encode_record(&sample_record()).unwrap();

        assert_matches!(
            decode_record(Bytes::from_static(b"nope")),
            Err(Error::MalformedPackage(_))
        );

        let truncated = bytes.slice(..bytes.len() - 1);
        assert_matches!(decode_record(truncated), Err(Error::MalformedPackage(_)));

        let mut extended = bytes.to_vec();
        extended.push(0);
        assert_matches!(
            decode_record(Bytes::from(extended)),
            Err(Error::MalformedPackage(_))
        );

        let mut wrong_version = bytes.to_vec();
        wrong_version[4] = 9;
        assert_matches!(
            decode_record(Bytes::from(wrong_version)),
            Err(Error::MalformedPackage(_))
        );
    }
}
