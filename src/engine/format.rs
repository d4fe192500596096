//! Key encodings, hashing helpers and the checksummed record frame.
//!
//! # Record layout (24 bytes header + variable body)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     magic ("LREC")
//! 4       2     version
//! 6       2     kind (RecordKind)
//! 8       4     body_len
//! 12      4     body_checksum (CRC32C)
//! 16      4     header_checksum (CRC32C of bytes 0..16)
//! 20      4     reserved (must be zero)
//! 24      var   body (bincode)
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::errors::StorageError;
use crate::engine::store::{Column, ReadSnapshot};

/// 32-byte content hash / accumulator.
pub type Hash32 = [u8; 32];

/// All-zero hash: accumulator before the first item.
pub const ZERO_HASH: Hash32 = [0u8; 32];

/// Record magic bytes: "LREC".
pub const RECORD_MAGIC: [u8; 4] = [0x4C, 0x52, 0x45, 0x43];

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Record types stored behind the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordKind {
    Checkpoint = 1,
    MessageEntry = 2,
    SequencerBatchItem = 3,
    DelayedMessage = 4,
    Value = 5,
}

/// Hash arbitrary bytes.
#[inline]
pub fn hash_bytes(data: &[u8]) -> Hash32 {
    *blake3::hash(data).as_bytes()
}

/// Hash a sequence of parts with a domain tag.
pub fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Big-endian key so lexicographic byte order equals numeric order.
#[inline]
pub fn u64_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Parse a key written by `u64_key`.
pub fn key_to_u64(column: Column, key: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| StorageError::Corruption {
        column,
        reason: format!("expected 8-byte key, found {} bytes", key.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Parse an 8-byte little-endian counter value.
pub fn value_to_u64(column: Column, value: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| StorageError::Corruption {
        column,
        reason: format!("expected 8-byte counter, found {} bytes", value.len()),
    })?;
    Ok(u64::from_le_bytes(bytes))
}

/// Frame and checksum a serializable body.
pub fn encode_record<T: Serialize>(kind: RecordKind, body: &T) -> Result<Vec<u8>, StorageError> {
    let body = bincode::serialize(body)?;
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());

    out.extend_from_slice(&RECORD_MAGIC);
    out.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    out.extend_from_slice(&(kind as u16).to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    let header_checksum = crc32c::crc32c(&out[0..16]);
    out.extend_from_slice(&header_checksum.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);

    out.extend_from_slice(&body);
    Ok(out)
}

/// Validate a frame and decode its body.
///
/// Any mismatch (magic, version, kind, checksums, length) is reported as
/// `StorageError::Corruption` for `column`.
pub fn decode_record<T: DeserializeOwned>(
    column: Column,
    kind: RecordKind,
    bytes: &[u8],
) -> Result<T, StorageError> {
    let corrupt = |reason: String| StorageError::Corruption { column, reason };

    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(corrupt(format!("record too small: {} bytes", bytes.len())));
    }
    if bytes[0..4] != RECORD_MAGIC {
        return Err(corrupt("invalid record magic".to_string()));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != RECORD_VERSION {
        return Err(corrupt(format!("unsupported record version {}", version)));
    }

    let stored_header_checksum = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let computed_header_checksum = crc32c::crc32c(&bytes[0..16]);
    if stored_header_checksum != computed_header_checksum {
        return Err(corrupt(format!(
            "header checksum mismatch: expected {}, got {}",
            stored_header_checksum, computed_header_checksum
        )));
    }

    let found_kind = u16::from_le_bytes([bytes[6], bytes[7]]);
    if found_kind != kind as u16 {
        return Err(corrupt(format!(
            "record kind mismatch: expected {:?}, found {}",
            kind, found_kind
        )));
    }

    let body_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let body = &bytes[RECORD_HEADER_SIZE..];
    if body.len() != body_len {
        return Err(corrupt(format!(
            "body size mismatch: expected {}, got {}",
            body_len,
            body.len()
        )));
    }

    let stored_body_checksum = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    let computed_body_checksum = crc32c::crc32c(body);
    if stored_body_checksum != computed_body_checksum {
        return Err(corrupt(format!(
            "body checksum mismatch: expected {}, got {}",
            stored_body_checksum, computed_body_checksum
        )));
    }

    bincode::deserialize(body).map_err(|e| corrupt(format!("undecodable body: {}", e)))
}

/// Point lookup of a framed record.
pub fn load_record<T: DeserializeOwned>(
    snap: &dyn ReadSnapshot,
    column: Column,
    kind: RecordKind,
    key: &[u8],
) -> Result<Option<T>, StorageError> {
    match snap.get(column, key)? {
        Some(raw) => Ok(Some(decode_record(column, kind, &raw)?)),
        None => Ok(None),
    }
}

/// Decode every record in a range result.
pub fn decode_entries<T: DeserializeOwned>(
    column: Column,
    kind: RecordKind,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<Vec<T>, StorageError> {
    entries
        .iter()
        .map(|(_, raw)| decode_record(column, kind, raw))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_key_orders_numerically() {
        let mut keys: Vec<[u8; 8]> = [300u64, 2, 70_000, 1].iter().map(|v| u64_key(*v)).collect();
        keys.sort();
        let decoded: Vec<u64> = keys
            .iter()
            .map(|k| key_to_u64(Column::Logs, k).unwrap())
            .collect();
        assert_eq!(decoded, vec![1, 2, 300, 70_000]);
    }

    #[test]
    fn test_record_detects_body_corruption() {
        let mut bytes = encode_record(RecordKind::Value, &(7u64, b"abc".to_vec())).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let result: Result<(u64, Vec<u8>), _> =
            decode_record(Column::Values, RecordKind::Value, &bytes);
        match result {
            Err(StorageError::Corruption { reason, .. }) => {
                assert!(reason.contains("body checksum"));
            }
            other => panic!("Expected Corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_record_rejects_wrong_kind() {
        let bytes = encode_record(RecordKind::Checkpoint, &1u64).unwrap();
        let result: Result<u64, _> =
            decode_record(Column::Checkpoints, RecordKind::MessageEntry, &bytes);
        assert!(matches!(result, Err(StorageError::Corruption { .. })));
    }

    #[test]
    fn test_record_rejects_header_tamper() {
        let mut bytes = encode_record(RecordKind::Checkpoint, &42u64).unwrap();
        bytes[9] ^= 0x01;
        let result: Result<u64, _> =
            decode_record(Column::Checkpoints, RecordKind::Checkpoint, &bytes);
        match result {
            Err(StorageError::Corruption { reason, .. }) => {
                assert!(reason.contains("header checksum"));
            }
            other => panic!("Expected Corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_parts_is_length_delimited() {
        assert_ne!(
            hash_parts(b"d", &[b"ab", b"c"]),
            hash_parts(b"d", &[b"a", b"bc"])
        );
    }
}
