use std::fmt;
use std::io;

use crate::engine::store::Column;

/// Storage-layer failures.
///
/// Returned alongside success from every store-backed operation. Nothing in
/// this crate retries on these; the immediate caller decides.
#[derive(Debug)]
pub enum StorageError {
    /// A key that must exist was not present.
    NotFound { column: Column, key: Vec<u8> },

    /// Underlying I/O failure (image files, sync, rename).
    Io(io::Error),

    /// A persisted record failed validation (magic, version, checksum, length).
    Corruption { column: Column, reason: String },

    /// Pagination request beyond the inserted count.
    /// Every `(index, count)` query requires `index + count <= inserted`.
    OutOfRange { index: u64, count: u64, inserted: u64 },

    /// Caller supplied data that cannot be stored at this position
    /// (accumulator mismatch, sequence gap, rewrite of sequenced data).
    InvalidInput(String),

    /// Encoding or decoding of a record body failed.
    Serialization(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound { column, key } => {
                write!(f, "Key {:02x?} not found in column {:?}", key, column)
            }
            StorageError::Io(e) => write!(f, "Storage IO error: {}", e),
            StorageError::Corruption { column, reason } => {
                write!(f, "Corrupt record in column {:?}: {}", column, reason)
            }
            StorageError::OutOfRange { index, count, inserted } => {
                write!(
                    f,
                    "Requested range [{}, {}+{}) exceeds inserted count {}",
                    index, index, count, inserted
                )
            }
            StorageError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            StorageError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl StorageError {
    /// True for a missing key, which several lookups treat as "empty".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Check an `(index, count)` pagination request against an inserted count.
pub fn check_range(index: u64, count: u64, inserted: u64) -> Result<(), StorageError> {
    match index.checked_add(count) {
        Some(end) if end <= inserted => Ok(()),
        _ => Err(StorageError::OutOfRange { index, count, inserted }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range_bounds() {
        assert!(check_range(0, 0, 0).is_ok());
        assert!(check_range(0, 3, 3).is_ok());
        assert!(check_range(2, 1, 3).is_ok());
        assert!(matches!(
            check_range(2, 2, 3),
            Err(StorageError::OutOfRange { index: 2, count: 2, inserted: 3 })
        ));
        assert!(check_range(u64::MAX, 2, u64::MAX).is_err());
    }

    #[test]
    fn test_display_mentions_column() {
        let err = StorageError::Corruption {
            column: Column::Checkpoints,
            reason: "bad crc".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("Checkpoints"));
        assert!(text.contains("bad crc"));
    }
}
