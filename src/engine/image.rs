use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::engine::errors::StorageError;
use crate::engine::store::{Column, Tables};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Image file magic bytes: "LIMG"
pub const IMAGE_MAGIC: [u8; 4] = [0x4C, 0x49, 0x4D, 0x47];

/// Current image format version.
pub const IMAGE_VERSION: u16 = 1;

/// Image header size in bytes.
pub const IMAGE_HEADER_SIZE: usize = 40;

// =============================================================================
// STORE IMAGE
// =============================================================================

/// Whole-store image persisted by `MemoryStore::sync`.
///
/// # Layout (40 bytes header + variable body)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("LIMG")
/// 4       2     version
/// 6       2     column_count
/// 8       8     entry_count
/// 16      8     body_size
/// 24      4     body_checksum (CRC32C)
/// 28      4     header_checksum (CRC32C of bytes 0..28)
/// 32      8     reserved (must be zero)
/// 40      var   body (bincode of per-column entry lists)
/// ```
#[derive(Clone, Debug)]
pub struct StoreImage {
    columns: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
}

fn corrupt(reason: String) -> StorageError {
    StorageError::Corruption {
        column: Column::State,
        reason: format!("store image: {}", reason),
    }
}

impl StoreImage {
    pub fn from_tables(tables: &Tables) -> Self {
        StoreImage {
            columns: tables
                .columns
                .iter()
                .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .collect(),
        }
    }

    pub fn into_tables(self) -> Tables {
        let mut tables = Tables::new();
        for (slot, entries) in tables.columns.iter_mut().zip(self.columns) {
            *slot = entries.into_iter().collect::<BTreeMap<_, _>>();
        }
        tables
    }

    fn entry_count(&self) -> u64 {
        self.columns.iter().map(|c| c.len() as u64).sum()
    }

    fn serialize_header(&self, body: &[u8]) -> [u8; IMAGE_HEADER_SIZE] {
        let mut header = [0u8; IMAGE_HEADER_SIZE];
        header[0..4].copy_from_slice(&IMAGE_MAGIC);
        header[4..6].copy_from_slice(&IMAGE_VERSION.to_le_bytes());
        header[6..8].copy_from_slice(&(self.columns.len() as u16).to_le_bytes());
        header[8..16].copy_from_slice(&self.entry_count().to_le_bytes());
        header[16..24].copy_from_slice(&(body.len() as u64).to_le_bytes());
        header[24..28].copy_from_slice(&crc32c::crc32c(body).to_le_bytes());
        let header_checksum = crc32c::crc32c(&header[0..28]);
        header[28..32].copy_from_slice(&header_checksum.to_le_bytes());
        header
    }

    /// Save atomically: write temp → fsync → rename.
    pub fn save_to_file(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let body = bincode::serialize(&self.columns)?;
        let temp_path = path.with_extension("img.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&self.serialize_header(&body))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load with strict validation; any mismatch is `Corruption`.
    pub fn load_from_file(path: &Path) -> Result<Self, StorageError> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < IMAGE_HEADER_SIZE {
            return Err(corrupt("file too small for header".to_string()));
        }
        let header = &bytes[..IMAGE_HEADER_SIZE];
        if header[0..4] != IMAGE_MAGIC {
            return Err(corrupt("invalid magic".to_string()));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != IMAGE_VERSION {
            return Err(corrupt(format!("unsupported version {}", version)));
        }

        let stored_header_checksum = u32::from_le_bytes([header[28], header[29], header[30], header[31]]);
        let computed_header_checksum = crc32c::crc32c(&header[0..28]);
        if stored_header_checksum != computed_header_checksum {
            return Err(corrupt(format!(
                "header checksum mismatch: expected {}, got {}",
                stored_header_checksum, computed_header_checksum
            )));
        }

        let column_count = u16::from_le_bytes([header[6], header[7]]) as usize;
        if column_count != Column::COUNT {
            return Err(corrupt(format!(
                "expected {} columns, found {}",
                Column::COUNT,
                column_count
            )));
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&header[8..16]);
        let entry_count = u64::from_le_bytes(word);
        word.copy_from_slice(&header[16..24]);
        let body_size = u64::from_le_bytes(word);

        let body = &bytes[IMAGE_HEADER_SIZE..];
        if body.len() as u64 != body_size {
            return Err(corrupt(format!(
                "body size mismatch: expected {}, got {}",
                body_size,
                body.len()
            )));
        }

        let stored_body_checksum = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);
        let computed_body_checksum = crc32c::crc32c(body);
        if stored_body_checksum != computed_body_checksum {
            return Err(corrupt(format!(
                "body checksum mismatch: expected {}, got {}",
                stored_body_checksum, computed_body_checksum
            )));
        }

        let columns: Vec<Vec<(Vec<u8>, Vec<u8>)>> =
            bincode::deserialize(body).map_err(|e| corrupt(format!("undecodable body: {}", e)))?;
        let image = StoreImage { columns };
        if image.columns.len() != Column::COUNT || image.entry_count() != entry_count {
            return Err(corrupt("entry count mismatch".to_string()));
        }
        Ok(image)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::format::u64_key;
    use crate::engine::store::{KvStore, MemoryStore, ReadSnapshot};

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.img");

        {
            let store = MemoryStore::open(&path).unwrap();
            let mut txn = store.begin();
            txn.put(Column::Logs, &u64_key(0), b"first".to_vec());
            txn.put(Column::Checkpoints, &u64_key(500), b"cp".to_vec());
            store.commit(txn.into_batch()).unwrap();
            store.sync().unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        let snap = reopened.snapshot();
        assert_eq!(snap.get(Column::Logs, &u64_key(0)).unwrap(), Some(b"first".to_vec()));
        assert_eq!(
            snap.get(Column::Checkpoints, &u64_key(500)).unwrap(),
            Some(b"cp".to_vec())
        );
    }

    #[test]
    fn test_unsynced_commits_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.img");

        {
            let store = MemoryStore::open(&path).unwrap();
            let mut txn = store.begin();
            txn.put(Column::Sends, &u64_key(0), b"synced".to_vec());
            store.commit(txn.into_batch()).unwrap();
            store.sync().unwrap();

            let mut txn = store.begin();
            txn.put(Column::Sends, &u64_key(1), b"volatile".to_vec());
            store.commit(txn.into_batch()).unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        let snap = reopened.snapshot();
        assert!(snap.get(Column::Sends, &u64_key(0)).unwrap().is_some());
        assert!(snap.get(Column::Sends, &u64_key(1)).unwrap().is_none());
    }

    #[test]
    fn test_image_corrupted_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.img");

        let mut tables = Tables::new();
        tables.columns[Column::Values.index()].insert(b"k".to_vec(), b"value bytes".to_vec());
        StoreImage::from_tables(&tables).save_to_file(&path).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        match StoreImage::load_from_file(&path) {
            Err(StorageError::Corruption { reason, .. }) => {
                assert!(reason.contains("body checksum"));
            }
            other => panic!("Expected Corruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_image_invalid_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.img");
        fs::write(&path, [0u8; IMAGE_HEADER_SIZE]).unwrap();

        let result = StoreImage::load_from_file(&path);
        assert!(matches!(result, Err(StorageError::Corruption { .. })));
    }

    #[test]
    fn test_image_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.img");
        StoreImage::from_tables(&Tables::new()).save_to_file(&path).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("img.tmp").exists());
    }
}
