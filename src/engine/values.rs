//! Content-addressed values: the persisted refcounted value table and the
//! in-memory `ValueCache` that dedups loads by hash.
//!
//! A value's persisted refcount counts the log entries that reference it.
//! Saving a log increments it; truncating a log decrements it and deletes the
//! body at zero. A reader that resolves a log's hash to its body must therefore
//! not race a truncation, which is why log reads hold the reorg lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::errors::StorageError;
use crate::engine::format::{decode_record, encode_record, hash_bytes, Hash32, RecordKind};
use crate::engine::store::{Column, ReadSnapshot, WriteTxn};

/// Immutable content-addressed bytes.
#[derive(Clone, Debug)]
pub struct Value {
    hash: Hash32,
    bytes: Arc<[u8]>,
}

impl Value {
    pub fn new(bytes: Vec<u8>) -> Self {
        Value {
            hash: hash_bytes(&bytes),
            bytes: Arc::from(bytes),
        }
    }

    #[inline]
    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of live handles sharing the body.
    fn share_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Value {}

#[derive(Serialize, Deserialize)]
struct ValueRecord {
    refcount: u64,
    bytes: Vec<u8>,
}

fn read_record(snap: &dyn ReadSnapshot, hash: &Hash32) -> Result<Option<ValueRecord>, StorageError> {
    match snap.get(Column::Values, hash)? {
        Some(raw) => Ok(Some(decode_record(Column::Values, RecordKind::Value, &raw)?)),
        None => Ok(None),
    }
}

/// Store `value` or bump its refcount.
pub fn save_value(txn: &mut WriteTxn, value: &Value) -> Result<u64, StorageError> {
    let record = match read_record(&*txn, &value.hash)? {
        Some(mut existing) => {
            existing.refcount += 1;
            existing
        }
        None => ValueRecord {
            refcount: 1,
            bytes: value.bytes().to_vec(),
        },
    };
    txn.put(Column::Values, &value.hash, encode_record(RecordKind::Value, &record)?);
    Ok(record.refcount)
}

/// Drop one reference; the body is deleted when the count reaches zero.
/// Returns the remaining refcount.
pub fn delete_value(txn: &mut WriteTxn, hash: &Hash32) -> Result<u64, StorageError> {
    let mut record = read_record(&*txn, hash)?.ok_or_else(|| StorageError::NotFound {
        column: Column::Values,
        key: hash.to_vec(),
    })?;
    record.refcount = record.refcount.saturating_sub(1);
    if record.refcount == 0 {
        txn.delete(Column::Values, hash);
    } else {
        txn.put(Column::Values, hash, encode_record(RecordKind::Value, &record)?);
    }
    Ok(record.refcount)
}

/// Load a value body, verifying it against its hash.
pub fn get_value(snap: &dyn ReadSnapshot, hash: &Hash32) -> Result<Option<Value>, StorageError> {
    match read_record(snap, hash)? {
        Some(record) => {
            let value = Value::new(record.bytes);
            if value.hash != *hash {
                return Err(StorageError::Corruption {
                    column: Column::Values,
                    reason: "value body does not match its hash".to_string(),
                });
            }
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Current persisted refcount (zero if absent).
pub fn value_refcount(snap: &dyn ReadSnapshot, hash: &Hash32) -> Result<u64, StorageError> {
    Ok(read_record(snap, hash)?.map_or(0, |r| r.refcount))
}

// =============================================================================
// VALUE CACHE
// =============================================================================

/// Dedup cache from hash to shared value.
///
/// Entries stay while anything outside the cache still holds the body (a live
/// machine, a cached snapshot, or a log pin). `prune` drops the rest.
/// Log pins keep the values of unconfirmed logs resident for cursor delivery.
pub struct ValueCache {
    entries: HashMap<Hash32, Value>,
    pins: BTreeMap<u64, Value>,
    capacity: usize,
}

impl ValueCache {
    pub fn new(capacity: usize) -> Self {
        ValueCache {
            entries: HashMap::new(),
            pins: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pinned_count(&self) -> usize {
        self.pins.len()
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.entries.contains_key(hash)
    }

    /// Insert, returning the canonical shared handle for the hash.
    pub fn insert(&mut self, value: Value) -> Value {
        if let Some(existing) = self.entries.get(&value.hash) {
            return existing.clone();
        }
        if self.entries.len() >= self.capacity {
            self.prune();
        }
        if self.entries.len() < self.capacity {
            self.entries.insert(value.hash, value.clone());
        }
        value
    }

    /// Cached lookup, falling back to the value table.
    pub fn get_or_load(
        &mut self,
        snap: &dyn ReadSnapshot,
        hash: &Hash32,
    ) -> Result<Option<Value>, StorageError> {
        if let Some(value) = self.entries.get(hash) {
            return Ok(Some(value.clone()));
        }
        match get_value(snap, hash)? {
            Some(value) => Ok(Some(self.insert(value))),
            None => Ok(None),
        }
    }

    /// Pin the value of the log at `position`. Pins are capped at the cache
    /// capacity; past it the log is left unpinned and delivery reads it back
    /// from the value table. Returns whether the pin was taken.
    pub fn pin_log(&mut self, position: u64, value: Value) -> bool {
        if self.pins.len() >= self.capacity && !self.pins.contains_key(&position) {
            return false;
        }
        let value = self.insert(value);
        self.pins.insert(position, value);
        true
    }

    /// Drop pins for logs below `position` (confirmed by every cursor).
    pub fn release_below(&mut self, position: u64) {
        let kept = self.pins.split_off(&position);
        self.pins = kept;
    }

    /// Drop pins for logs at or above `position` (truncated by a reorg).
    pub fn release_from(&mut self, position: u64) {
        self.pins.split_off(&position);
    }

    /// Drop entries nothing outside the cache references.
    /// Returns the number of entries removed.
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, value| value.share_count() > 1);
        before - self.entries.len()
    }
}
