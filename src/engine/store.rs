//! Ordered, transactional byte-key/byte-value store.
//!
//! # Visibility Contract
//!
//! - Readers obtain a `ReadSnapshot` and see exactly the state of the last
//!   commit before the snapshot was taken, for as long as they hold it.
//! - A `WriteTxn` reads its own pending writes layered over its base snapshot.
//! - `KvStore::commit` applies a whole `WriteBatch` atomically: a reader sees
//!   all of it or none of it.
//!
//! # Thread Safety
//!
//! The store itself is shared (`Send + Sync`). Exactly one thread commits in
//! this crate (the core loop); everyone else only takes snapshots.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::engine::errors::StorageError;
use crate::engine::image::StoreImage;

/// Logical column families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Column {
    /// Counters and singleton metadata.
    State,
    /// Checkpoint records keyed by gas.
    Checkpoints,
    /// One entry per sequence number.
    MessageEntries,
    /// Sequencer batch items keyed by last sequence number.
    SequencerBatchItems,
    /// Delayed messages keyed by delayed sequence number.
    DelayedMessages,
    /// Log value hashes keyed by log index.
    Logs,
    /// Send payloads keyed by send index.
    Sends,
    /// Refcounted value bodies keyed by hash.
    Values,
    /// Gas position keyed by block number.
    Sideloads,
    /// Confirmed position keyed by logs cursor index.
    CursorMetadata,
}

impl Column {
    pub const COUNT: usize = 10;

    pub const ALL: [Column; Column::COUNT] = [
        Column::State,
        Column::Checkpoints,
        Column::MessageEntries,
        Column::SequencerBatchItems,
        Column::DelayedMessages,
        Column::Logs,
        Column::Sends,
        Column::Values,
        Column::Sideloads,
        Column::CursorMetadata,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The column ordered after this one, if any.
    fn next(self) -> Option<Column> {
        Column::ALL.get(self.index() + 1).copied()
    }
}

/// A key/value pair as returned by range reads.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Consistent point-in-time read view.
pub trait ReadSnapshot: Send + Sync {
    /// Point lookup.
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Ascending entries with `start <= key < end` (unbounded above if `end`
    /// is None), at most `limit` of them.
    fn range(
        &self,
        column: Column,
        start: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError>;

    /// Greatest entry with `key <= bound`.
    fn last_at_or_before(&self, column: Column, bound: &[u8]) -> Result<Option<Entry>, StorageError>;

    /// Smallest entry with `key >= bound`.
    fn first_at_or_after(&self, column: Column, bound: &[u8]) -> Result<Option<Entry>, StorageError> {
        Ok(self.range(column, bound, None, 1)?.into_iter().next())
    }

    /// Greatest entry in the column.
    fn last(&self, column: Column) -> Result<Option<Entry>, StorageError>;
}

/// Ordered transactional store.
pub trait KvStore: Send + Sync + 'static {
    /// Take a consistent read snapshot.
    fn snapshot(&self) -> Arc<dyn ReadSnapshot>;

    /// Atomically apply a batch.
    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// Make everything committed so far durable. No-op for volatile stores.
    fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Begin a read-write transaction over a fresh snapshot.
    fn begin(&self) -> WriteTxn {
        WriteTxn::new(self.snapshot())
    }
}

/// Pending writes: `None` deletes the key.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Read-write transaction: pending writes layered over a base snapshot.
pub struct WriteTxn {
    base: Arc<dyn ReadSnapshot>,
    pending: WriteBatch,
}

impl WriteTxn {
    pub fn new(base: Arc<dyn ReadSnapshot>) -> Self {
        WriteTxn {
            base,
            pending: WriteBatch::default(),
        }
    }

    pub fn put(&mut self, column: Column, key: &[u8], value: Vec<u8>) {
        self.pending.ops.insert((column, key.to_vec()), Some(value));
    }

    pub fn delete(&mut self, column: Column, key: &[u8]) {
        self.pending.ops.insert((column, key.to_vec()), None);
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Finish the transaction, yielding the batch to commit.
    pub fn into_batch(self) -> WriteBatch {
        self.pending
    }

    fn pending_range(
        &self,
        column: Column,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> impl Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        let lower = Bound::Included((column, start.to_vec()));
        let upper = match end {
            Some(e) => Bound::Excluded((column, e.to_vec())),
            None => Bound::Unbounded,
        };
        self.pending
            .ops
            .range((lower, upper))
            .take_while(move |((c, _), _)| *c == column)
            .map(|((_, k), v)| (k, v))
    }

    /// Merge base entries in a range with pending writes.
    fn merged(
        &self,
        column: Column,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
        if end.map_or(false, |e| e <= start) {
            return Ok(BTreeMap::new());
        }
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .base
            .range(column, start, end, usize::MAX)?
            .into_iter()
            .collect();
        for (key, value) in self.pending_range(column, start, end) {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged)
    }
}

impl ReadSnapshot for WriteTxn {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        match self.pending.ops.get(&(column, key.to_vec())) {
            Some(value) => Ok(value.clone()),
            None => self.base.get(column, key),
        }
    }

    fn range(
        &self,
        column: Column,
        start: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        Ok(self
            .merged(column, start, end)?
            .into_iter()
            .take(limit)
            .collect())
    }

    fn last_at_or_before(&self, column: Column, bound: &[u8]) -> Result<Option<Entry>, StorageError> {
        let base = self.base.last_at_or_before(column, bound)?;
        let base_candidate = self.skip_deleted(column, base)?;
        let pending_candidate = self.last_pending_put(column, Bound::Included((column, bound.to_vec())));
        Ok(newer(base_candidate, pending_candidate))
    }

    fn last(&self, column: Column) -> Result<Option<Entry>, StorageError> {
        let base = self.base.last(column)?;
        let base_candidate = self.skip_deleted(column, base)?;
        let upper = match column.next() {
            Some(next) => Bound::Excluded((next, Vec::new())),
            None => Bound::Unbounded,
        };
        let pending_candidate = self.last_pending_put(column, upper);
        Ok(newer(base_candidate, pending_candidate))
    }
}

impl WriteTxn {
    /// Walk a base entry backwards past keys this transaction deleted,
    /// resolving the survivor against pending puts.
    fn skip_deleted(&self, column: Column, mut cursor: Option<Entry>) -> Result<Option<Entry>, StorageError> {
        while let Some((key, _)) = &cursor {
            match self.pending.ops.get(&(column, key.clone())) {
                Some(None) => {
                    cursor = match predecessor(key) {
                        Some(prev) => self.base.last_at_or_before(column, &prev)?,
                        None => None,
                    };
                }
                _ => break,
            }
        }
        Ok(match cursor {
            Some((key, base_value)) => match self.pending.ops.get(&(column, key.clone())) {
                Some(Some(v)) => Some((key, v.clone())),
                _ => Some((key, base_value)),
            },
            None => None,
        })
    }

    /// Greatest pending put in `column` below `upper`.
    fn last_pending_put(&self, column: Column, upper: Bound<(Column, Vec<u8>)>) -> Option<Entry> {
        self.pending
            .ops
            .range((Bound::Included((column, Vec::new())), upper))
            .rev()
            .take_while(|((c, _), _)| *c == column)
            .find_map(|((_, k), v)| v.as_ref().map(|v| (k.clone(), v.clone())))
    }
}

fn newer(base: Option<Entry>, pending: Option<Entry>) -> Option<Entry> {
    match (base, pending) {
        (Some(b), Some(p)) => Some(if p.0 >= b.0 { p } else { b }),
        (b, p) => b.or(p),
    }
}

/// Greatest key strictly below `key`, assuming all keys in the column have
/// the same length (or are prefixes of it when `key` ends in a zero byte).
fn predecessor(key: &[u8]) -> Option<Vec<u8>> {
    let mut out = key.to_vec();
    match out.last_mut() {
        None => None,
        Some(0) => {
            out.pop();
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        Some(b) => {
            *b -= 1;
            Some(out)
        }
    }
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

/// One ordered map per column.
#[derive(Clone, Debug)]
pub struct Tables {
    pub(crate) columns: Vec<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Tables {
    pub fn new() -> Self {
        Tables {
            columns: vec![BTreeMap::new(); Column::COUNT],
        }
    }

    #[inline]
    fn column(&self, column: Column) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.columns[column.index()]
    }

    /// Total number of keys across columns.
    pub fn entry_count(&self) -> usize {
        self.columns.iter().map(|c| c.len()).sum()
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a `MemoryStore`: an immutable handle on the committed tables.
pub struct MemorySnapshot {
    tables: Arc<Tables>,
}

impl ReadSnapshot for MemorySnapshot {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tables.column(column).get(key).cloned())
    }

    fn range(
        &self,
        column: Column,
        start: &[u8],
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        if end.map_or(false, |e| e <= start) {
            return Ok(Vec::new());
        }
        let upper = match end {
            Some(e) => Bound::Excluded(e),
            None => Bound::Unbounded,
        };
        Ok(self
            .tables
            .column(column)
            .range::<[u8], _>((Bound::Included(start), upper))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last_at_or_before(&self, column: Column, bound: &[u8]) -> Result<Option<Entry>, StorageError> {
        Ok(self
            .tables
            .column(column)
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(bound)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn last(&self, column: Column) -> Result<Option<Entry>, StorageError> {
        Ok(self
            .tables
            .column(column)
            .iter()
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

/// Reference backend: copy-on-write ordered maps, optionally backed by an
/// on-disk image written on `sync`.
pub struct MemoryStore {
    tables: RwLock<Arc<Tables>>,
    image_path: Option<PathBuf>,
    /// Serializes image writers.
    sync_lock: Mutex<()>,
}

impl MemoryStore {
    /// Volatile store.
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(Arc::new(Tables::new())),
            image_path: None,
            sync_lock: Mutex::new(()),
        }
    }

    /// Store persisted to `path` on every `sync`. Loads the image if present.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let tables = if path.exists() {
            StoreImage::load_from_file(path)?.into_tables()
        } else {
            Tables::new()
        };
        Ok(MemoryStore {
            tables: RwLock::new(Arc::new(tables)),
            image_path: Some(path.to_path_buf()),
            sync_lock: Mutex::new(()),
        })
    }

    /// Path of the backing image, if any.
    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn snapshot(&self) -> Arc<dyn ReadSnapshot> {
        Arc::new(MemorySnapshot {
            tables: self.tables.read().clone(),
        })
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut guard = self.tables.write();
        // Live snapshots keep the previous tables; mutate a private copy.
        let tables = Arc::make_mut(&mut guard);
        for ((column, key), value) in batch.ops {
            let map = &mut tables.columns[column.index()];
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        let path = match &self.image_path {
            Some(p) => p,
            None => return Ok(()),
        };
        let _guard = self.sync_lock.lock();
        let tables = self.tables.read().clone();
        StoreImage::from_tables(&tables).save_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::format::u64_key;

    fn put_u64(txn: &mut WriteTxn, column: Column, k: u64, v: &[u8]) {
        txn.put(column, &u64_key(k), v.to_vec());
    }

    #[test]
    fn test_snapshot_isolated_from_later_commit() {
        let store = MemoryStore::new();
        let mut txn = store.begin();
        put_u64(&mut txn, Column::Logs, 1, b"a");
        store.commit(txn.into_batch()).unwrap();

        let before = store.snapshot();

        let mut txn = store.begin();
        put_u64(&mut txn, Column::Logs, 2, b"b");
        txn.delete(Column::Logs, &u64_key(1));
        store.commit(txn.into_batch()).unwrap();

        assert_eq!(before.get(Column::Logs, &u64_key(1)).unwrap(), Some(b"a".to_vec()));
        assert_eq!(before.get(Column::Logs, &u64_key(2)).unwrap(), None);

        let after = store.snapshot();
        assert_eq!(after.get(Column::Logs, &u64_key(1)).unwrap(), None);
        assert_eq!(after.get(Column::Logs, &u64_key(2)).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_txn_reads_own_writes() {
        let store = MemoryStore::new();
        let mut txn = store.begin();
        put_u64(&mut txn, Column::Sends, 5, b"x");
        put_u64(&mut txn, Column::Sends, 9, b"y");
        store.commit(txn.into_batch()).unwrap();

        let mut txn = store.begin();
        txn.delete(Column::Sends, &u64_key(9));
        put_u64(&mut txn, Column::Sends, 7, b"z");

        assert_eq!(txn.get(Column::Sends, &u64_key(9)).unwrap(), None);
        let last = txn.last(Column::Sends).unwrap().unwrap();
        assert_eq!(last.0, u64_key(7).to_vec());

        let at_or_before = txn
            .last_at_or_before(Column::Sends, &u64_key(100))
            .unwrap()
            .unwrap();
        assert_eq!(at_or_before.1, b"z".to_vec());

        let range = txn.range(Column::Sends, &u64_key(0), None, 10).unwrap();
        let keys: Vec<Vec<u8>> = range.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![u64_key(5).to_vec(), u64_key(7).to_vec()]);
    }

    #[test]
    fn test_txn_last_at_or_before_skips_deleted_base_keys() {
        let store = MemoryStore::new();
        let mut txn = store.begin();
        for k in [10u64, 20, 30] {
            put_u64(&mut txn, Column::Checkpoints, k, &k.to_le_bytes());
        }
        store.commit(txn.into_batch()).unwrap();

        let mut txn = store.begin();
        txn.delete(Column::Checkpoints, &u64_key(30));
        txn.delete(Column::Checkpoints, &u64_key(20));
        let found = txn
            .last_at_or_before(Column::Checkpoints, &u64_key(35))
            .unwrap()
            .unwrap();
        assert_eq!(found.0, u64_key(10).to_vec());
    }

    #[test]
    fn test_txn_last_merges_pending_writes() {
        let store = MemoryStore::new();
        let mut txn = store.begin();
        for k in 1..=5u64 {
            put_u64(&mut txn, Column::Logs, k, b"base");
        }
        put_u64(&mut txn, Column::Sends, 50, b"other column");
        store.commit(txn.into_batch()).unwrap();

        let mut txn = store.begin();
        for k in 3..=5u64 {
            txn.delete(Column::Logs, &u64_key(k));
        }
        put_u64(&mut txn, Column::Values, 99, b"later column");
        put_u64(&mut txn, Column::Logs, 2, b"rewritten");
        assert_eq!(
            txn.last(Column::Logs).unwrap(),
            Some((u64_key(2).to_vec(), b"rewritten".to_vec()))
        );

        put_u64(&mut txn, Column::Logs, 4, b"pending");
        assert_eq!(txn.last(Column::Logs).unwrap().unwrap().0, u64_key(4).to_vec());
        assert_eq!(txn.last(Column::Sends).unwrap().unwrap().0, u64_key(50).to_vec());

        txn.delete(Column::Logs, &u64_key(1));
        txn.delete(Column::Logs, &u64_key(2));
        txn.delete(Column::Logs, &u64_key(4));
        assert!(txn.last(Column::Logs).unwrap().is_none());
    }

    #[test]
    fn test_columns_are_independent() {
        let store = MemoryStore::new();
        let mut txn = store.begin();
        put_u64(&mut txn, Column::Logs, 1, b"log");
        put_u64(&mut txn, Column::Sends, 1, b"send");
        store.commit(txn.into_batch()).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.last(Column::Logs).unwrap().unwrap().1, b"log".to_vec());
        assert_eq!(snap.last(Column::Sends).unwrap().unwrap().1, b"send".to_vec());
        assert!(snap.last(Column::Values).unwrap().is_none());
    }

    #[test]
    fn test_predecessor() {
        assert_eq!(predecessor(&[0, 2]), Some(vec![0, 1]));
        assert_eq!(predecessor(&[1, 0]), Some(vec![1]));
        assert_eq!(predecessor(&[0]), None);
    }
}
