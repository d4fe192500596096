//! Checkpoint Store: machine-state descriptors keyed by cumulative gas.
//!
//! A checkpoint references the machine's serialized state through the value
//! table, so saving one takes a value reference and deleting one releases it.
//! Checkpoints are written by the core loop inside the same transaction as
//! the logs, sends and sideload positions produced since the previous one.

use serde::{Deserialize, Serialize};

use crate::engine::errors::StorageError;
use crate::engine::format::{decode_record, encode_record, load_record, u64_key, Hash32, RecordKind};
use crate::engine::messages::InboxState;
use crate::engine::store::{Column, Entry, ReadSnapshot, WriteTxn};
use crate::engine::values::{delete_value, save_value, Value};

/// Output counters of a machine at some gas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineOutput {
    pub fully_processed_inbox: InboxState,
    pub gas_used: u64,
    pub log_count: u64,
    pub send_count: u64,
    /// Last block whose end the machine has passed.
    pub last_sideload: Option<u64>,
}

/// Enough to reconstruct a machine from the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStateKeys {
    pub machine_hash: Hash32,
    pub output: MachineOutput,
    /// Value-table hash of the serialized machine state.
    pub state_hash: Hash32,
}

impl MachineStateKeys {
    #[inline]
    pub fn gas_used(&self) -> u64 {
        self.output.gas_used
    }

    #[inline]
    pub fn message_count(&self) -> u64 {
        self.output.fully_processed_inbox.count
    }
}

fn decode(entry: Option<Entry>) -> Result<Option<MachineStateKeys>, StorageError> {
    entry
        .map(|(_, raw)| decode_record(Column::Checkpoints, RecordKind::Checkpoint, &raw))
        .transpose()
}

/// Persist `keys` at its gas. Saving the same machine twice at one gas is a
/// no-op; a different machine at the same gas replaces the old record.
/// Returns false for the no-op case.
pub fn save_checkpoint(txn: &mut WriteTxn, keys: &MachineStateKeys, state: &Value) -> Result<bool, StorageError> {
    if state.hash() != keys.state_hash {
        return Err(StorageError::InvalidInput(
            "checkpoint state does not match its state hash".to_string(),
        ));
    }
    let key = u64_key(keys.gas_used());
    if let Some(existing) = get_checkpoint(&*txn, keys.gas_used())? {
        if existing == *keys {
            return Ok(false);
        }
        delete_value(txn, &existing.state_hash)?;
    }
    save_value(txn, state)?;
    txn.put(Column::Checkpoints, &key, encode_record(RecordKind::Checkpoint, keys)?);
    Ok(true)
}

/// Checkpoint at exactly `gas_used`.
pub fn get_checkpoint(snap: &dyn ReadSnapshot, gas_used: u64) -> Result<Option<MachineStateKeys>, StorageError> {
    load_record(snap, Column::Checkpoints, RecordKind::Checkpoint, &u64_key(gas_used))
}

/// Nearest checkpoint at or before (`after == false`) or at or after
/// (`after == true`) `gas`.
pub fn get_checkpoint_using_gas(
    snap: &dyn ReadSnapshot,
    gas: u64,
    after: bool,
) -> Result<Option<MachineStateKeys>, StorageError> {
    if after {
        decode(snap.first_at_or_after(Column::Checkpoints, &u64_key(gas))?)
    } else {
        decode(snap.last_at_or_before(Column::Checkpoints, &u64_key(gas))?)
    }
}

pub fn latest_checkpoint(snap: &dyn ReadSnapshot) -> Result<Option<MachineStateKeys>, StorageError> {
    decode(snap.last(Column::Checkpoints)?)
}

/// Newest checkpoint that has processed at most `message_count` messages.
pub fn checkpoint_at_or_before_message(
    snap: &dyn ReadSnapshot,
    message_count: u64,
) -> Result<Option<MachineStateKeys>, StorageError> {
    let mut candidate = latest_checkpoint(snap)?;
    while let Some(keys) = candidate {
        if keys.message_count() <= message_count {
            return Ok(Some(keys));
        }
        if keys.gas_used() == 0 {
            return Ok(None);
        }
        candidate = get_checkpoint_using_gas(snap, keys.gas_used() - 1, false)?;
    }
    Ok(None)
}

fn delete_entries(txn: &mut WriteTxn, doomed: Vec<Entry>) -> Result<usize, StorageError> {
    let removed = doomed.len();
    for (key, raw) in doomed {
        let keys: MachineStateKeys = decode_record(Column::Checkpoints, RecordKind::Checkpoint, &raw)?;
        delete_value(txn, &keys.state_hash)?;
        txn.delete(Column::Checkpoints, &key);
    }
    Ok(removed)
}

/// Remove every checkpoint beyond `gas_used`.
pub fn delete_checkpoints_after(txn: &mut WriteTxn, gas_used: u64) -> Result<usize, StorageError> {
    let doomed = match gas_used.checked_add(1) {
        Some(start) => txn.range(Column::Checkpoints, &u64_key(start), None, usize::MAX)?,
        None => Vec::new(),
    };
    delete_entries(txn, doomed)
}

/// Remove checkpoints made redundant by the retention floor: everything older
/// than the newest checkpoint at or below `floor_message_index`. That
/// checkpoint and all later ones are kept.
pub fn delete_old_checkpoints(txn: &mut WriteTxn, floor_message_index: u64) -> Result<usize, StorageError> {
    let anchor = match checkpoint_at_or_before_message(&*txn, floor_message_index)? {
        Some(keys) => keys.gas_used(),
        None => return Ok(0),
    };
    let doomed = txn.range(Column::Checkpoints, &u64_key(0), Some(&u64_key(anchor)), usize::MAX)?;
    delete_entries(txn, doomed)
}

/// Remove the checkpoint at exactly `gas_used`, releasing its state value.
/// Returns false if there was none.
pub fn delete_checkpoint(txn: &mut WriteTxn, gas_used: u64) -> Result<bool, StorageError> {
    let key = u64_key(gas_used);
    match txn.get(Column::Checkpoints, &key)? {
        Some(raw) => Ok(delete_entries(txn, vec![(key.to_vec(), raw)])? == 1),
        None => Ok(false),
    }
}

/// Gas the next interval checkpoint is measured from: the latest
/// checkpoint, unless it sits closer than `interval` to its predecessor
/// (an in-progress checkpoint), in which case the predecessor.
pub fn checkpoint_anchor_gas(snap: &dyn ReadSnapshot, interval: u64) -> Result<u64, StorageError> {
    let latest = match latest_checkpoint(snap)? {
        Some(keys) => keys.gas_used(),
        None => return Ok(0),
    };
    if latest == 0 {
        return Ok(0);
    }
    match get_checkpoint_using_gas(snap, latest - 1, false)? {
        Some(previous) if latest - previous.gas_used() < interval => Ok(previous.gas_used()),
        _ => Ok(latest),
    }
}

pub fn is_checkpoints_empty(snap: &dyn ReadSnapshot) -> Result<bool, StorageError> {
    Ok(snap.last(Column::Checkpoints)?.is_none())
}

/// Gas of the latest checkpoint, zero when there is none.
pub fn max_checkpoint_gas(snap: &dyn ReadSnapshot) -> Result<u64, StorageError> {
    Ok(latest_checkpoint(snap)?.map_or(0, |keys| keys.gas_used()))
}

/// All checkpoint gas values, ascending.
pub fn checkpoint_gas_values(snap: &dyn ReadSnapshot) -> Result<Vec<u64>, StorageError> {
    Ok(decode_all(snap)?.iter().map(|keys| keys.gas_used()).collect())
}

fn decode_all(snap: &dyn ReadSnapshot) -> Result<Vec<MachineStateKeys>, StorageError> {
    snap.range(Column::Checkpoints, &u64_key(0), None, usize::MAX)?
        .iter()
        .map(|(_, raw)| decode_record(Column::Checkpoints, RecordKind::Checkpoint, raw))
        .collect()
}
