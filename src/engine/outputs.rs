//! Machine output tables: logs, sends, sideload positions and logs-cursor
//! metadata.
//!
//! Logs are stored as value hashes; the bodies live in the refcounted value
//! table. Sends are stored inline. Both are append-only and truncated only
//! from the tail, so the inserted count is always one past the last key.

use crate::engine::errors::{check_range, StorageError};
use crate::engine::format::{key_to_u64, u64_key, value_to_u64, Hash32};
use crate::engine::store::{Column, ReadSnapshot, WriteTxn};
use crate::engine::values::{delete_value, save_value, Value, ValueCache};

/// State-column key of the checkpoint retention floor.
const RETENTION_FLOOR_KEY: &[u8] = b"checkpoint_retention_floor";

fn inserted_count(snap: &dyn ReadSnapshot, column: Column) -> Result<u64, StorageError> {
    match snap.last(column)? {
        Some((key, _)) => Ok(key_to_u64(column, &key)? + 1),
        None => Ok(0),
    }
}

fn mismatch(what: &str, start: u64, inserted: u64) -> StorageError {
    StorageError::InvalidInput(format!(
        "{} appended at {} but {} are inserted",
        what, start, inserted
    ))
}

// =============================================================================
// LOGS
// =============================================================================

pub fn log_inserted_count(snap: &dyn ReadSnapshot) -> Result<u64, StorageError> {
    inserted_count(snap, Column::Logs)
}

/// Append logs starting at `start`, which must equal the inserted count.
/// Returns the new count.
pub fn save_logs(txn: &mut WriteTxn, start: u64, logs: &[Value]) -> Result<u64, StorageError> {
    let inserted = log_inserted_count(&*txn)?;
    if start != inserted {
        return Err(mismatch("logs", start, inserted));
    }
    let mut index = start;
    for value in logs {
        save_value(txn, value)?;
        txn.put(Column::Logs, &u64_key(index), value.hash().to_vec());
        index += 1;
    }
    Ok(index)
}

pub fn get_log_hashes(snap: &dyn ReadSnapshot, index: u64, count: u64) -> Result<Vec<Hash32>, StorageError> {
    check_range(index, count, log_inserted_count(snap)?)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    snap.range(Column::Logs, &u64_key(index), Some(&u64_key(index + count)), count as usize)?
        .into_iter()
        .map(|(_, raw)| {
            raw.as_slice().try_into().map_err(|_| StorageError::Corruption {
                column: Column::Logs,
                reason: format!("expected 32-byte hash, found {} bytes", raw.len()),
            })
        })
        .collect()
}

/// Logs `[index, index + count)` resolved through the value cache.
pub fn get_logs(
    snap: &dyn ReadSnapshot,
    index: u64,
    count: u64,
    cache: &mut ValueCache,
) -> Result<Vec<Value>, StorageError> {
    let hashes = get_log_hashes(snap, index, count)?;
    let mut logs = Vec::with_capacity(hashes.len());
    for hash in hashes {
        let value = cache.get_or_load(snap, &hash)?.ok_or_else(|| StorageError::NotFound {
            column: Column::Values,
            key: hash.to_vec(),
        })?;
        logs.push(value);
    }
    Ok(logs)
}

/// Remove logs at or after `index`, releasing their value references.
/// Returns how many were removed.
pub fn delete_logs_starting_at(txn: &mut WriteTxn, index: u64) -> Result<u64, StorageError> {
    let doomed = txn.range(Column::Logs, &u64_key(index), None, usize::MAX)?;
    let removed = doomed.len() as u64;
    for (key, raw) in doomed {
        let hash: Hash32 = raw.as_slice().try_into().map_err(|_| StorageError::Corruption {
            column: Column::Logs,
            reason: format!("expected 32-byte hash, found {} bytes", raw.len()),
        })?;
        delete_value(txn, &hash)?;
        txn.delete(Column::Logs, &key);
    }
    Ok(removed)
}

// =============================================================================
// SENDS
// =============================================================================

pub fn send_inserted_count(snap: &dyn ReadSnapshot) -> Result<u64, StorageError> {
    inserted_count(snap, Column::Sends)
}

pub fn save_sends(txn: &mut WriteTxn, start: u64, sends: &[Vec<u8>]) -> Result<u64, StorageError> {
    let inserted = send_inserted_count(&*txn)?;
    if start != inserted {
        return Err(mismatch("sends", start, inserted));
    }
    let mut index = start;
    for send in sends {
        txn.put(Column::Sends, &u64_key(index), send.clone());
        index += 1;
    }
    Ok(index)
}

pub fn get_sends(snap: &dyn ReadSnapshot, index: u64, count: u64) -> Result<Vec<Vec<u8>>, StorageError> {
    check_range(index, count, send_inserted_count(snap)?)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    Ok(snap
        .range(Column::Sends, &u64_key(index), Some(&u64_key(index + count)), count as usize)?
        .into_iter()
        .map(|(_, send)| send)
        .collect())
}

pub fn delete_sends_starting_at(txn: &mut WriteTxn, index: u64) -> Result<u64, StorageError> {
    let doomed = txn.range(Column::Sends, &u64_key(index), None, usize::MAX)?;
    let removed = doomed.len() as u64;
    for (key, _) in doomed {
        txn.delete(Column::Sends, &key);
    }
    Ok(removed)
}

// =============================================================================
// SIDELOADS
// =============================================================================

/// Record that the machine reached the end of `block_number` at `gas_used`.
pub fn save_sideload_position(txn: &mut WriteTxn, block_number: u64, gas_used: u64) {
    txn.put(Column::Sideloads, &u64_key(block_number), gas_used.to_le_bytes().to_vec());
}

/// Gas at the end of the latest recorded block at or before `block_number`.
pub fn get_sideload_position(
    snap: &dyn ReadSnapshot,
    block_number: u64,
) -> Result<Option<(u64, u64)>, StorageError> {
    match snap.last_at_or_before(Column::Sideloads, &u64_key(block_number))? {
        Some((key, raw)) => Ok(Some((
            key_to_u64(Column::Sideloads, &key)?,
            value_to_u64(Column::Sideloads, &raw)?,
        ))),
        None => Ok(None),
    }
}

/// Remove sideload positions recorded beyond `gas_used`.
pub fn delete_sideloads_after_gas(txn: &mut WriteTxn, gas_used: u64) -> Result<u64, StorageError> {
    // Positions grow with block number, so walk back from the newest block.
    let mut removed = 0;
    let mut cursor = txn.last(Column::Sideloads)?;
    while let Some((key, raw)) = cursor {
        if value_to_u64(Column::Sideloads, &raw)? <= gas_used {
            break;
        }
        txn.delete(Column::Sideloads, &key);
        removed += 1;
        cursor = match key_to_u64(Column::Sideloads, &key)?.checked_sub(1) {
            Some(prev) => txn.last_at_or_before(Column::Sideloads, &u64_key(prev))?,
            None => None,
        };
    }
    Ok(removed)
}

// =============================================================================
// CURSOR METADATA AND RETENTION
// =============================================================================

pub fn save_cursor_position(txn: &mut WriteTxn, cursor_index: usize, position: u64) {
    txn.put(
        Column::CursorMetadata,
        &u64_key(cursor_index as u64),
        position.to_le_bytes().to_vec(),
    );
}

/// Confirmed position of a logs cursor (zero if never confirmed).
pub fn get_cursor_position(snap: &dyn ReadSnapshot, cursor_index: usize) -> Result<u64, StorageError> {
    match snap.get(Column::CursorMetadata, &u64_key(cursor_index as u64))? {
        Some(raw) => value_to_u64(Column::CursorMetadata, &raw),
        None => Ok(0),
    }
}

pub fn save_retention_floor(txn: &mut WriteTxn, message_index: u64) {
    txn.put(Column::State, RETENTION_FLOOR_KEY, message_index.to_le_bytes().to_vec());
}

pub fn get_retention_floor(snap: &dyn ReadSnapshot) -> Result<u64, StorageError> {
    match snap.get(Column::State, RETENTION_FLOOR_KEY)? {
        Some(raw) => value_to_u64(Column::State, &raw),
        None => Ok(0),
    }
}
