//! Inbox tables: message entries, sequencer batch items and delayed messages.
//!
//! # Layout
//!
//! - `SequencerBatchItems`: keyed by the item's last sequence number. Items are
//!   contiguous: an item covers `previous.last_sequence_number + 1 ..=
//!   last_sequence_number` (from zero for the first item).
//! - `MessageEntries`: one entry per sequence number, carrying the accumulator
//!   of the item that sequenced it. The entry count is the inbox length.
//! - `DelayedMessages`: keyed by delayed sequence number. Delayed messages may
//!   be stored before an item sequences them.
//!
//! Accumulators are taken as given. Ingestion only checks that the batch
//! attaches at the current inbox accumulator and that sequence numbers are
//! contiguous.

use serde::{Deserialize, Serialize};

use crate::engine::errors::{check_range, StorageError};
use crate::engine::format::{
    decode_entries, decode_record, encode_record, hash_bytes, hash_parts, key_to_u64, load_record,
    u64_key, Hash32, RecordKind, ZERO_HASH,
};
use crate::engine::store::{Column, Entry, ReadSnapshot, WriteTxn};

const SEQUENCER_ITEM_DOMAIN: &[u8] = b"ledgercore.sequencer-item";
const DELAYED_ITEM_DOMAIN: &[u8] = b"ledgercore.delayed-item";
const DELAYED_MESSAGE_DOMAIN: &[u8] = b"ledgercore.delayed-message";

// =============================================================================
// TYPES
// =============================================================================

/// Payload carried by a sequencer item or a delayed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub block_number: u64,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

impl InboxMessage {
    pub fn new(block_number: u64, timestamp: u64, data: impl Into<Vec<u8>>) -> Self {
        InboxMessage {
            block_number,
            timestamp,
            data: data.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        bincode::deserialize(bytes)
            .map_err(|e| StorageError::InvalidInput(format!("undecodable inbox message: {}", e)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerBatchItem {
    pub last_sequence_number: u64,
    pub accumulator: Hash32,
    pub total_delayed_count: u64,
    /// Encoded `InboxMessage`; `None` sequences delayed messages instead.
    pub sequencer_message: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedMessage {
    pub delayed_sequence_number: u64,
    pub delayed_accumulator: Hash32,
    /// Encoded `InboxMessage`.
    pub message: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    Sequencer,
    Delayed(u64),
}

/// Persisted per-sequence-number record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub sequence_number: u64,
    pub accumulator: Hash32,
    pub block_number: u64,
    pub timestamp: u64,
    pub source: MessageSource,
    pub message: Vec<u8>,
}

/// Message as fed to a machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineMessage {
    pub sequence_number: u64,
    pub accumulator: Hash32,
    pub block_number: u64,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// Messages fully processed and the accumulator after the last of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxState {
    pub count: u64,
    pub accumulator: Hash32,
}

impl InboxState {
    pub fn after(message: &MachineMessage) -> Self {
        InboxState {
            count: message.sequence_number + 1,
            accumulator: message.accumulator,
        }
    }
}

/// One ingestion request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageBatch {
    /// Inbox accumulator the first new item attaches to.
    pub previous_inbox_acc: Hash32,
    pub sequencer_batch_items: Vec<SequencerBatchItem>,
    pub delayed_messages: Vec<DelayedMessage>,
    /// Truncate to the last item boundary at or below this count first.
    pub reorg_batch_items: Option<u64>,
}

/// Result of `add_messages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    pub entry_count: u64,
    /// Set when existing entries were truncated; the new count before appending.
    pub rewound_to: Option<u64>,
}

// =============================================================================
// ACCUMULATORS
// =============================================================================

pub fn sequencer_item_accumulator(previous: &Hash32, sequence_number: u64, message: &[u8]) -> Hash32 {
    hash_parts(
        SEQUENCER_ITEM_DOMAIN,
        &[previous, &sequence_number.to_be_bytes(), &hash_bytes(message)],
    )
}

pub fn delayed_item_accumulator(
    previous: &Hash32,
    first_sequence_number: u64,
    total_delayed_count: u64,
    delayed_accumulator: &Hash32,
) -> Hash32 {
    hash_parts(
        DELAYED_ITEM_DOMAIN,
        &[
            previous,
            &first_sequence_number.to_be_bytes(),
            &total_delayed_count.to_be_bytes(),
            delayed_accumulator,
        ],
    )
}

pub fn delayed_message_accumulator(previous: &Hash32, delayed_sequence_number: u64, message: &[u8]) -> Hash32 {
    delayed_accumulator_from_hash(previous, delayed_sequence_number, &hash_bytes(message))
}

fn delayed_accumulator_from_hash(previous: &Hash32, delayed_sequence_number: u64, message_hash: &Hash32) -> Hash32 {
    hash_parts(
        DELAYED_MESSAGE_DOMAIN,
        &[previous, &delayed_sequence_number.to_be_bytes(), message_hash],
    )
}

// =============================================================================
// COUNTS AND POINT LOOKUPS
// =============================================================================

fn next_key_after_last(snap: &dyn ReadSnapshot, column: Column) -> Result<u64, StorageError> {
    match snap.last(column)? {
        Some((key, _)) => Ok(key_to_u64(column, &key)? + 1),
        None => Ok(0),
    }
}

pub fn message_entry_inserted_count(snap: &dyn ReadSnapshot) -> Result<u64, StorageError> {
    next_key_after_last(snap, Column::MessageEntries)
}

pub fn delayed_message_inserted_count(snap: &dyn ReadSnapshot) -> Result<u64, StorageError> {
    next_key_after_last(snap, Column::DelayedMessages)
}

fn decode_item(entry: Option<Entry>) -> Result<Option<SequencerBatchItem>, StorageError> {
    entry
        .map(|(_, raw)| decode_record(Column::SequencerBatchItems, RecordKind::SequencerBatchItem, &raw))
        .transpose()
}

fn last_batch_item(snap: &dyn ReadSnapshot) -> Result<Option<SequencerBatchItem>, StorageError> {
    decode_item(snap.last(Column::SequencerBatchItems)?)
}

/// Delayed messages consumed by sequenced items.
pub fn total_delayed_messages_sequenced(snap: &dyn ReadSnapshot) -> Result<u64, StorageError> {
    Ok(last_batch_item(snap)?.map_or(0, |item| item.total_delayed_count))
}

pub fn get_message_entry(snap: &dyn ReadSnapshot, sequence_number: u64) -> Result<MessageEntry, StorageError> {
    load_record(snap, Column::MessageEntries, RecordKind::MessageEntry, &u64_key(sequence_number))?
        .ok_or_else(|| StorageError::NotFound {
            column: Column::MessageEntries,
            key: u64_key(sequence_number).to_vec(),
        })
}

fn get_delayed_message(snap: &dyn ReadSnapshot, index: u64) -> Result<DelayedMessage, StorageError> {
    load_record(snap, Column::DelayedMessages, RecordKind::DelayedMessage, &u64_key(index))?
        .ok_or_else(|| StorageError::NotFound {
            column: Column::DelayedMessages,
            key: u64_key(index).to_vec(),
        })
}

/// Item whose range contains `sequence_number`.
fn batch_item_covering(
    snap: &dyn ReadSnapshot,
    sequence_number: u64,
) -> Result<Option<SequencerBatchItem>, StorageError> {
    decode_item(snap.first_at_or_after(Column::SequencerBatchItems, &u64_key(sequence_number))?)
}

/// Item immediately preceding the one that ends at `last_sequence_number`.
fn batch_item_before(
    snap: &dyn ReadSnapshot,
    last_sequence_number: u64,
) -> Result<Option<SequencerBatchItem>, StorageError> {
    if last_sequence_number == 0 {
        return Ok(None);
    }
    decode_item(snap.last_at_or_before(Column::SequencerBatchItems, &u64_key(last_sequence_number - 1))?)
}

/// Inbox accumulator after `count` messages (an item boundary).
pub fn accumulator_at_count(snap: &dyn ReadSnapshot, count: u64) -> Result<Hash32, StorageError> {
    if count == 0 {
        return Ok(ZERO_HASH);
    }
    Ok(get_message_entry(snap, count - 1)?.accumulator)
}

// =============================================================================
// INGESTION
// =============================================================================

/// Largest item boundary (entry count after a whole item) at or below `count`.
pub fn boundary_at_or_below(snap: &dyn ReadSnapshot, count: u64) -> Result<u64, StorageError> {
    if count == 0 {
        return Ok(0);
    }
    match snap.last_at_or_before(Column::SequencerBatchItems, &u64_key(count - 1))? {
        Some((key, _)) => Ok(key_to_u64(Column::SequencerBatchItems, &key)? + 1),
        None => Ok(0),
    }
}

/// Delayed messages sequenced by the first `count` entries (an item boundary).
pub fn total_delayed_at_count(snap: &dyn ReadSnapshot, count: u64) -> Result<u64, StorageError> {
    if count == 0 {
        return Ok(0);
    }
    Ok(batch_item_covering(snap, count - 1)?.map_or(0, |item| item.total_delayed_count))
}

/// Delete items and entries from the last item boundary at or below `count`.
/// Returns the new entry count.
pub fn truncate_to_boundary(txn: &mut WriteTxn, count: u64) -> Result<u64, StorageError> {
    let boundary = boundary_at_or_below(&*txn, count)?;

    let doomed_items = txn.range(Column::SequencerBatchItems, &u64_key(boundary), None, usize::MAX)?;
    for (key, _) in doomed_items {
        txn.delete(Column::SequencerBatchItems, &key);
    }
    let doomed_entries = txn.range(Column::MessageEntries, &u64_key(boundary), None, usize::MAX)?;
    for (key, _) in doomed_entries {
        txn.delete(Column::MessageEntries, &key);
    }
    Ok(boundary)
}

fn invalid(msg: String) -> StorageError {
    StorageError::InvalidInput(msg)
}

fn put_delayed(txn: &mut WriteTxn, message: &DelayedMessage) -> Result<(), StorageError> {
    txn.put(
        Column::DelayedMessages,
        &u64_key(message.delayed_sequence_number),
        encode_record(RecordKind::DelayedMessage, message)?,
    );
    Ok(())
}

fn put_entry(txn: &mut WriteTxn, entry: &MessageEntry) -> Result<(), StorageError> {
    txn.put(
        Column::MessageEntries,
        &u64_key(entry.sequence_number),
        encode_record(RecordKind::MessageEntry, entry)?,
    );
    Ok(())
}

/// Apply one ingestion batch inside `txn`.
pub fn add_messages(txn: &mut WriteTxn, batch: &MessageBatch) -> Result<AddOutcome, StorageError> {
    let mut rewound_to = None;
    if let Some(target) = batch.reorg_batch_items {
        if target < message_entry_inserted_count(&*txn)? {
            rewound_to = Some(truncate_to_boundary(txn, target)?);
        }
    }

    let sequenced_delayed = total_delayed_messages_sequenced(&*txn)?;
    let mut delayed_count = delayed_message_inserted_count(&*txn)?;
    for message in &batch.delayed_messages {
        let index = message.delayed_sequence_number;
        if index > delayed_count {
            return Err(invalid(format!(
                "delayed message {} leaves a gap after {}",
                index, delayed_count
            )));
        }
        if index < delayed_count {
            let existing = get_delayed_message(&*txn, index)?;
            if existing.delayed_accumulator == message.delayed_accumulator {
                continue;
            }
            if index < sequenced_delayed {
                return Err(invalid(format!(
                    "delayed message {} is already sequenced with a different accumulator",
                    index
                )));
            }
            let stale = txn.range(Column::DelayedMessages, &u64_key(index), None, usize::MAX)?;
            for (key, _) in stale {
                txn.delete(Column::DelayedMessages, &key);
            }
            delayed_count = index;
        }
        put_delayed(txn, message)?;
        delayed_count += 1;
    }

    let mut next_sequence = message_entry_inserted_count(&*txn)?;
    if batch.sequencer_batch_items.is_empty() {
        return Ok(AddOutcome {
            entry_count: next_sequence,
            rewound_to,
        });
    }

    let attach_acc = accumulator_at_count(&*txn, next_sequence)?;
    if batch.previous_inbox_acc != attach_acc {
        return Err(invalid(format!(
            "previous inbox accumulator does not match accumulator at count {}",
            next_sequence
        )));
    }

    let mut previous_total = total_delayed_messages_sequenced(&*txn)?;
    for item in &batch.sequencer_batch_items {
        match &item.sequencer_message {
            Some(raw) => {
                if item.last_sequence_number != next_sequence {
                    return Err(invalid(format!(
                        "sequencer item ends at {}, expected {}",
                        item.last_sequence_number, next_sequence
                    )));
                }
                if item.total_delayed_count != previous_total {
                    return Err(invalid(format!(
                        "sequencer item changes delayed count from {} to {}",
                        previous_total, item.total_delayed_count
                    )));
                }
                let message = InboxMessage::decode(raw)?;
                put_entry(
                    txn,
                    &MessageEntry {
                        sequence_number: next_sequence,
                        accumulator: item.accumulator,
                        block_number: message.block_number,
                        timestamp: message.timestamp,
                        source: MessageSource::Sequencer,
                        message: raw.clone(),
                    },
                )?;
                next_sequence += 1;
            }
            None => {
                if item.total_delayed_count <= previous_total {
                    return Err(invalid(format!(
                        "delayed item sequences nothing (total {} after {})",
                        item.total_delayed_count, previous_total
                    )));
                }
                if item.total_delayed_count > delayed_count {
                    return Err(invalid(format!(
                        "delayed item needs {} delayed messages, only {} present",
                        item.total_delayed_count, delayed_count
                    )));
                }
                let covered = item.total_delayed_count - previous_total;
                if item.last_sequence_number != next_sequence + covered - 1 {
                    return Err(invalid(format!(
                        "delayed item ends at {}, expected {}",
                        item.last_sequence_number,
                        next_sequence + covered - 1
                    )));
                }
                for delayed_index in previous_total..item.total_delayed_count {
                    let delayed = get_delayed_message(&*txn, delayed_index)?;
                    let message = InboxMessage::decode(&delayed.message)?;
                    put_entry(
                        txn,
                        &MessageEntry {
                            sequence_number: next_sequence,
                            accumulator: item.accumulator,
                            block_number: message.block_number,
                            timestamp: message.timestamp,
                            source: MessageSource::Delayed(delayed_index),
                            message: delayed.message,
                        },
                    )?;
                    next_sequence += 1;
                }
                previous_total = item.total_delayed_count;
            }
        }
        txn.put(
            Column::SequencerBatchItems,
            &u64_key(item.last_sequence_number),
            encode_record(RecordKind::SequencerBatchItem, item)?,
        );
    }

    Ok(AddOutcome {
        entry_count: next_sequence,
        rewound_to,
    })
}

// =============================================================================
// QUERIES
// =============================================================================

pub fn get_message_entries(
    snap: &dyn ReadSnapshot,
    index: u64,
    count: u64,
) -> Result<Vec<MessageEntry>, StorageError> {
    check_range(index, count, message_entry_inserted_count(snap)?)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    let entries = snap.range(
        Column::MessageEntries,
        &u64_key(index),
        Some(&u64_key(index + count)),
        count as usize,
    )?;
    decode_entries(Column::MessageEntries, RecordKind::MessageEntry, entries)
}

/// Encoded inbox messages `[index, index + count)`.
pub fn get_messages(snap: &dyn ReadSnapshot, index: u64, count: u64) -> Result<Vec<Vec<u8>>, StorageError> {
    Ok(get_message_entries(snap, index, count)?
        .into_iter()
        .map(|entry| entry.message)
        .collect())
}

/// Items covering sequence numbers `[index, index + count)`.
pub fn get_sequencer_batch_items(
    snap: &dyn ReadSnapshot,
    index: u64,
    count: u64,
) -> Result<Vec<SequencerBatchItem>, StorageError> {
    check_range(index, count, message_entry_inserted_count(snap)?)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    let last_wanted = index + count - 1;
    let raw = snap.range(
        Column::SequencerBatchItems,
        &u64_key(index),
        None,
        count as usize,
    )?;
    let mut items = Vec::new();
    for item in decode_entries::<SequencerBatchItem>(Column::SequencerBatchItems, RecordKind::SequencerBatchItem, raw)? {
        let done = item.last_sequence_number >= last_wanted;
        items.push(item);
        if done {
            break;
        }
    }
    Ok(items)
}

/// Accumulator of the item that sequenced `index`.
pub fn get_inbox_acc(snap: &dyn ReadSnapshot, index: u64) -> Result<Hash32, StorageError> {
    check_range(index, 1, message_entry_inserted_count(snap)?)?;
    Ok(get_message_entry(snap, index)?.accumulator)
}

pub fn get_delayed_inbox_acc(snap: &dyn ReadSnapshot, index: u64) -> Result<Hash32, StorageError> {
    check_range(index, 1, delayed_message_inserted_count(snap)?)?;
    Ok(get_delayed_message(snap, index)?.delayed_accumulator)
}

/// Both accumulators from one snapshot.
pub fn get_inbox_acc_pair(
    snap: &dyn ReadSnapshot,
    index1: u64,
    index2: u64,
) -> Result<(Hash32, Hash32), StorageError> {
    Ok((get_inbox_acc(snap, index1)?, get_inbox_acc(snap, index2)?))
}

pub fn get_sequencer_block_number_at(snap: &dyn ReadSnapshot, sequence_number: u64) -> Result<u64, StorageError> {
    check_range(sequence_number, 1, message_entry_inserted_count(snap)?)?;
    Ok(get_message_entry(snap, sequence_number)?.block_number)
}

/// Length of the leading run of `(last_sequence_number, accumulator)` pairs
/// that match persisted items.
pub fn count_matching_batch_accs(
    snap: &dyn ReadSnapshot,
    seq_nums_and_accs: &[(u64, Hash32)],
) -> Result<usize, StorageError> {
    let mut matching = 0;
    for (sequence_number, accumulator) in seq_nums_and_accs {
        let item: Option<SequencerBatchItem> = load_record(
            snap,
            Column::SequencerBatchItems,
            RecordKind::SequencerBatchItem,
            &u64_key(*sequence_number),
        )?;
        match item {
            Some(item) if item.accumulator == *accumulator => matching += 1,
            _ => break,
        }
    }
    Ok(matching)
}

/// Total delayed count a sequencer could sequence up to, including every
/// stored delayed message from blocks at or below `max_block_number`.
pub fn get_delayed_messages_to_sequence(
    snap: &dyn ReadSnapshot,
    max_block_number: u64,
) -> Result<u64, StorageError> {
    let mut total = total_delayed_messages_sequenced(snap)?;
    let pending = snap.range(Column::DelayedMessages, &u64_key(total), None, usize::MAX)?;
    for delayed in decode_entries::<DelayedMessage>(Column::DelayedMessages, RecordKind::DelayedMessage, pending)? {
        if InboxMessage::decode(&delayed.message)?.block_number > max_block_number {
            break;
        }
        total += 1;
    }
    Ok(total)
}

/// Up to `count` messages following `inbox`.
pub fn read_next_messages(
    snap: &dyn ReadSnapshot,
    inbox: &InboxState,
    count: u64,
) -> Result<Vec<MachineMessage>, StorageError> {
    let available = message_entry_inserted_count(snap)?.saturating_sub(inbox.count);
    let count = count.min(available);
    get_message_entries(snap, inbox.count, count)?
        .into_iter()
        .map(|entry| {
            let message = InboxMessage::decode(&entry.message)?;
            Ok(MachineMessage {
                sequence_number: entry.sequence_number,
                accumulator: entry.accumulator,
                block_number: entry.block_number,
                timestamp: entry.timestamp,
                data: message.data,
            })
        })
        .collect()
}

/// True if `inbox` is a prefix of the persisted inbox.
pub fn is_valid(snap: &dyn ReadSnapshot, inbox: &InboxState) -> Result<bool, StorageError> {
    if inbox.count == 0 {
        return Ok(true);
    }
    if inbox.count > message_entry_inserted_count(snap)? {
        return Ok(false);
    }
    Ok(get_message_entry(snap, inbox.count - 1)?.accumulator == inbox.accumulator)
}

// =============================================================================
// INBOX PROOFS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofItem {
    pub item: SequencerBatchItem,
    /// Delayed accumulator at `total_delayed_count - 1` for delayed items.
    pub delayed_acc: Hash32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedPath {
    pub delayed_sequence_number: u64,
    pub prev_delayed_acc: Hash32,
    /// Message hashes after the target up to the item's delayed total.
    pub following: Vec<Hash32>,
}

/// Inclusion of one message in a contiguous run of batch items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxProof {
    pub sequence_number: u64,
    pub message: Vec<u8>,
    pub before_acc: Hash32,
    pub before_total_delayed: u64,
    pub first_sequence_number: u64,
    pub items: Vec<ProofItem>,
    pub delayed_path: Option<DelayedPath>,
}

impl InboxProof {
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Recompute the accumulator chain. Returns the accumulator the proof
    /// commits to, or `None` if any link or the message does not check out.
    pub fn verify(&self) -> Option<Hash32> {
        let mut acc = self.before_acc;
        let mut start = self.first_sequence_number;
        let mut total = self.before_total_delayed;
        let mut included = false;

        for proof_item in &self.items {
            let item = &proof_item.item;
            if item.last_sequence_number < start {
                return None;
            }
            let computed = match &item.sequencer_message {
                Some(message) => {
                    if item.last_sequence_number != start || item.total_delayed_count != total {
                        return None;
                    }
                    sequencer_item_accumulator(&acc, start, message)
                }
                None => {
                    if item.total_delayed_count <= total
                        || item.last_sequence_number - start + 1 != item.total_delayed_count - total
                    {
                        return None;
                    }
                    delayed_item_accumulator(&acc, start, item.total_delayed_count, &proof_item.delayed_acc)
                }
            };
            if computed != item.accumulator {
                return None;
            }

            if (start..=item.last_sequence_number).contains(&self.sequence_number) {
                match &item.sequencer_message {
                    Some(message) if *message == self.message => {}
                    Some(_) => return None,
                    None => {
                        let path = self.delayed_path.as_ref()?;
                        let index = total + (self.sequence_number - start);
                        if path.delayed_sequence_number != index
                            || index + 1 + path.following.len() as u64 != item.total_delayed_count
                        {
                            return None;
                        }
                        let mut delayed_acc =
                            delayed_message_accumulator(&path.prev_delayed_acc, index, &self.message);
                        for (offset, message_hash) in path.following.iter().enumerate() {
                            delayed_acc =
                                delayed_accumulator_from_hash(&delayed_acc, index + 1 + offset as u64, message_hash);
                        }
                        if delayed_acc != proof_item.delayed_acc {
                            return None;
                        }
                    }
                }
                included = true;
            }

            acc = item.accumulator;
            start = item.last_sequence_number + 1;
            total = item.total_delayed_count;
        }

        if included {
            Some(acc)
        } else {
            None
        }
    }
}

/// Proof that message `seq_num` is part of the items covering
/// `[batch_index, batch_end_count)`, encoded with bincode.
pub fn gen_inbox_proof(
    snap: &dyn ReadSnapshot,
    seq_num: u64,
    batch_index: u64,
    batch_end_count: u64,
) -> Result<Vec<u8>, StorageError> {
    if seq_num < batch_index || seq_num >= batch_end_count {
        return Err(invalid(format!(
            "message {} outside batch [{}, {})",
            seq_num, batch_index, batch_end_count
        )));
    }
    let items = get_sequencer_batch_items(snap, batch_index, batch_end_count - batch_index)?;
    let first = items
        .first()
        .ok_or_else(|| invalid(format!("no batch items cover {}", batch_index)))?;

    let (before_acc, before_total_delayed, first_sequence_number) =
        match batch_item_before(snap, first.last_sequence_number)? {
            Some(prev) => (prev.accumulator, prev.total_delayed_count, prev.last_sequence_number + 1),
            None => (ZERO_HASH, 0, 0),
        };

    let mut proof_items = Vec::with_capacity(items.len());
    for item in items {
        let delayed_acc = match item.sequencer_message {
            Some(_) => ZERO_HASH,
            None => get_delayed_message(snap, item.total_delayed_count - 1)?.delayed_accumulator,
        };
        proof_items.push(ProofItem { item, delayed_acc });
    }

    let entry = get_message_entry(snap, seq_num)?;
    let delayed_path = match entry.source {
        MessageSource::Sequencer => None,
        MessageSource::Delayed(index) => {
            let covering = batch_item_covering(snap, seq_num)?.ok_or_else(|| StorageError::NotFound {
                column: Column::SequencerBatchItems,
                key: u64_key(seq_num).to_vec(),
            })?;
            let prev_delayed_acc = if index == 0 {
                ZERO_HASH
            } else {
                get_delayed_message(snap, index - 1)?.delayed_accumulator
            };
            let mut following = Vec::new();
            for later in index + 1..covering.total_delayed_count {
                following.push(hash_bytes(&get_delayed_message(snap, later)?.message));
            }
            Some(DelayedPath {
                delayed_sequence_number: index,
                prev_delayed_acc,
                following,
            })
        }
    };

    let proof = InboxProof {
        sequence_number: seq_num,
        message: entry.message,
        before_acc,
        before_total_delayed,
        first_sequence_number,
        items: proof_items,
        delayed_path,
    };
    Ok(bincode::serialize(&proof)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::batch::BatchBuilder;
    use crate::engine::store::{KvStore, MemoryStore};

    fn ingest(store: &MemoryStore, batch: &MessageBatch) -> Result<AddOutcome, StorageError> {
        let mut txn = store.begin();
        let outcome = add_messages(&mut txn, batch)?;
        store.commit(txn.into_batch())?;
        Ok(outcome)
    }

    fn msg(block: u64, data: &str) -> InboxMessage {
        InboxMessage::new(block, block * 10, data.as_bytes().to_vec())
    }

    #[test]
    fn test_entry_count_matches_retrievable_messages() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        builder.sequencer(&msg(1, "a")).unwrap();
        builder.sequencer(&msg(1, "b")).unwrap();
        ingest(&store, &builder.finish()).unwrap();

        let snap = store.snapshot();
        let count = message_entry_inserted_count(snap.as_ref()).unwrap();
        assert_eq!(count, 2);
        let messages = get_messages(snap.as_ref(), 0, count).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(InboxMessage::decode(&messages[1]).unwrap().data, b"b".to_vec());
    }

    #[test]
    fn test_rejects_wrong_previous_accumulator() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        builder.sequencer(&msg(1, "a")).unwrap();
        let mut batch = builder.finish();
        batch.previous_inbox_acc = [7u8; 32];
        let err = ingest(&store, &batch).unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
        assert_eq!(message_entry_inserted_count(store.snapshot().as_ref()).unwrap(), 0);
    }

    #[test]
    fn test_delayed_messages_sequenced_by_item() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        builder.delayed(&msg(1, "d0")).unwrap();
        builder.delayed(&msg(2, "d1")).unwrap();
        builder.delayed(&msg(5, "d2")).unwrap();
        builder.sequencer(&msg(1, "s0")).unwrap();
        builder.sequence_delayed(2).unwrap();
        ingest(&store, &builder.finish()).unwrap();

        let snap = store.snapshot();
        assert_eq!(message_entry_inserted_count(snap.as_ref()).unwrap(), 3);
        assert_eq!(total_delayed_messages_sequenced(snap.as_ref()).unwrap(), 2);
        assert_eq!(delayed_message_inserted_count(snap.as_ref()).unwrap(), 3);
        let entry = get_message_entry(snap.as_ref(), 2).unwrap();
        assert_eq!(entry.source, MessageSource::Delayed(1));
        assert_eq!(get_sequencer_block_number_at(snap.as_ref(), 2).unwrap(), 2);

        assert_eq!(get_delayed_messages_to_sequence(snap.as_ref(), 4).unwrap(), 2);
        assert_eq!(get_delayed_messages_to_sequence(snap.as_ref(), 5).unwrap(), 3);
    }

    #[test]
    fn test_delayed_item_needs_present_messages() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        builder.delayed(&msg(1, "d0")).unwrap();
        let mut batch = builder.finish();
        batch.sequencer_batch_items.push(SequencerBatchItem {
            last_sequence_number: 1,
            accumulator: ZERO_HASH,
            total_delayed_count: 2,
            sequencer_message: None,
        });
        assert!(matches!(ingest(&store, &batch), Err(StorageError::InvalidInput(_))));
    }

    #[test]
    fn test_reorg_truncates_to_item_boundary() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        for i in 0..3 {
            builder.delayed(&msg(1, &format!("d{}", i))).unwrap();
        }
        builder.sequencer(&msg(1, "s0")).unwrap();
        builder.sequence_delayed(3).unwrap(); // covers 1..=3
        builder.sequencer(&msg(2, "s4")).unwrap();
        ingest(&store, &builder.finish()).unwrap();

        // Target 3 falls inside the delayed item; the boundary below it is 1.
        let mut builder = BatchBuilder::resume_at(store.snapshot().as_ref(), 3).unwrap();
        builder.sequencer(&msg(3, "replacement")).unwrap();
        let outcome = ingest(&store, &builder.finish()).unwrap();

        assert_eq!(outcome.rewound_to, Some(1));
        assert_eq!(outcome.entry_count, 2);
        let snap = store.snapshot();
        assert_eq!(total_delayed_messages_sequenced(snap.as_ref()).unwrap(), 0);
        assert_eq!(delayed_message_inserted_count(snap.as_ref()).unwrap(), 3);
        let replaced = InboxMessage::decode(&get_messages(snap.as_ref(), 1, 1).unwrap()[0]).unwrap();
        assert_eq!(replaced.data, b"replacement".to_vec());
    }

    #[test]
    fn test_out_of_range_pagination() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        builder.sequencer(&msg(1, "a")).unwrap();
        ingest(&store, &builder.finish()).unwrap();

        let snap = store.snapshot();
        assert!(matches!(
            get_messages(snap.as_ref(), 0, 2),
            Err(StorageError::OutOfRange { index: 0, count: 2, inserted: 1 })
        ));
        assert!(get_inbox_acc(snap.as_ref(), 1).is_err());
        assert!(get_messages(snap.as_ref(), 1, 0).unwrap().is_empty());
    }

    #[test]
    fn test_batch_items_and_matching_accs() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        builder.delayed(&msg(1, "d0")).unwrap();
        builder.delayed(&msg(1, "d1")).unwrap();
        builder.sequencer(&msg(1, "s0")).unwrap();
        builder.sequence_delayed(2).unwrap();
        builder.sequencer(&msg(2, "s3")).unwrap();
        ingest(&store, &builder.finish()).unwrap();

        let snap = store.snapshot();
        let items = get_sequencer_batch_items(snap.as_ref(), 1, 2).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].last_sequence_number, 2);

        let all = get_sequencer_batch_items(snap.as_ref(), 0, 4).unwrap();
        assert_eq!(all.len(), 3);

        let pairs: Vec<(u64, Hash32)> = all
            .iter()
            .map(|item| (item.last_sequence_number, item.accumulator))
            .collect();
        assert_eq!(count_matching_batch_accs(snap.as_ref(), &pairs).unwrap(), 3);

        let mut diverged = pairs.clone();
        diverged[1].1 = [1u8; 32];
        assert_eq!(count_matching_batch_accs(snap.as_ref(), &diverged).unwrap(), 1);

        let (a, b) = get_inbox_acc_pair(snap.as_ref(), 0, 3).unwrap();
        assert_eq!(a, all[0].accumulator);
        assert_eq!(b, all[2].accumulator);
    }

    #[test]
    fn test_inbox_proof_verifies_for_both_sources() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        for i in 0..3 {
            builder.delayed(&msg(1, &format!("d{}", i))).unwrap();
        }
        builder.sequencer(&msg(1, "s0")).unwrap();
        builder.sequence_delayed(3).unwrap();
        builder.sequencer(&msg(2, "s4")).unwrap();
        ingest(&store, &builder.finish()).unwrap();

        let snap = store.snapshot();
        let end_acc = get_inbox_acc(snap.as_ref(), 4).unwrap();
        for seq in [0u64, 2, 4] {
            let bytes = gen_inbox_proof(snap.as_ref(), seq, 0, 5).unwrap();
            let proof = InboxProof::decode(&bytes).unwrap();
            assert_eq!(proof.verify(), Some(end_acc), "proof for message {}", seq);
        }

        let bytes = gen_inbox_proof(snap.as_ref(), 4, 4, 5).unwrap();
        let mut proof = InboxProof::decode(&bytes).unwrap();
        assert_eq!(proof.verify(), Some(end_acc));
        proof.message = b"forged".to_vec();
        assert_eq!(proof.verify(), None);
    }

    #[test]
    fn test_is_valid_and_read_next() {
        let store = MemoryStore::new();
        let mut builder = BatchBuilder::new();
        builder.sequencer(&msg(1, "a")).unwrap();
        builder.sequencer(&msg(1, "b")).unwrap();
        builder.sequencer(&msg(2, "c")).unwrap();
        ingest(&store, &builder.finish()).unwrap();

        let snap = store.snapshot();
        let next = read_next_messages(snap.as_ref(), &InboxState::default(), 2).unwrap();
        assert_eq!(next.len(), 2);
        let inbox = InboxState::after(&next[1]);
        assert!(is_valid(snap.as_ref(), &inbox).unwrap());

        let rest = read_next_messages(snap.as_ref(), &inbox, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].data, b"c".to_vec());

        let stale = InboxState {
            count: 2,
            accumulator: [3u8; 32],
        };
        assert!(!is_valid(snap.as_ref(), &stale).unwrap());
        assert!(!is_valid(snap.as_ref(), &InboxState { count: 9, accumulator: ZERO_HASH }).unwrap());
    }
}
