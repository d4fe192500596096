//! Producer-side batch construction.
//!
//! `BatchBuilder` tracks the inbox and delayed accumulator chains so callers
//! can append messages without computing hashes by hand. It assumes every
//! batch it produced was accepted; after a rejection, `resume` from the store.

use std::collections::BTreeMap;

use crate::engine::errors::StorageError;
use crate::engine::format::{Hash32, ZERO_HASH};
use crate::engine::messages::{
    accumulator_at_count, boundary_at_or_below, delayed_item_accumulator, delayed_message_accumulator,
    delayed_message_inserted_count, get_delayed_inbox_acc, message_entry_inserted_count,
    sequencer_item_accumulator, total_delayed_at_count, DelayedMessage, InboxMessage, MessageBatch,
    SequencerBatchItem,
};
use crate::engine::store::ReadSnapshot;

#[derive(Debug)]
pub struct BatchBuilder {
    previous_inbox_acc: Hash32,
    acc: Hash32,
    next_sequence: u64,
    total_sequenced: u64,
    delayed_count: u64,
    /// Accumulators of delayed messages not yet sequenced.
    delayed_accs: BTreeMap<u64, Hash32>,
    last_delayed_acc: Hash32,
    items: Vec<SequencerBatchItem>,
    delayed: Vec<DelayedMessage>,
    reorg: Option<u64>,
}

impl Default for BatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchBuilder {
    /// Builder for an empty inbox.
    pub fn new() -> Self {
        BatchBuilder {
            previous_inbox_acc: ZERO_HASH,
            acc: ZERO_HASH,
            next_sequence: 0,
            total_sequenced: 0,
            delayed_count: 0,
            delayed_accs: BTreeMap::new(),
            last_delayed_acc: ZERO_HASH,
            items: Vec::new(),
            delayed: Vec::new(),
            reorg: None,
        }
    }

    /// Continue after the persisted inbox.
    pub fn resume(snap: &dyn ReadSnapshot) -> Result<Self, StorageError> {
        let count = message_entry_inserted_count(snap)?;
        Self::resume_from(snap, count, None)
    }

    /// Replace everything after the last item boundary at or below `count`.
    /// The first batch carries the reorg instruction.
    pub fn resume_at(snap: &dyn ReadSnapshot, count: u64) -> Result<Self, StorageError> {
        let boundary = boundary_at_or_below(snap, count)?;
        Self::resume_from(snap, boundary, Some(count))
    }

    fn resume_from(snap: &dyn ReadSnapshot, count: u64, reorg: Option<u64>) -> Result<Self, StorageError> {
        let acc = accumulator_at_count(snap, count)?;
        let total_sequenced = total_delayed_at_count(snap, count)?;
        let delayed_count = delayed_message_inserted_count(snap)?;

        let mut delayed_accs = BTreeMap::new();
        for index in total_sequenced..delayed_count {
            delayed_accs.insert(index, get_delayed_inbox_acc(snap, index)?);
        }
        let last_delayed_acc = if delayed_count == 0 {
            ZERO_HASH
        } else {
            get_delayed_inbox_acc(snap, delayed_count - 1)?
        };

        Ok(BatchBuilder {
            previous_inbox_acc: acc,
            acc,
            next_sequence: count,
            total_sequenced,
            delayed_count,
            delayed_accs,
            last_delayed_acc,
            items: Vec::new(),
            delayed: Vec::new(),
            reorg,
        })
    }

    /// Sequence number the next message will get.
    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence
    }

    /// Delayed messages delivered but not yet sequenced.
    pub fn unsequenced_delayed(&self) -> u64 {
        self.delayed_count - self.total_sequenced
    }

    /// Append a sequencer message. Returns its sequence number.
    pub fn sequencer(&mut self, message: &InboxMessage) -> Result<u64, StorageError> {
        let raw = message.encode()?;
        let sequence_number = self.next_sequence;
        self.acc = sequencer_item_accumulator(&self.acc, sequence_number, &raw);
        self.items.push(SequencerBatchItem {
            last_sequence_number: sequence_number,
            accumulator: self.acc,
            total_delayed_count: self.total_sequenced,
            sequencer_message: Some(raw),
        });
        self.next_sequence += 1;
        Ok(sequence_number)
    }

    /// Deliver a delayed message. Returns its delayed sequence number.
    pub fn delayed(&mut self, message: &InboxMessage) -> Result<u64, StorageError> {
        let raw = message.encode()?;
        let index = self.delayed_count;
        self.last_delayed_acc = delayed_message_accumulator(&self.last_delayed_acc, index, &raw);
        self.delayed_accs.insert(index, self.last_delayed_acc);
        self.delayed.push(DelayedMessage {
            delayed_sequence_number: index,
            delayed_accumulator: self.last_delayed_acc,
            message: raw,
        });
        self.delayed_count += 1;
        Ok(index)
    }

    /// Sequence delayed messages up to a total count.
    pub fn sequence_delayed(&mut self, total_delayed_count: u64) -> Result<(), StorageError> {
        if total_delayed_count <= self.total_sequenced || total_delayed_count > self.delayed_count {
            return Err(StorageError::InvalidInput(format!(
                "cannot sequence delayed total {} (sequenced {}, delivered {})",
                total_delayed_count, self.total_sequenced, self.delayed_count
            )));
        }
        let delayed_acc = self
            .delayed_accs
            .get(&(total_delayed_count - 1))
            .copied()
            .ok_or_else(|| {
                StorageError::InvalidInput(format!(
                    "delayed accumulator {} unknown",
                    total_delayed_count - 1
                ))
            })?;

        let covered = total_delayed_count - self.total_sequenced;
        let first = self.next_sequence;
        self.acc = delayed_item_accumulator(&self.acc, first, total_delayed_count, &delayed_acc);
        self.items.push(SequencerBatchItem {
            last_sequence_number: first + covered - 1,
            accumulator: self.acc,
            total_delayed_count,
            sequencer_message: None,
        });
        self.next_sequence += covered;
        self.total_sequenced = total_delayed_count;
        self.delayed_accs = self.delayed_accs.split_off(&total_delayed_count);
        Ok(())
    }

    /// Sequence every delivered delayed message, if any are pending.
    pub fn sequence_all_delayed(&mut self) -> Result<(), StorageError> {
        if self.delayed_count > self.total_sequenced {
            self.sequence_delayed(self.delayed_count)?;
        }
        Ok(())
    }

    /// Take the pending batch; later calls continue the chain.
    pub fn finish(&mut self) -> MessageBatch {
        let batch = MessageBatch {
            previous_inbox_acc: self.previous_inbox_acc,
            sequencer_batch_items: std::mem::take(&mut self.items),
            delayed_messages: std::mem::take(&mut self.delayed),
            reorg_batch_items: self.reorg.take(),
        };
        self.previous_inbox_acc = self.acc;
        batch
    }
}
