//! Read-side API. Each query runs against one store snapshot and never
//! blocks the Core Loop, apart from log reads, which share the reorg lock.

use crate::engine::checkpoint::{get_checkpoint_using_gas, is_checkpoints_empty, max_checkpoint_gas, MachineStateKeys};
use crate::engine::format::Hash32;
use crate::engine::messages::{
    count_matching_batch_accs, gen_inbox_proof, get_delayed_inbox_acc, get_delayed_messages_to_sequence,
    get_inbox_acc, get_inbox_acc_pair, get_messages, get_sequencer_batch_items, get_sequencer_block_number_at,
    message_entry_inserted_count, total_delayed_messages_sequenced, SequencerBatchItem,
};
use crate::engine::outputs;
use crate::engine::outputs::{get_sends, get_sideload_position, log_inserted_count, send_inserted_count};
use crate::engine::values::Value;
use crate::kernel::execution_cursor::ExecutionCursor;
use crate::kernel::logs_cursor::{LogsCursorBatch, LogsCursorStatus};
use crate::kernel::traits::{Machine, MachineForm, ReconstructedMachine};

use super::error::CoreError;
use super::handle::LedgerCore;

impl LedgerCore {
    // =========================================================================
    // COUNTS
    // =========================================================================

    pub fn log_inserted_count(&self) -> Result<u64, CoreError> {
        Ok(log_inserted_count(self.shared.store.snapshot().as_ref())?)
    }

    pub fn send_inserted_count(&self) -> Result<u64, CoreError> {
        Ok(send_inserted_count(self.shared.store.snapshot().as_ref())?)
    }

    pub fn message_entry_inserted_count(&self) -> Result<u64, CoreError> {
        Ok(message_entry_inserted_count(self.shared.store.snapshot().as_ref())?)
    }

    pub fn total_delayed_messages_sequenced(&self) -> Result<u64, CoreError> {
        Ok(total_delayed_messages_sequenced(self.shared.store.snapshot().as_ref())?)
    }

    // =========================================================================
    // PAGINATED READS
    // =========================================================================

    /// Logs `[index, index + count)`.
    pub fn get_logs(&self, index: u64, count: u64) -> Result<Vec<Value>, CoreError> {
        let _guard = self.shared.reorg_lock.read();
        let snap = self.shared.store.snapshot();
        let mut values = self.shared.values.lock();
        Ok(outputs::get_logs(snap.as_ref(), index, count, &mut values)?)
    }

    pub fn get_sends(&self, index: u64, count: u64) -> Result<Vec<Vec<u8>>, CoreError> {
        let _guard = self.shared.reorg_lock.read();
        Ok(get_sends(self.shared.store.snapshot().as_ref(), index, count)?)
    }

    /// Encoded inbox messages `[index, index + count)`.
    pub fn get_messages(&self, index: u64, count: u64) -> Result<Vec<Vec<u8>>, CoreError> {
        Ok(get_messages(self.shared.store.snapshot().as_ref(), index, count)?)
    }

    pub fn get_sequencer_batch_items(&self, index: u64, count: u64) -> Result<Vec<SequencerBatchItem>, CoreError> {
        Ok(get_sequencer_batch_items(self.shared.store.snapshot().as_ref(), index, count)?)
    }

    pub fn get_inbox_acc(&self, index: u64) -> Result<Hash32, CoreError> {
        Ok(get_inbox_acc(self.shared.store.snapshot().as_ref(), index)?)
    }

    pub fn get_delayed_inbox_acc(&self, index: u64) -> Result<Hash32, CoreError> {
        Ok(get_delayed_inbox_acc(self.shared.store.snapshot().as_ref(), index)?)
    }

    pub fn get_inbox_acc_pair(&self, index1: u64, index2: u64) -> Result<(Hash32, Hash32), CoreError> {
        Ok(get_inbox_acc_pair(self.shared.store.snapshot().as_ref(), index1, index2)?)
    }

    pub fn get_sequencer_block_number_at(&self, sequence_number: u64) -> Result<u64, CoreError> {
        Ok(get_sequencer_block_number_at(self.shared.store.snapshot().as_ref(), sequence_number)?)
    }

    pub fn count_matching_batch_accs(&self, seq_nums_and_accs: &[(u64, Hash32)]) -> Result<usize, CoreError> {
        Ok(count_matching_batch_accs(self.shared.store.snapshot().as_ref(), seq_nums_and_accs)?)
    }

    pub fn get_delayed_messages_to_sequence(&self, max_block_number: u64) -> Result<u64, CoreError> {
        Ok(get_delayed_messages_to_sequence(self.shared.store.snapshot().as_ref(), max_block_number)?)
    }

    /// Inclusion proof for message `seq_num` within the batch items covering
    /// `[batch_index, batch_end_count)`.
    pub fn gen_inbox_proof(&self, seq_num: u64, batch_index: u64, batch_end_count: u64) -> Result<Vec<u8>, CoreError> {
        Ok(gen_inbox_proof(
            self.shared.store.snapshot().as_ref(),
            seq_num,
            batch_index,
            batch_end_count,
        )?)
    }

    // =========================================================================
    // CHECKPOINTS
    // =========================================================================

    pub fn is_checkpoints_empty(&self) -> Result<bool, CoreError> {
        Ok(is_checkpoints_empty(self.shared.store.snapshot().as_ref())?)
    }

    pub fn max_checkpoint_gas(&self) -> Result<u64, CoreError> {
        Ok(max_checkpoint_gas(self.shared.store.snapshot().as_ref())?)
    }

    pub fn get_checkpoint_using_gas(&self, gas: u64, after: bool) -> Result<Option<MachineStateKeys>, CoreError> {
        Ok(get_checkpoint_using_gas(self.shared.store.snapshot().as_ref(), gas, after)?)
    }

    // =========================================================================
    // LOGS CURSORS
    // =========================================================================

    /// Ask cursor `index` for up to `count` logs past its confirmed position.
    pub fn logs_cursor_request(&self, index: usize, count: u64) -> Result<(), CoreError> {
        self.shared.logs_cursors.lock().request(index, count)?;
        self.wake();
        Ok(())
    }

    /// The batch for cursor `index`, if one is available. Fills an
    /// outstanding request from the current logs first.
    pub fn logs_cursor_get_logs(&self, index: usize) -> Result<Option<LogsCursorBatch>, CoreError> {
        let _guard = self.shared.reorg_lock.read();
        let mut cursors = self.shared.logs_cursors.lock();
        if cursors.status(index)? == LogsCursorStatus::Requested {
            let snap = self.shared.store.snapshot();
            let log_count = log_inserted_count(snap.as_ref())?;
            cursors.fulfill_one(index, snap.as_ref(), &mut self.shared.values.lock(), log_count)?;
        }
        Ok(cursors.get_logs(index)?)
    }

    /// Acknowledge the batch returned by `logs_cursor_get_logs`.
    pub fn logs_cursor_confirm_received(&self, index: usize) -> Result<(), CoreError> {
        self.shared.logs_cursors.lock().confirm(index)?;
        self.wake();
        Ok(())
    }

    pub fn logs_cursor_check_error(&self, index: usize) -> Result<bool, CoreError> {
        Ok(self.shared.logs_cursors.lock().check_error(index)?)
    }

    pub fn logs_cursor_clear_error(&self, index: usize) -> Result<Option<String>, CoreError> {
        Ok(self.shared.logs_cursors.lock().clear_error(index)?)
    }

    /// Confirmed log count of cursor `index`.
    pub fn logs_cursor_position(&self, index: usize) -> Result<u64, CoreError> {
        Ok(self.shared.logs_cursors.lock().position(index)?)
    }

    pub fn logs_cursor_status(&self, index: usize) -> Result<LogsCursorStatus, CoreError> {
        Ok(self.shared.logs_cursors.lock().status(index)?)
    }

    // =========================================================================
    // EXECUTION CURSORS AND HISTORICAL MACHINES
    // =========================================================================

    /// Lazy cursor at `gas` (or the last reachable point below it).
    pub fn get_execution_cursor(&self, gas: u64) -> Result<ExecutionCursor, CoreError> {
        self.shared.replayer().open(gas)
    }

    pub fn advance_execution_cursor(
        &self,
        cursor: &mut ExecutionCursor,
        max_gas: u64,
        go_over_gas: bool,
    ) -> Result<(), CoreError> {
        self.shared.replayer().advance(cursor, max_gas, go_over_gas)
    }

    /// Take the cursor's machine. The cursor is unusable afterwards.
    pub fn take_execution_cursor_machine(&self, cursor: &mut ExecutionCursor) -> Result<Box<dyn Machine>, CoreError> {
        self.shared.replayer().take(cursor)
    }

    pub fn get_machine_at_gas(&self, gas: u64, form: MachineForm) -> Result<ReconstructedMachine, CoreError> {
        self.shared.replayer().machine_at_gas(gas, form)
    }

    /// `(block, gas)` of the latest recorded block boundary at or before
    /// `block_number`.
    pub fn get_sideload_position(&self, block_number: u64) -> Result<Option<(u64, u64)>, CoreError> {
        Ok(get_sideload_position(self.shared.store.snapshot().as_ref(), block_number)?)
    }

    /// Machine positioned at the end of the latest recorded block at or
    /// before `block_number`, from the sideload cache or by replay.
    pub fn get_machine_for_sideload(&self, block_number: u64) -> Result<Option<Box<dyn Machine>>, CoreError> {
        let (block, gas) = match self.get_sideload_position(block_number)? {
            Some(position) => position,
            None => return Ok(None),
        };
        if let Some(machine) = self.shared.sideload_cache.lock().get(block) {
            return Ok(Some(machine));
        }

        let replayer = self.shared.replayer();
        let mut cursor = replayer.open(gas)?;
        let machine = replayer.take(&mut cursor)?;
        if machine.gas_used() != gas {
            return Err(CoreError::CheckpointMismatch {
                gas_used: machine.gas_used(),
                reason: format!("replay for block {} stopped short of gas {}", block, gas),
            });
        }
        self.shared.sideload_cache.lock().insert(block, machine.boxed_clone());
        Ok(Some(machine))
    }
}
