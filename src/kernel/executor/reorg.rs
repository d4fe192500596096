//! Reorg Coordinator.
//!
//! # Algorithm
//!
//! Step A: restore the machine from the newest checkpoint whose inbox
//!         position is at or before the target (genesis if none).
//! Step B: unless `use_latest`, replay it forward to exactly the target.
//! Step C: truncate checkpoints, logs, sends and sideload positions beyond
//!         the restored machine, in the same transaction as the inbox
//!         truncation. An explicit replaying reorg truncates the inbox to
//!         the last batch-item boundary at or below its target; ingest
//!         truncates it by replacing the tail.
//! Step D: after commit, install the machine and roll back every in-memory
//!         view (logs cursors, value pins, machine caches).
//!
//! Replay is deterministic over an unchanged inbox prefix, so the outputs it
//! regenerates equal the stored ones they overlap and are kept.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::checkpoint::{checkpoint_at_or_before_message, delete_checkpoints_after, is_checkpoints_empty};
use crate::engine::messages::{message_entry_inserted_count, read_next_messages, truncate_to_boundary};
use crate::engine::outputs::{
    delete_logs_starting_at, delete_sends_starting_at, delete_sideloads_after_gas, log_inserted_count,
    save_cursor_position,
};
use crate::engine::store::{ReadSnapshot, WriteTxn};
use crate::kernel::execution_cursor::reconstruct_machine;
use crate::kernel::traits::{Machine, RunBudget, StepOutcome};

use super::error::CoreError;
use super::{CoreLoop, PendingOutputs};

/// A machine restored by `rewind_in`, waiting for its transaction to commit.
pub(super) struct Rewind {
    pub(super) machine: Box<dyn Machine>,
    /// Outputs produced by replay past the restored checkpoint.
    pub(super) pending: PendingOutputs,
}

/// Feed and run `machine` until it has processed `target` messages or the
/// inbox runs out, collecting outputs and block boundaries into `pending`.
pub(super) fn run_to_message_count(
    machine: &mut dyn Machine,
    snap: &dyn ReadSnapshot,
    target: u64,
    group_size: u64,
    pending: &mut PendingOutputs,
) -> Result<(), CoreError> {
    let budget = RunBudget {
        max_gas: u64::MAX,
        go_over_gas: true,
        stop_at_sideload: true,
    };
    loop {
        if machine.is_idle() {
            let inbox = machine.fully_processed_inbox();
            if inbox.count >= target {
                return Ok(());
            }
            let messages = read_next_messages(snap, &inbox, group_size.min(target - inbox.count))?;
            if messages.is_empty() {
                return Ok(());
            }
            machine.deliver_messages(messages)?;
        }

        let outcome = machine.step(&budget)?;
        pending.logs.extend(machine.drain_logs());
        pending.sends.extend(machine.drain_sends());
        if let StepOutcome::Sideload(block) = outcome {
            pending.sideloads.push((block, machine.gas_used()));
        }
    }
}

impl CoreLoop {
    /// Steps A to C inside `txn`. Nothing in memory changes.
    pub(super) fn rewind_in(
        &self,
        txn: &mut WriteTxn,
        message_count: u64,
        use_latest: bool,
    ) -> Result<Rewind, CoreError> {
        let shared = &self.shared;

        // Step A
        let mut machine = match checkpoint_at_or_before_message(&*txn, message_count)? {
            Some(keys) => reconstruct_machine(&*txn, shared.loader.as_ref(), &shared.values, &keys)?,
            None => {
                warn!(message_count, "no checkpoint at or before reorg target, restarting from genesis");
                shared.loader.genesis()
            }
        };
        let restored_gas = machine.gas_used();

        // Step B
        let mut pending = PendingOutputs::default();
        if !use_latest {
            run_to_message_count(
                machine.as_mut(),
                &*txn,
                message_count,
                shared.config.message_group_size,
                &mut pending,
            )?;
        }

        // Step C
        let gas = machine.gas_used();
        let output = machine.output();
        let removed_checkpoints = delete_checkpoints_after(txn, gas)?;
        let removed_logs = delete_logs_starting_at(txn, output.log_count)?;
        let removed_sends = delete_sends_starting_at(txn, output.send_count)?;
        let removed_sideloads = delete_sideloads_after_gas(txn, gas)?;

        info!(
            target = message_count,
            use_latest,
            restored_gas,
            gas,
            messages = output.fully_processed_inbox.count,
            removed_checkpoints,
            removed_logs,
            removed_sends,
            removed_sideloads,
            "rewound machine"
        );
        Ok(Rewind { machine, pending })
    }

    /// Step D. Must run right after the rewind transaction commits, under
    /// the same reorg write lock.
    pub(super) fn install(&mut self, rewind: Rewind) -> Result<(), CoreError> {
        let shared = Arc::clone(&self.shared);
        self.machine = rewind.machine;
        self.pending = rewind.pending;

        let messages = self.machine.fully_processed_inbox().count;
        let dropped_sideloads = shared.sideload_cache.lock().invalidate_beyond_messages(messages);
        let dropped_recent = shared.recent_machines.lock().invalidate_beyond_messages(messages);
        debug!(messages, dropped_sideloads, dropped_recent, "invalidated machine caches");

        let stored_logs = log_inserted_count(shared.store.snapshot().as_ref())?;
        let moved = shared.logs_cursors.lock().reorg(stored_logs);
        shared.values.lock().release_from(stored_logs);
        if !moved.is_empty() {
            let mut txn = shared.store.begin();
            for &(index, position) in &moved {
                save_cursor_position(&mut txn, index, position);
            }
            shared.store.commit(txn.into_batch())?;
        }

        self.restore_checkpoint_marks()?;
        let needs_checkpoint = self.machine.gas_used() > self.last_checkpoint_gas
            || is_checkpoints_empty(shared.store.snapshot().as_ref())?;
        if needs_checkpoint {
            self.save_checkpoint_now(false)?;
        }

        shared.machine_idle.store(false, Ordering::SeqCst);
        shared.messages_read.store(messages, Ordering::SeqCst);
        *shared.last_machine.lock() = Some(self.machine.boxed_clone());
        Ok(())
    }

    /// Roll the live machine back to at most `message_count` processed
    /// messages. Returns the message count actually restored.
    ///
    /// Unless `use_latest`, stored messages past the target are dropped too,
    /// so the loop does not re-execute them.
    pub(crate) fn reorg_to_message_count_or_before(
        &mut self,
        message_count: u64,
        use_latest: bool,
    ) -> Result<u64, CoreError> {
        let shared = Arc::clone(&self.shared);
        let _guard = shared.reorg_lock.write();

        let mut txn = shared.store.begin();
        let mut target = message_count;
        let stored = message_entry_inserted_count(&txn)?;
        let truncates = !use_latest && message_count < stored;
        if truncates {
            target = truncate_to_boundary(&mut txn, message_count)?;
            info!(requested = message_count, kept = target, dropped = stored - target, "truncated inbox");
        }
        let rewind = self.rewind_in(&mut txn, target, use_latest)?;
        shared.store.commit(txn.into_batch())?;

        if truncates {
            let dropped_sideloads = shared.sideload_cache.lock().invalidate_beyond_messages(target);
            let dropped_recent = shared.recent_machines.lock().invalidate_beyond_messages(target);
            debug!(target, dropped_sideloads, dropped_recent, "inbox truncated");
        }
        self.install(rewind)?;
        Ok(self.machine.fully_processed_inbox().count)
    }
}
