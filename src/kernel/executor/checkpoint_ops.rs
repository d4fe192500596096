use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::engine::checkpoint::{
    checkpoint_anchor_gas, delete_checkpoint, delete_old_checkpoints, is_checkpoints_empty, max_checkpoint_gas,
    save_checkpoint, MachineOutput,
};
use crate::engine::outputs::{
    log_inserted_count, save_logs, save_retention_floor, save_sends, save_sideload_position, send_inserted_count,
};
use crate::engine::store::WriteTxn;
use crate::engine::values::Value;
use crate::engine::StorageError;

use super::error::CoreError;
use super::{CoreLoop, PendingOutputs};

/// Append the outputs a machine produced since some earlier point, given its
/// counters after producing them. Entries already stored (from an earlier
/// run over the same messages) are skipped. Returns the index of `logs[0]`.
pub(super) fn persist_outputs(
    txn: &mut WriteTxn,
    output: &MachineOutput,
    logs: &[Value],
    sends: &[Vec<u8>],
) -> Result<u64, CoreError> {
    let first_log = output.log_count.checked_sub(logs.len() as u64).ok_or_else(|| {
        StorageError::InvalidInput(format!("{} logs but log count is {}", logs.len(), output.log_count))
    })?;
    let first_send = output.send_count.checked_sub(sends.len() as u64).ok_or_else(|| {
        StorageError::InvalidInput(format!("{} sends but send count is {}", sends.len(), output.send_count))
    })?;

    let stored_logs = log_inserted_count(&*txn)?;
    let stored_sends = send_inserted_count(&*txn)?;
    if stored_logs < first_log || stored_sends < first_send {
        return Err(StorageError::InvalidInput(format!(
            "outputs start at log {} / send {} but {} / {} are stored",
            first_log, first_send, stored_logs, stored_sends
        ))
        .into());
    }

    let skip_logs = ((stored_logs - first_log) as usize).min(logs.len());
    save_logs(txn, first_log + skip_logs as u64, &logs[skip_logs..])?;
    let skip_sends = ((stored_sends - first_send) as usize).min(sends.len());
    save_sends(txn, first_send + skip_sends as u64, &sends[skip_sends..])?;
    Ok(first_log)
}

impl CoreLoop {
    /// Save a checkpoint at the current machine position, together with
    /// every output produced since the last one, in one transaction.
    ///
    /// # Semantics
    ///
    /// 1. Append pending logs, sends and sideload positions
    /// 2. Drop the previous checkpoint if it was an in-progress one
    /// 3. Write the new checkpoint (no-op if identical to the stored one)
    /// 4. Commit, then pin the new logs for cursor delivery
    ///
    /// An `anchor` checkpoint restarts the gas interval; others are
    /// in-progress and get replaced by the next save.
    pub(crate) fn save_checkpoint_now(&mut self, anchor: bool) -> Result<bool, CoreError> {
        let (keys, state) = self.machine.state_keys()?;
        let shared = Arc::clone(&self.shared);

        let mut txn = shared.store.begin();
        let first_log = persist_outputs(&mut txn, &keys.output, &self.pending.logs, &self.pending.sends)?;
        for &(block, gas) in &self.pending.sideloads {
            save_sideload_position(&mut txn, block, gas);
        }
        let replaces_in_progress =
            self.last_checkpoint_gas > self.checkpoint_anchor_gas && self.last_checkpoint_gas < keys.gas_used();
        if replaces_in_progress {
            delete_checkpoint(&mut txn, self.last_checkpoint_gas)?;
        }
        let saved = save_checkpoint(&mut txn, &keys, &state)?;
        shared.store.commit(txn.into_batch())?;

        let pending = std::mem::take(&mut self.pending);
        if shared.config.logs_cursor_count > 0 {
            let mut values = shared.values.lock();
            let mut unpinned = 0usize;
            for (offset, log) in pending.logs.into_iter().enumerate() {
                if !values.pin_log(first_log + offset as u64, log) {
                    unpinned += 1;
                }
            }
            if unpinned > 0 {
                debug!(unpinned, pinned = values.pinned_count(), "log pins at capacity");
            }
        }

        self.last_checkpoint_gas = keys.gas_used();
        if anchor {
            self.checkpoint_anchor_gas = keys.gas_used();
        }
        debug!(
            gas = keys.gas_used(),
            messages = keys.message_count(),
            logs = keys.output.log_count,
            sends = keys.output.send_count,
            anchor,
            saved,
            "checkpoint"
        );
        Ok(saved)
    }

    /// Checkpoint if the interval elapsed, a caller asked for one, or the
    /// machine settled (caught up or stalled) with unsaved progress.
    pub(super) fn maybe_checkpoint(&mut self) -> Result<(), CoreError> {
        let gas = self.machine.gas_used();
        let manual = !self.checkpoint_replies.is_empty();
        let due = gas >= self
            .checkpoint_anchor_gas
            .saturating_add(self.shared.config.checkpoint_min_gas_interval);
        let settled = gas > self.last_checkpoint_gas
            && (self.shared.machine_idle.load(Ordering::SeqCst) || self.shared.machine_error.load(Ordering::SeqCst));
        if !(manual || due || settled) {
            return Ok(());
        }

        let result = self.save_checkpoint_now(manual || due);
        let replies = std::mem::take(&mut self.checkpoint_replies);
        match result {
            Ok(saved) => {
                for reply in replies {
                    let _ = reply.send(Ok(saved));
                }
                Ok(())
            }
            Err(e) if replies.is_empty() => Err(e),
            Err(e) => {
                error!(error = %e, "requested checkpoint failed");
                let text = e.to_string();
                let mut replies = replies.into_iter();
                if let Some(first) = replies.next() {
                    let _ = first.send(Err(e));
                }
                for reply in replies {
                    let _ = reply.send(Err(StorageError::InvalidInput(text.clone()).into()));
                }
                Ok(())
            }
        }
    }

    /// Re-derive the cadence marks from the stored checkpoints.
    pub(super) fn restore_checkpoint_marks(&mut self) -> Result<(), CoreError> {
        let snap = self.shared.store.snapshot();
        self.last_checkpoint_gas = max_checkpoint_gas(snap.as_ref())?;
        self.checkpoint_anchor_gas =
            checkpoint_anchor_gas(snap.as_ref(), self.shared.config.checkpoint_min_gas_interval)?;
        Ok(())
    }

    /// Checkpoint the genesis machine into an empty store.
    pub(super) fn ensure_genesis_checkpoint(&mut self) -> Result<(), CoreError> {
        if !is_checkpoints_empty(self.shared.store.snapshot().as_ref())? {
            return Ok(());
        }
        self.pending = PendingOutputs::default();
        self.save_checkpoint_now(true)?;
        info!(hash = ?self.machine.hash(), "saved genesis checkpoint");
        Ok(())
    }

    /// Apply a retention floor posted through `checkpoints_min_message_index`.
    pub(super) fn apply_retention_floor(&mut self) -> Result<(), CoreError> {
        let floor = match self.shared.retention_floor_input.lock().take() {
            Some(floor) => floor,
            None => return Ok(()),
        };
        let mut txn = self.shared.store.begin();
        let removed = delete_old_checkpoints(&mut txn, floor)?;
        save_retention_floor(&mut txn, floor);
        self.shared.store.commit(txn.into_batch())?;
        debug!(floor, removed, "applied checkpoint retention floor");
        Ok(())
    }
}
