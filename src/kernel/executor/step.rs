//! Core Loop iteration.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::engine::messages::{message_entry_inserted_count, read_next_messages};
use crate::engine::outputs::{log_inserted_count, save_cursor_position};
use crate::kernel::traits::{MachineError, RunBudget, StepOutcome};

use super::error::CoreError;
use super::{CoreCommand, CoreLoop};

/// What one iteration accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Iteration {
    /// Something changed; iterate again right away.
    Continue,
    /// Nothing to do until new input arrives.
    Idle,
    /// Abort was requested.
    Stop,
}

impl CoreLoop {
    /// Run until aborted. Returns the loop so the handle can park it.
    pub(crate) fn run(mut self) -> Self {
        self.shared.running.store(true, Ordering::SeqCst);
        info!(gas = self.machine.gas_used(), "core loop started");

        loop {
            match self.iterate() {
                Ok(Iteration::Continue) => {}
                Ok(Iteration::Idle) => self.wait_for_input(),
                Ok(Iteration::Stop) => break,
                Err(e) => {
                    error!(error = %e, "core loop iteration failed");
                    self.record_machine_error(e.to_string());
                    self.wait_for_input();
                }
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        info!(gas = self.machine.gas_used(), "core loop stopped");
        self
    }

    fn wait_for_input(&mut self) {
        let timeout = Duration::from_millis(self.shared.config.idle_poll_interval_ms);
        match self.commands.recv_timeout(timeout) {
            Ok(command) => self.handle_command(command),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
    }

    pub(crate) fn handle_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Wake => {}
            CoreCommand::SaveCheckpoint(reply) => self.checkpoint_replies.push(reply),
            CoreCommand::Reorg {
                message_count,
                use_latest,
                reply,
            } => {
                let result = self.reorg_to_message_count_or_before(message_count, use_latest);
                if let Err(e) = &result {
                    warn!(message_count, error = %e, "reorg failed");
                }
                let _ = reply.send(result);
            }
        }
    }

    /// One pass of the loop.
    ///
    /// # Semantics
    ///
    /// 1. Drain commands
    /// 2. On abort: finish requested checkpoints, then stop
    /// 3. Ingest the mailbox batch
    /// 4. Apply a posted retention floor
    /// 5. Persist logs cursor confirmations and fill outstanding requests
    /// 6. Run the machine one increment
    /// 7. Checkpoint when due, requested or settled
    /// 8. Publish the last machine and offer it to the recent cache
    pub(crate) fn iterate(&mut self) -> Result<Iteration, CoreError> {
        // Step 1
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }

        // Step 2
        if self.shared.abort.load(Ordering::SeqCst) {
            if !self.checkpoint_replies.is_empty() {
                self.maybe_checkpoint()?;
            }
            return Ok(Iteration::Stop);
        }

        // Steps 3-5
        let mut progressed = self.ingest_pending();
        self.apply_retention_floor()?;
        progressed |= self.service_logs_cursors()?;

        // Step 6
        progressed |= self.execute()?;

        // Step 7
        let checkpoint_gas = self.last_checkpoint_gas;
        self.maybe_checkpoint()?;
        progressed |= self.last_checkpoint_gas != checkpoint_gas;

        // Step 8
        if progressed {
            *self.shared.last_machine.lock() = Some(self.machine.boxed_clone());
            self.shared.recent_machines.lock().offer(self.machine.as_ref());
            Ok(Iteration::Continue)
        } else {
            Ok(Iteration::Idle)
        }
    }

    /// Persist confirmed cursor positions, release value pins every cursor
    /// has passed, and fill outstanding requests from the stored logs.
    fn service_logs_cursors(&mut self) -> Result<bool, CoreError> {
        let shared = Arc::clone(&self.shared);
        if shared.config.logs_cursor_count == 0 {
            return Ok(false);
        }

        let mut cursors = shared.logs_cursors.lock();
        let confirmed = cursors.take_confirmed();
        if !confirmed.is_empty() {
            let mut txn = shared.store.begin();
            for &(index, position) in &confirmed {
                save_cursor_position(&mut txn, index, position);
            }
            shared.store.commit(txn.into_batch())?;
            let floor = cursors.min_confirmed_position();
            let mut values = shared.values.lock();
            values.release_below(floor);
            let pruned = values.prune();
            debug!(cursors = confirmed.len(), floor, pruned, "persisted logs cursor confirmations");
        }

        let snap = shared.store.snapshot();
        let log_count = log_inserted_count(snap.as_ref())?;
        let ready = cursors.fulfill(snap.as_ref(), &mut shared.values.lock(), log_count)?;
        Ok(!confirmed.is_empty() || !ready.is_empty())
    }

    /// Feed the machine if it is idle and run it up to the next checkpoint
    /// boundary. Returns true if the machine advanced.
    fn execute(&mut self) -> Result<bool, CoreError> {
        let shared = Arc::clone(&self.shared);
        if shared.machine_error.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let snap = shared.store.snapshot();
        let gas_before = self.machine.gas_used();
        let mut fed = false;
        if self.machine.is_idle() {
            let messages = read_next_messages(
                snap.as_ref(),
                &self.machine.fully_processed_inbox(),
                shared.config.message_group_size,
            )?;
            if !messages.is_empty() {
                if let Err(e) = self.machine.deliver_messages(messages) {
                    self.record_machine_error(e.to_string());
                    return Ok(false);
                }
                fed = true;
            }
        }

        if fed || !self.machine.is_idle() {
            let budget = RunBudget {
                max_gas: self
                    .checkpoint_anchor_gas
                    .saturating_add(shared.config.checkpoint_min_gas_interval),
                go_over_gas: true,
                stop_at_sideload: true,
            };
            let machine = &mut self.machine;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| machine.step(&budget)))
                .unwrap_or_else(|payload| Err(MachineError::InvalidState(panic_message(payload.as_ref()))));

            self.pending.logs.extend(self.machine.drain_logs());
            self.pending.sends.extend(self.machine.drain_sends());
            match outcome {
                Ok(StepOutcome::Sideload(block)) => {
                    let gas = self.machine.gas_used();
                    self.pending.sideloads.push((block, gas));
                    shared.sideload_cache.lock().insert(block, self.machine.boxed_clone());
                    debug!(block, gas, "block boundary");
                }
                Ok(StepOutcome::GasLimit) | Ok(StepOutcome::Idle) => {}
                Err(e) => self.record_machine_error(e.to_string()),
            }
        }

        let inbox = self.machine.fully_processed_inbox();
        let caught_up = self.machine.is_idle() && inbox.count >= message_entry_inserted_count(snap.as_ref())?;
        shared.machine_idle.store(caught_up, Ordering::SeqCst);
        shared.messages_read.store(inbox.count, Ordering::SeqCst);
        Ok(fed || self.machine.gas_used() != gas_before)
    }

    /// Stall the machine with a sticky error until the caller clears it.
    pub(super) fn record_machine_error(&self, message: String) {
        error!(gas = self.machine.gas_used(), error = %message, "machine stalled");
        *self.shared.machine_error_text.lock() = Some(message);
        self.shared.machine_error.store(true, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("machine panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("machine panicked: {}", msg)
    } else {
        "machine panicked".to_string()
    }
}
