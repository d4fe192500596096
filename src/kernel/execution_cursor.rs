//! Execution Cursor: lazy replay to a historical gas position.
//!
//! A cursor starts from the nearest usable base (a recent cached machine or
//! the nearest checkpoint at or before the target) and stays lazy, holding
//! the checkpoint's state keys and its state value, until replay actually
//! needs a machine. The value is captured when the cursor is opened, so a
//! later save that deletes the checkpoint cannot strand the cursor.
//! Replay feeds `message_group_size` messages at a time from a fresh store
//! snapshot per group, so a concurrent reorg is noticed at the next group.

use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::checkpoint::{get_checkpoint, get_checkpoint_using_gas, MachineOutput, MachineStateKeys};
use crate::engine::format::Hash32;
use crate::engine::messages::{is_valid, read_next_messages, InboxState};
use crate::engine::store::{Column, KvStore, ReadSnapshot};
use crate::engine::values::{Value, ValueCache};
use crate::engine::StorageError;
use crate::kernel::executor::CoreError;
use crate::kernel::machine_cache::RecentMachineCache;
use crate::kernel::traits::{Machine, MachineForm, MachineLoader, ReconstructedMachine, RunBudget, StepOutcome};

enum CursorState {
    Lazy { keys: MachineStateKeys, state: Value },
    Materialized(Box<dyn Machine>),
    Taken,
}

/// Handle for replaying the machine to a historical gas.
pub struct ExecutionCursor {
    state: CursorState,
}

impl ExecutionCursor {
    pub fn is_materialized(&self) -> bool {
        matches!(self.state, CursorState::Materialized(_))
    }

    pub fn is_taken(&self) -> bool {
        matches!(self.state, CursorState::Taken)
    }

    pub fn output(&self) -> Result<MachineOutput, CoreError> {
        match &self.state {
            CursorState::Lazy { keys, .. } => Ok(keys.output),
            CursorState::Materialized(machine) => Ok(machine.output()),
            CursorState::Taken => Err(CoreError::CursorTaken),
        }
    }

    /// Gas the cursor has actually reached.
    pub fn gas_used(&self) -> Result<u64, CoreError> {
        Ok(self.output()?.gas_used)
    }

    pub fn inbox_state(&self) -> Result<InboxState, CoreError> {
        Ok(self.output()?.fully_processed_inbox)
    }

    pub fn machine_hash(&self) -> Result<Hash32, CoreError> {
        match &self.state {
            CursorState::Lazy { keys, .. } => Ok(keys.machine_hash),
            CursorState::Materialized(machine) => Ok(machine.hash()),
            CursorState::Taken => Err(CoreError::CursorTaken),
        }
    }
}

impl fmt::Debug for ExecutionCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            CursorState::Lazy { keys, .. } => write!(f, "ExecutionCursor::Lazy(gas={})", keys.gas_used()),
            CursorState::Materialized(machine) => {
                write!(f, "ExecutionCursor::Materialized(gas={})", machine.gas_used())
            }
            CursorState::Taken => write!(f, "ExecutionCursor::Taken"),
        }
    }
}

/// Rebuild a machine from checkpointed keys, checking it reproduces the
/// recorded hash.
pub fn reconstruct_machine(
    snap: &dyn ReadSnapshot,
    loader: &dyn MachineLoader,
    values: &Mutex<ValueCache>,
    keys: &MachineStateKeys,
) -> Result<Box<dyn Machine>, CoreError> {
    let state = load_state(snap, values, keys)?;
    load_verified(loader, keys, &state)
}

fn load_state(snap: &dyn ReadSnapshot, values: &Mutex<ValueCache>, keys: &MachineStateKeys) -> Result<Value, CoreError> {
    let state = values
        .lock()
        .get_or_load(snap, &keys.state_hash)?
        .ok_or_else(|| StorageError::NotFound {
            column: Column::Values,
            key: keys.state_hash.to_vec(),
        })?;
    Ok(state)
}

fn load_verified(
    loader: &dyn MachineLoader,
    keys: &MachineStateKeys,
    state: &Value,
) -> Result<Box<dyn Machine>, CoreError> {
    let machine = loader.load(keys, state.bytes())?;
    if machine.hash() != keys.machine_hash {
        return Err(CoreError::CheckpointMismatch {
            gas_used: keys.gas_used(),
            reason: "reconstructed machine hash differs from recorded hash".to_string(),
        });
    }
    Ok(machine)
}

// =============================================================================
// REPLAYER
// =============================================================================

/// Everything cursor replay reads. Borrowed from the core's shared state.
pub struct Replayer<'a> {
    pub store: &'a dyn KvStore,
    pub loader: &'a dyn MachineLoader,
    pub values: &'a Mutex<ValueCache>,
    pub recent: &'a Mutex<RecentMachineCache>,
    pub message_group_size: u64,
}

impl<'a> Replayer<'a> {
    /// Cursor positioned at `gas`, or at the last instruction-group boundary
    /// below it when exact landing is impossible.
    pub fn open(&self, gas: u64) -> Result<ExecutionCursor, CoreError> {
        let mut cursor = self.base_cursor(gas)?;
        self.advance(&mut cursor, gas, false)?;
        Ok(cursor)
    }

    fn base_cursor(&self, gas: u64) -> Result<ExecutionCursor, CoreError> {
        let snap = self.store.snapshot();
        let checkpoint = get_checkpoint_using_gas(snap.as_ref(), gas, false)?;

        let mut cached = self.recent.lock().get_at_or_before(gas).map(|(_, machine)| machine);
        if let Some(machine) = &cached {
            if !is_valid(snap.as_ref(), &machine.fully_processed_inbox())? {
                cached = None;
            }
        }

        let state = match (cached, checkpoint) {
            (Some(machine), Some(keys)) if keys.gas_used() <= machine.gas_used() => {
                CursorState::Materialized(machine)
            }
            (_, Some(keys)) => {
                let state = load_state(snap.as_ref(), self.values, &keys)?;
                CursorState::Lazy { keys, state }
            }
            (Some(machine), None) => CursorState::Materialized(machine),
            (None, None) => CursorState::Materialized(self.loader.genesis()),
        };
        Ok(ExecutionCursor { state })
    }

    fn materialize<'c>(&self, cursor: &'c mut ExecutionCursor) -> Result<&'c mut Box<dyn Machine>, CoreError> {
        if let CursorState::Lazy { keys, state } = &cursor.state {
            debug!(gas = keys.gas_used(), "materializing execution cursor");
            let machine = load_verified(self.loader, keys, state)?;
            cursor.state = CursorState::Materialized(machine);
        }
        match &mut cursor.state {
            CursorState::Materialized(machine) => Ok(machine),
            _ => Err(CoreError::CursorTaken),
        }
    }

    /// Replay forward until `max_gas`, passing it only when `go_over_gas`
    /// lets the machine finish a straddling instruction group. Stops early
    /// when the inbox has nothing further.
    ///
    /// A cursor whose inbox was reorged away restarts from the nearest
    /// surviving base.
    pub fn advance(&self, cursor: &mut ExecutionCursor, max_gas: u64, go_over_gas: bool) -> Result<(), CoreError> {
        let budget = RunBudget {
            max_gas,
            go_over_gas,
            stop_at_sideload: false,
        };
        let mut restarted = false;

        loop {
            let position = cursor.gas_used()?;
            if position >= max_gas {
                return Ok(());
            }

            let snap = self.store.snapshot();
            if !is_valid(snap.as_ref(), &cursor.inbox_state()?)? {
                if restarted {
                    return Err(CoreError::CheckpointMismatch {
                        gas_used: position,
                        reason: "replay base does not match the persisted inbox".to_string(),
                    });
                }
                debug!(gas = position, "execution cursor invalidated by reorg, restarting");
                *cursor = self.base_cursor(position)?;
                restarted = true;
                continue;
            }

            let machine = self.materialize(cursor)?;
            let mut fed = false;
            if machine.is_idle() {
                let messages =
                    read_next_messages(snap.as_ref(), &machine.fully_processed_inbox(), self.message_group_size)?;
                if !messages.is_empty() {
                    machine.deliver_messages(messages)?;
                    fed = true;
                }
            }

            let outcome = machine.step(&budget)?;
            machine.drain_logs();
            machine.drain_sends();
            match outcome {
                StepOutcome::GasLimit => return Ok(()),
                StepOutcome::Idle if !fed => return Ok(()),
                _ => {}
            }
        }
    }

    /// Move the cursor's machine out. The cursor cannot be used afterwards.
    /// A clone is offered to the recent-machine cache.
    pub fn take(&self, cursor: &mut ExecutionCursor) -> Result<Box<dyn Machine>, CoreError> {
        self.materialize(cursor)?;
        match std::mem::replace(&mut cursor.state, CursorState::Taken) {
            CursorState::Materialized(machine) => {
                self.recent.lock().offer(machine.as_ref());
                Ok(machine)
            }
            _ => Err(CoreError::CursorTaken),
        }
    }

    /// Machine at (or just below) `gas` in the form the caller needs.
    pub fn machine_at_gas(&self, gas: u64, form: MachineForm) -> Result<ReconstructedMachine, CoreError> {
        if form == MachineForm::StateKeys {
            if let Some(keys) = get_checkpoint(self.store.snapshot().as_ref(), gas)? {
                return Ok(ReconstructedMachine::StateKeys(keys));
            }
        }

        let mut cursor = self.open(gas)?;
        match form {
            MachineForm::Owned => Ok(ReconstructedMachine::Owned(self.take(&mut cursor)?)),
            MachineForm::StateKeys => match cursor.state {
                CursorState::Lazy { keys, .. } => Ok(ReconstructedMachine::StateKeys(keys)),
                CursorState::Materialized(machine) => {
                    let (keys, _) = machine.state_keys()?;
                    Ok(ReconstructedMachine::StateKeys(keys))
                }
                CursorState::Taken => Err(CoreError::CursorTaken),
            },
        }
    }
}
