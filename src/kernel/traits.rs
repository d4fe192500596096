use std::error::Error;
use std::fmt;

use crate::engine::checkpoint::{MachineOutput, MachineStateKeys};
use crate::engine::format::Hash32;
use crate::engine::messages::{InboxState, MachineMessage};
use crate::engine::values::Value;

// =============================================================================
// RUN BUDGET
// =============================================================================

/// How far one `Machine::step` call may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunBudget {
    /// Stop once cumulative gas reaches this value.
    pub max_gas: u64,
    /// Allow finishing an instruction group that straddles `max_gas`.
    /// Without it the machine stops before any group that would overshoot.
    pub go_over_gas: bool,
    /// Stop at each block boundary so the caller can record a sideload.
    pub stop_at_sideload: bool,
}

impl RunBudget {
    pub fn to_gas(max_gas: u64) -> Self {
        RunBudget {
            max_gas,
            go_over_gas: false,
            stop_at_sideload: false,
        }
    }

    pub fn unlimited() -> Self {
        Self::to_gas(u64::MAX)
    }
}

/// Why a `Machine::step` call returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Reached (or, with `go_over_gas`, passed) `max_gas`.
    GasLimit,
    /// No queued input left.
    Idle,
    /// Finished the last message of this block; the next belongs to a later one.
    Sideload(u64),
}

// =============================================================================
// MACHINE ERROR
// =============================================================================

/// Machine failures. Deterministic: the same state and input fail the same way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MachineError {
    /// A message could not be executed. The machine does not advance past it.
    Execution { sequence_number: u64, reason: String },

    /// Delivered messages do not follow the machine's inbox position.
    OutOfOrder { expected: u64, found: u64 },

    /// Serialized state could not be produced or understood.
    InvalidState(String),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::Execution { sequence_number, reason } => {
                write!(f, "Execution failed at message {}: {}", sequence_number, reason)
            }
            MachineError::OutOfOrder { expected, found } => {
                write!(f, "Message {} delivered, expected {}", found, expected)
            }
            MachineError::InvalidState(msg) => write!(f, "Invalid machine state: {}", msg),
        }
    }
}

impl Error for MachineError {}

// =============================================================================
// MACHINE TRAIT
// =============================================================================

/// An opaque, deterministic VM execution state.
///
/// # Laws
///
/// 1. `step()` MUST be deterministic: same (state, queued messages, budget)
///    → same (state', logs, sends, outcome).
/// 2. `hash()` MUST cover everything `serialize_state()` captures, so a
///    machine rebuilt from its state keys has the same hash.
/// 3. Messages are consumed strictly in sequence-number order.
/// 4. A failed `step()` leaves the machine at the failing message.
pub trait Machine: Send + 'static {
    /// Queue messages for execution. They must continue from
    /// `next_message_index()`.
    fn deliver_messages(&mut self, messages: Vec<MachineMessage>) -> Result<(), MachineError>;

    /// Execute queued messages within `budget`.
    fn step(&mut self, budget: &RunBudget) -> Result<StepOutcome, MachineError>;

    /// Cumulative gas consumed.
    fn gas_used(&self) -> u64;

    /// Content hash of the execution state.
    fn hash(&self) -> Hash32;

    /// True when no queued input remains.
    fn is_idle(&self) -> bool;

    /// Logs produced since the last drain.
    fn drain_logs(&mut self) -> Vec<Value>;

    /// Sends produced since the last drain.
    fn drain_sends(&mut self) -> Vec<Vec<u8>>;

    /// Counters of everything produced so far.
    fn output(&self) -> MachineOutput;

    /// Sequence number of the next message to deliver (processed + queued).
    fn next_message_index(&self) -> u64;

    /// Serialized execution state (excluding queued input).
    fn serialize_state(&self) -> Result<Vec<u8>, MachineError>;

    /// Owned deep copy.
    fn boxed_clone(&self) -> Box<dyn Machine>;

    fn fully_processed_inbox(&self) -> InboxState {
        self.output().fully_processed_inbox
    }

    /// State keys plus the state value they reference.
    fn state_keys(&self) -> Result<(MachineStateKeys, Value), MachineError> {
        let state = Value::new(self.serialize_state()?);
        let keys = MachineStateKeys {
            machine_hash: self.hash(),
            output: self.output(),
            state_hash: state.hash(),
        };
        Ok((keys, state))
    }
}

/// Builds machines: the genesis machine and machines restored from state.
pub trait MachineLoader: Send + Sync + 'static {
    fn genesis(&self) -> Box<dyn Machine>;

    /// Rebuild from checkpointed keys and the state bytes they reference.
    fn load(&self, keys: &MachineStateKeys, state: &[u8]) -> Result<Box<dyn Machine>, MachineError>;
}

// =============================================================================
// TAGGED RECONSTRUCTION
// =============================================================================

/// Form the caller needs a historical machine in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineForm {
    /// A live, owned machine.
    Owned,
    /// Only the descriptor, without materializing a machine.
    StateKeys,
}

pub enum ReconstructedMachine {
    Owned(Box<dyn Machine>),
    StateKeys(MachineStateKeys),
}

impl ReconstructedMachine {
    pub fn gas_used(&self) -> u64 {
        match self {
            ReconstructedMachine::Owned(machine) => machine.gas_used(),
            ReconstructedMachine::StateKeys(keys) => keys.gas_used(),
        }
    }

    pub fn machine_hash(&self) -> Hash32 {
        match self {
            ReconstructedMachine::Owned(machine) => machine.hash(),
            ReconstructedMachine::StateKeys(keys) => keys.machine_hash,
        }
    }
}

impl fmt::Debug for ReconstructedMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconstructedMachine::Owned(machine) => {
                write!(f, "Owned(gas={})", machine.gas_used())
            }
            ReconstructedMachine::StateKeys(keys) => {
                write!(f, "StateKeys(gas={})", keys.gas_used())
            }
        }
    }
}
