//! Reference deterministic machine.
//!
//! Each inbox message is one indivisible instruction group. Executing it:
//! - costs `BASE_MESSAGE_GAS + PER_BYTE_GAS * len(data)`
//! - emits one log: the message digest
//! - emits one send when the payload starts with `send:` (the rest is the send)
//! - fails when the payload starts with `panic:`, stalling the machine there

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::engine::checkpoint::{MachineOutput, MachineStateKeys};
use crate::engine::format::{hash_bytes, hash_parts, Hash32, ZERO_HASH};
use crate::engine::messages::{InboxState, MachineMessage};
use crate::engine::values::Value;
use crate::kernel::traits::{Machine, MachineError, MachineLoader, RunBudget, StepOutcome};

pub const BASE_MESSAGE_GAS: u64 = 1_000;
pub const PER_BYTE_GAS: u64 = 10;
pub const SEND_PREFIX: &[u8] = b"send:";
pub const PANIC_PREFIX: &[u8] = b"panic:";

const HASH_DOMAIN: &[u8] = b"ledgercore.reference-machine";
const DIGEST_DOMAIN: &[u8] = b"ledgercore.reference-digest";

/// Gas charged for one message.
pub fn message_gas(data: &[u8]) -> u64 {
    BASE_MESSAGE_GAS + PER_BYTE_GAS * data.len() as u64
}

// =============================================================================
// STATE
// =============================================================================

/// Everything that survives a checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ReferenceState {
    gas_used: u64,
    inbox: InboxState,
    log_count: u64,
    send_count: u64,
    last_block: Option<u64>,
    last_sideload: Option<u64>,
    digest: Hash32,
    /// Block boundary already reported as a sideload stop. Not hashed: a
    /// replay without sideload stops reaches the same hash.
    reported_boundary: Option<u64>,
}

fn encode_optional(value: Option<u64>) -> [u8; 9] {
    let mut out = [0u8; 9];
    if let Some(v) = value {
        out[0] = 1;
        out[1..].copy_from_slice(&v.to_be_bytes());
    }
    out
}

// =============================================================================
// MACHINE
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct ReferenceMachine {
    state: ReferenceState,
    queue: VecDeque<MachineMessage>,
    logs: Vec<Value>,
    sends: Vec<Vec<u8>>,
}

impl ReferenceMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_state(state: ReferenceState) -> Self {
        ReferenceMachine {
            state,
            ..Self::default()
        }
    }

    /// Running digest over every executed message.
    pub fn digest(&self) -> Hash32 {
        self.state.digest
    }

    fn execute(&mut self, message: MachineMessage) {
        let digest = hash_bytes(&message.data);
        self.state.gas_used += message_gas(&message.data);
        self.state.digest = hash_parts(
            DIGEST_DOMAIN,
            &[&self.state.digest, &message.sequence_number.to_be_bytes(), &digest],
        );

        self.logs.push(Value::new(digest.to_vec()));
        self.state.log_count += 1;
        if let Some(payload) = message.data.strip_prefix(SEND_PREFIX) {
            self.sends.push(payload.to_vec());
            self.state.send_count += 1;
        }

        if let Some(last) = self.state.last_block {
            if message.block_number > last {
                self.state.last_sideload = Some(last);
            }
        }
        self.state.last_block = Some(message.block_number);
        self.state.inbox = InboxState::after(&message);
    }
}

impl Machine for ReferenceMachine {
    fn deliver_messages(&mut self, messages: Vec<MachineMessage>) -> Result<(), MachineError> {
        let mut expected = self.next_message_index();
        for message in &messages {
            if message.sequence_number != expected {
                return Err(MachineError::OutOfOrder {
                    expected,
                    found: message.sequence_number,
                });
            }
            expected += 1;
        }
        self.queue.extend(messages);
        Ok(())
    }

    fn step(&mut self, budget: &RunBudget) -> Result<StepOutcome, MachineError> {
        loop {
            if self.state.gas_used >= budget.max_gas {
                return Ok(StepOutcome::GasLimit);
            }
            let next = match self.queue.front() {
                Some(next) => next,
                None => return Ok(StepOutcome::Idle),
            };

            if budget.stop_at_sideload {
                if let Some(last) = self.state.last_block {
                    if next.block_number > last && self.state.reported_boundary != Some(last) {
                        self.state.reported_boundary = Some(last);
                        return Ok(StepOutcome::Sideload(last));
                    }
                }
            }

            let cost = message_gas(&next.data);
            if !budget.go_over_gas && self.state.gas_used.saturating_add(cost) > budget.max_gas {
                return Ok(StepOutcome::GasLimit);
            }
            if next.data.starts_with(PANIC_PREFIX) {
                return Err(MachineError::Execution {
                    sequence_number: next.sequence_number,
                    reason: String::from_utf8_lossy(&next.data[PANIC_PREFIX.len()..]).into_owned(),
                });
            }

            if let Some(message) = self.queue.pop_front() {
                self.execute(message);
            }
        }
    }

    fn gas_used(&self) -> u64 {
        self.state.gas_used
    }

    fn hash(&self) -> Hash32 {
        let s = &self.state;
        hash_parts(
            HASH_DOMAIN,
            &[
                &s.gas_used.to_be_bytes(),
                &s.inbox.count.to_be_bytes(),
                &s.inbox.accumulator,
                &s.log_count.to_be_bytes(),
                &s.send_count.to_be_bytes(),
                &encode_optional(s.last_block),
                &encode_optional(s.last_sideload),
                &s.digest,
            ],
        )
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    fn drain_logs(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.logs)
    }

    fn drain_sends(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sends)
    }

    fn output(&self) -> MachineOutput {
        MachineOutput {
            fully_processed_inbox: self.state.inbox,
            gas_used: self.state.gas_used,
            log_count: self.state.log_count,
            send_count: self.state.send_count,
            last_sideload: self.state.last_sideload,
        }
    }

    fn next_message_index(&self) -> u64 {
        self.state.inbox.count + self.queue.len() as u64
    }

    fn serialize_state(&self) -> Result<Vec<u8>, MachineError> {
        bincode::serialize(&self.state).map_err(|e| MachineError::InvalidState(e.to_string()))
    }

    fn boxed_clone(&self) -> Box<dyn Machine> {
        Box::new(self.clone())
    }
}

/// Loader for `ReferenceMachine`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceLoader;

impl MachineLoader for ReferenceLoader {
    fn genesis(&self) -> Box<dyn Machine> {
        Box::new(ReferenceMachine::new())
    }

    fn load(&self, keys: &MachineStateKeys, state: &[u8]) -> Result<Box<dyn Machine>, MachineError> {
        let state: ReferenceState =
            bincode::deserialize(state).map_err(|e| MachineError::InvalidState(e.to_string()))?;
        if state.gas_used != keys.gas_used() || state.inbox != keys.output.fully_processed_inbox {
            return Err(MachineError::InvalidState(format!(
                "state at gas {} does not match keys at gas {}",
                state.gas_used,
                keys.gas_used()
            )));
        }
        Ok(Box::new(ReferenceMachine::from_state(state)))
    }
}
