//! Kernel module: the execution side of the ledger core.
//!
//! The Kernel sits on top of the storage engine and provides:
//! - The machine abstraction and a deterministic reference machine
//! - Machine reconstruction and lazy replay (execution cursors)
//! - Snapshot caches for block boundaries and recent states
//! - Logs cursors for downstream consumers
//! - The Core Loop, the single writer that executes, checkpoints and reorgs

pub mod execution_cursor;
pub mod executor;
pub mod logs_cursor;
pub mod machine_cache;
pub mod reference;
pub mod traits;

pub use execution_cursor::{reconstruct_machine, ExecutionCursor, Replayer};
pub use executor::{CoreConfig, CoreError, LedgerCore, MessageStatus};
pub use logs_cursor::{LogsCursorBatch, LogsCursorError, LogsCursorStatus, LogsCursors};
pub use machine_cache::{MachineCache, RecentMachineCache};
pub use reference::{message_gas, ReferenceLoader, ReferenceMachine};
pub use traits::{
    Machine, MachineError, MachineForm, MachineLoader, ReconstructedMachine, RunBudget, StepOutcome,
};
