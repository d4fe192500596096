//! Core error types.

use crate::engine::StorageError;
use crate::kernel::logs_cursor::LogsCursorError;
use crate::kernel::traits::MachineError;

// =============================================================================
// CORE ERROR
// =============================================================================

/// Failures returned by the core's public operations.
///
/// Storage failures propagate unchanged; nothing here retries. Machine
/// failures on the Core Loop thread are not returned through this type but
/// captured into the sticky machine error.
#[derive(Debug)]
pub enum CoreError {
    /// The store rejected or failed an operation.
    Storage(StorageError),

    /// A machine could not be loaded, fed or run off the Core Loop thread.
    Machine(MachineError),

    /// `initialize()` has not completed.
    NotInitialized,

    /// The Core Loop thread is already running.
    AlreadyRunning,

    /// The Core Loop thread is not running (never started, or aborted).
    NotRunning,

    /// The execution cursor's machine has been taken.
    CursorTaken,

    /// A logs cursor refused the operation.
    LogsCursor(LogsCursorError),

    /// A checkpoint descriptor did not reproduce its machine.
    CheckpointMismatch { gas_used: u64, reason: String },
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Storage(e) => write!(f, "Storage error: {}", e),
            CoreError::Machine(e) => write!(f, "Machine error: {}", e),
            CoreError::NotInitialized => write!(f, "Core is not initialized"),
            CoreError::AlreadyRunning => write!(f, "Core thread is already running"),
            CoreError::NotRunning => write!(f, "Core thread is not running"),
            CoreError::CursorTaken => write!(f, "Execution cursor machine was already taken"),
            CoreError::LogsCursor(e) => write!(f, "Logs cursor error: {}", e),
            CoreError::CheckpointMismatch { gas_used, reason } => {
                write!(f, "Checkpoint at gas {} is inconsistent: {}", gas_used, reason)
            }
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Storage(e) => Some(e),
            CoreError::Machine(e) => Some(e),
            CoreError::LogsCursor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(e: StorageError) -> Self {
        CoreError::Storage(e)
    }
}

impl From<MachineError> for CoreError {
    fn from(e: MachineError) -> Self {
        CoreError::Machine(e)
    }
}

impl From<LogsCursorError> for CoreError {
    fn from(e: LogsCursorError) -> Self {
        CoreError::LogsCursor(e)
    }
}
