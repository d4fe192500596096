mod checkpoint_ops;
mod error;
mod handle;
mod ingest;
mod mailbox;
mod queries;
mod reorg;
mod step;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::engine::store::KvStore;
use crate::engine::values::{Value, ValueCache};
use crate::kernel::execution_cursor::Replayer;
use crate::kernel::logs_cursor::LogsCursors;
use crate::kernel::machine_cache::{MachineCache, RecentMachineCache};
use crate::kernel::traits::{Machine, MachineLoader};

pub use error::CoreError;
pub use handle::LedgerCore;
pub use mailbox::MessageStatus;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Core tuning knobs.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Minimum gas between interval checkpoints.
    pub checkpoint_min_gas_interval: u64,
    /// Messages fed to a machine per replay or execution increment.
    pub message_group_size: u64,
    /// Number of registered logs consumers.
    pub logs_cursor_count: usize,
    pub sideload_cache_size: usize,
    pub recent_machine_cache_size: usize,
    /// Minimum gas between recent-machine cache entries.
    pub recent_machine_cache_interval: u64,
    pub value_cache_capacity: usize,
    /// How long an idle Core Loop waits for input before polling again.
    pub idle_poll_interval_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            checkpoint_min_gas_interval: 1_000_000,
            message_group_size: 10,
            logs_cursor_count: 1,
            sideload_cache_size: 20,
            recent_machine_cache_size: 10,
            recent_machine_cache_interval: 100_000,
            value_cache_capacity: 10_000,
            idle_poll_interval_ms: 50,
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State shared between the Core Loop thread and readers.
///
/// Only the Core Loop mutates the store, the caches (apart from the recent
/// cache, which cursor takers also feed) or the published machine. Lock
/// order: `reorg_lock`, then `logs_cursors`, then `values`.
pub(crate) struct CoreShared {
    pub(crate) config: CoreConfig,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) loader: Arc<dyn MachineLoader>,
    pub(crate) mailbox: mailbox::Mailbox,

    /// Held exclusively while the Core Loop truncates the inbox or outputs.
    /// Log reads take it shared: truncation releases value references.
    pub(crate) reorg_lock: RwLock<()>,

    pub(crate) values: Mutex<ValueCache>,
    pub(crate) logs_cursors: Mutex<LogsCursors>,
    pub(crate) sideload_cache: Mutex<MachineCache>,
    pub(crate) recent_machines: Mutex<RecentMachineCache>,
    pub(crate) last_machine: Mutex<Option<Box<dyn Machine>>>,

    pub(crate) initialized: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) abort: AtomicBool,
    pub(crate) machine_idle: AtomicBool,
    pub(crate) messages_read: AtomicU64,
    pub(crate) machine_error: AtomicBool,
    pub(crate) machine_error_text: Mutex<Option<String>>,
    /// Retention floor requested by the caller, applied by the Core Loop.
    pub(crate) retention_floor_input: Mutex<Option<u64>>,
}

impl CoreShared {
    pub(crate) fn new(store: Arc<dyn KvStore>, loader: Arc<dyn MachineLoader>, config: CoreConfig) -> Self {
        CoreShared {
            values: Mutex::new(ValueCache::new(config.value_cache_capacity)),
            logs_cursors: Mutex::new(LogsCursors::new(config.logs_cursor_count)),
            sideload_cache: Mutex::new(MachineCache::new(config.sideload_cache_size)),
            recent_machines: Mutex::new(RecentMachineCache::new(
                config.recent_machine_cache_size,
                config.recent_machine_cache_interval,
            )),
            last_machine: Mutex::new(None),
            mailbox: mailbox::Mailbox::new(),
            reorg_lock: RwLock::new(()),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            machine_idle: AtomicBool::new(false),
            messages_read: AtomicU64::new(0),
            machine_error: AtomicBool::new(false),
            machine_error_text: Mutex::new(None),
            retention_floor_input: Mutex::new(None),
            store,
            loader,
            config,
        }
    }

    pub(crate) fn replayer(&self) -> Replayer<'_> {
        Replayer {
            store: self.store.as_ref(),
            loader: self.loader.as_ref(),
            values: &self.values,
            recent: &self.recent_machines,
            message_group_size: self.config.message_group_size,
        }
    }
}

// =============================================================================
// CORE LOOP
// =============================================================================

/// Requests to the Core Loop thread. Each carries its own reply channel.
pub(crate) enum CoreCommand {
    /// New input is waiting (mailbox post or logs request).
    Wake,
    /// Save a checkpoint at the current machine position.
    SaveCheckpoint(Sender<Result<bool, CoreError>>),
    /// Roll back to a message count. Replies with the restored count.
    Reorg {
        message_count: u64,
        use_latest: bool,
        reply: Sender<Result<u64, CoreError>>,
    },
}

/// Outputs produced since the last checkpoint.
#[derive(Default)]
pub(crate) struct PendingOutputs {
    pub(crate) logs: Vec<Value>,
    pub(crate) sends: Vec<Vec<u8>>,
    /// `(block_number, gas_used)` block boundaries passed.
    pub(crate) sideloads: Vec<(u64, u64)>,
}

impl PendingOutputs {
    pub(crate) fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.sends.is_empty() && self.sideloads.is_empty()
    }
}

/// The single writer.
///
/// Owns:
/// - The live machine
/// - Outputs produced since the last checkpoint
/// - The checkpoint cadence marks
/// - The receiving end of the command channel
///
/// Runs on the Core Loop thread while started, and is parked in the
/// `LedgerCore` handle otherwise.
pub(crate) struct CoreLoop {
    pub(crate) shared: Arc<CoreShared>,
    pub(crate) machine: Box<dyn Machine>,
    pub(crate) pending: PendingOutputs,

    /// Gas the next interval checkpoint is measured from.
    pub(crate) checkpoint_anchor_gas: u64,

    /// Gas of the latest checkpoint (interval or in-progress).
    pub(crate) last_checkpoint_gas: u64,

    pub(crate) commands: Receiver<CoreCommand>,

    /// Manual checkpoint requests waiting for this iteration's save.
    pub(crate) checkpoint_replies: Vec<Sender<Result<bool, CoreError>>>,
}

impl CoreLoop {
    pub(crate) fn new(shared: Arc<CoreShared>, commands: Receiver<CoreCommand>) -> Self {
        let machine = shared.loader.genesis();
        CoreLoop {
            shared,
            machine,
            pending: PendingOutputs::default(),
            checkpoint_anchor_gas: 0,
            last_checkpoint_gas: 0,
            commands,
            checkpoint_replies: Vec::new(),
        }
    }

    pub(crate) fn machine(&self) -> &dyn Machine {
        self.machine.as_ref()
    }
}
