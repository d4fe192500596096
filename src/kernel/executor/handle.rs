//! Public handle: owns the Core Loop thread and the command channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::engine::messages::MessageBatch;
use crate::engine::outputs::log_inserted_count;
use crate::engine::store::KvStore;
use crate::engine::StorageError;
use crate::kernel::logs_cursor::LogsCursors;
use crate::kernel::traits::{Machine, MachineLoader};

use super::error::CoreError;
use super::mailbox::MessageStatus;
use super::step::Iteration;
use super::{CoreCommand, CoreConfig, CoreLoop, CoreShared};

/// Handle to a ledger core.
///
/// Every mutation happens on the Core Loop. While the thread runs, requests
/// travel over the command channel; while it is stopped, the loop is parked
/// here and requests run on it directly from the calling thread.
pub struct LedgerCore {
    pub(crate) shared: Arc<CoreShared>,
    commands: Sender<CoreCommand>,
    parked: Mutex<Option<CoreLoop>>,
    thread: Mutex<Option<JoinHandle<CoreLoop>>>,
}

impl LedgerCore {
    pub fn new(store: Arc<dyn KvStore>, loader: Arc<dyn MachineLoader>, config: CoreConfig) -> Self {
        let shared = Arc::new(CoreShared::new(store, loader, config));
        let (commands, command_rx) = bounded(100);
        let core = CoreLoop::new(Arc::clone(&shared), command_rx);
        LedgerCore {
            shared,
            commands,
            parked: Mutex::new(Some(core)),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Resume from the latest checkpoint, writing a genesis checkpoint into
    /// an empty store first. Loads logs cursor positions.
    pub fn initialize(&self) -> Result<(), CoreError> {
        let mut parked = self.parked.lock();
        let core = parked.as_mut().ok_or(CoreError::AlreadyRunning)?;
        let shared = &self.shared;

        let snap = shared.store.snapshot();
        let log_count = log_inserted_count(snap.as_ref())?;
        *shared.logs_cursors.lock() = LogsCursors::load(snap.as_ref(), shared.config.logs_cursor_count, log_count)?;
        drop(snap);

        core.ensure_genesis_checkpoint()?;
        let messages = core.reorg_to_message_count_or_before(u64::MAX, true)?;
        shared.initialized.store(true, Ordering::SeqCst);
        info!(messages, gas = core.machine().gas_used(), log_count, "core initialized");
        Ok(())
    }

    pub fn initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().as_ref().map_or(false, |handle| !handle.is_finished())
    }

    /// Move the Core Loop onto its own thread.
    pub fn start_thread(&self) -> Result<(), CoreError> {
        if !self.initialized() {
            return Err(CoreError::NotInitialized);
        }
        let mut thread_slot = self.thread.lock();
        let core = self.parked.lock().take().ok_or(CoreError::AlreadyRunning)?;
        self.shared.abort.store(false, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("ledgercore-loop".to_string())
            .spawn(move || core.run())
            .map_err(StorageError::from)?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop the Core Loop thread after its current iteration and park the
    /// loop again. No-op if the thread is not running.
    pub fn abort_thread(&self) {
        let handle = match self.thread.lock().take() {
            Some(handle) => handle,
            None => return,
        };
        self.shared.abort.store(true, Ordering::SeqCst);
        let _ = self.commands.try_send(CoreCommand::Wake);
        match handle.join() {
            Ok(core) => *self.parked.lock() = Some(core),
            Err(_) => error!("core loop thread panicked"),
        }
        self.shared.abort.store(false, Ordering::SeqCst);
    }

    /// Iterate the parked loop until it has nothing left to do. Drives the
    /// core synchronously when no thread is running.
    pub fn run_until_idle(&self) -> Result<(), CoreError> {
        let mut parked = self.parked.lock();
        let core = parked.as_mut().ok_or(CoreError::AlreadyRunning)?;
        while core.iterate()? == Iteration::Continue {}
        Ok(())
    }

    /// Run `direct` on the parked loop, or send `command` to the running one
    /// and wait for its reply.
    fn request<T>(
        &self,
        direct: impl FnOnce(&mut CoreLoop) -> Result<T, CoreError>,
        command: impl FnOnce(Sender<Result<T, CoreError>>) -> CoreCommand,
    ) -> Result<T, CoreError> {
        if let Some(core) = self.parked.lock().as_mut() {
            return direct(core);
        }

        let (reply_tx, reply_rx) = bounded(1);
        self.commands.send(command(reply_tx)).map_err(|_| CoreError::NotRunning)?;
        let poll = Duration::from_millis(self.shared.config.idle_poll_interval_ms.max(1));
        loop {
            match reply_rx.recv_timeout(poll) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) if self.is_running() => {}
                Err(_) => return Err(CoreError::NotRunning),
            }
        }
    }

    pub(super) fn wake(&self) {
        let _ = self.commands.try_send(CoreCommand::Wake);
    }

    // =========================================================================
    // MESSAGE INGESTION
    // =========================================================================

    /// Post a batch. Returns false without blocking if the mailbox is not
    /// `Empty`.
    pub fn deliver_messages(&self, batch: MessageBatch) -> bool {
        let accepted = self.shared.mailbox.post(batch);
        if accepted {
            self.wake();
        }
        accepted
    }

    /// Mailbox status; reading `Success` acknowledges it.
    pub fn messages_status(&self) -> MessageStatus {
        self.shared.mailbox.status()
    }

    /// Leave the mailbox error state, returning the ingestion error text.
    pub fn messages_clear_error(&self) -> Option<String> {
        self.shared.mailbox.clear_error()
    }

    // =========================================================================
    // MACHINE STATE
    // =========================================================================

    /// True once the machine has processed every stored message.
    pub fn machine_idle(&self) -> bool {
        self.shared.machine_idle.load(Ordering::SeqCst)
    }

    pub fn machine_error(&self) -> Option<String> {
        if !self.shared.machine_error.load(Ordering::SeqCst) {
            return None;
        }
        self.shared.machine_error_text.lock().clone()
    }

    /// Clear the sticky machine error so execution resumes. Returns the
    /// error text.
    pub fn machine_clear_error(&self) -> Option<String> {
        if !self.shared.machine_error.swap(false, Ordering::SeqCst) {
            return None;
        }
        let text = self.shared.machine_error_text.lock().take();
        info!(error = ?text, "machine error cleared");
        self.wake();
        text
    }

    /// Messages the machine has fully processed.
    pub fn machine_messages_read(&self) -> u64 {
        self.shared.messages_read.load(Ordering::SeqCst)
    }

    /// Clone of the machine as of the last Core Loop iteration.
    pub fn get_last_machine(&self) -> Option<Box<dyn Machine>> {
        self.shared.last_machine.lock().as_ref().map(|machine| machine.boxed_clone())
    }

    // =========================================================================
    // CHECKPOINTS AND REORGS
    // =========================================================================

    /// Save a checkpoint at the current machine position. Returns false if
    /// an identical checkpoint already existed. Callers must serialize
    /// manual triggers.
    pub fn trigger_save_checkpoint(&self) -> Result<bool, CoreError> {
        self.request(|core| core.save_checkpoint_now(true), CoreCommand::SaveCheckpoint)
    }

    /// Let checkpoints older than the one covering `message_index` go.
    pub fn checkpoints_min_message_index(&self, message_index: u64) -> Result<(), CoreError> {
        *self.shared.retention_floor_input.lock() = Some(message_index);
        if let Some(core) = self.parked.lock().as_mut() {
            return core.apply_retention_floor();
        }
        self.wake();
        Ok(())
    }

    /// Roll back to the newest state with at most `message_count` messages
    /// processed. With `use_latest`, the covering checkpoint is used as is;
    /// otherwise stored messages past `message_count` are dropped and the
    /// machine is replayed to exactly the kept count. Returns the message
    /// count restored.
    pub fn reorg_to_message_count_or_before(&self, message_count: u64, use_latest: bool) -> Result<u64, CoreError> {
        self.request(
            |core| core.reorg_to_message_count_or_before(message_count, use_latest),
            |reply| CoreCommand::Reorg {
                message_count,
                use_latest,
                reply,
            },
        )
    }
}

impl Drop for LedgerCore {
    fn drop(&mut self) {
        self.abort_thread();
    }
}
