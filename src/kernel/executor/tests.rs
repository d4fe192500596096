//! Core Loop tests, driven synchronously through `run_until_idle` unless a
//! test is about the thread itself.

use super::*;
use crate::engine::batch::BatchBuilder;
use crate::engine::checkpoint::{checkpoint_gas_values, get_checkpoint};
use crate::engine::format::{hash_bytes, Hash32};
use crate::engine::messages::{read_next_messages, InboxMessage, InboxState};
use crate::engine::store::MemoryStore;
use crate::engine::StorageError;
use crate::kernel::logs_cursor::{LogsCursorError, LogsCursorStatus};
use crate::kernel::reference::{message_gas, ReferenceLoader, ReferenceMachine};
use crate::kernel::traits::{MachineForm, ReconstructedMachine, RunBudget};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> CoreConfig {
    CoreConfig {
        checkpoint_min_gas_interval: 5_000,
        message_group_size: 2,
        logs_cursor_count: 1,
        sideload_cache_size: 4,
        recent_machine_cache_size: 4,
        recent_machine_cache_interval: 1_000,
        value_cache_capacity: 1_000,
        idle_poll_interval_ms: 5,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    core: LedgerCore,
    builder: BatchBuilder,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    fn with_store(store: Arc<MemoryStore>) -> Self {
        Self::with_config(store, test_config())
    }

    fn with_config(store: Arc<MemoryStore>, config: CoreConfig) -> Self {
        let core = LedgerCore::new(store.clone(), Arc::new(ReferenceLoader), config);
        core.initialize().unwrap();
        let builder = BatchBuilder::resume(store.snapshot().as_ref()).unwrap();
        Harness { store, core, builder }
    }

    /// Post one batch of sequencer messages without running the loop.
    fn post(&mut self, messages: &[(u64, &str)]) -> bool {
        for (block, data) in messages {
            self.builder
                .sequencer(&InboxMessage::new(*block, *block, data.as_bytes()))
                .unwrap();
        }
        self.core.deliver_messages(self.builder.finish())
    }

    /// Post a batch and run until the machine has caught up.
    fn deliver(&mut self, messages: &[(u64, &str)]) {
        assert!(self.post(messages));
        self.core.run_until_idle().unwrap();
        assert_eq!(self.core.messages_status(), MessageStatus::Success);
    }

    /// Replace everything after `count` messages with `messages`.
    fn reorg_inbox(&mut self, count: u64, messages: &[(u64, &str)]) {
        self.builder = BatchBuilder::resume_at(self.store.snapshot().as_ref(), count).unwrap();
        self.deliver(messages);
    }

    fn last_hash(&self) -> Hash32 {
        self.core.get_last_machine().unwrap().hash()
    }

    /// Pick up the inbox tail after the core truncated it.
    fn resync_builder(&mut self) {
        self.builder = BatchBuilder::resume(self.store.snapshot().as_ref()).unwrap();
    }
}

fn blocks(prefix: &str, count: usize) -> Vec<(u64, String)> {
    (0..count).map(|i| (i as u64 / 2 + 1, format!("{}{:02}", prefix, i))).collect()
}

fn as_refs(messages: &[(u64, String)]) -> Vec<(u64, &str)> {
    messages.iter().map(|(b, d)| (*b, d.as_str())).collect()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

// =============================================================================
// MAILBOX
// =============================================================================

#[test]
fn test_deliver_transitions_mailbox() {
    let mut h = Harness::new();
    assert_eq!(h.core.messages_status(), MessageStatus::Empty);

    assert!(h.post(&[(1, "b0"), (1, "b1")]));
    assert_eq!(h.core.messages_status(), MessageStatus::Ready);

    h.core.run_until_idle().unwrap();
    assert_eq!(h.core.messages_status(), MessageStatus::Success);
    assert_eq!(h.core.messages_status(), MessageStatus::Empty);
    assert_eq!(h.core.message_entry_inserted_count().unwrap(), 2);
    assert_eq!(h.core.get_messages(0, 2).unwrap().len(), 2);
}

#[test]
fn test_mailbox_backpressure() {
    let mut h = Harness::new();
    assert!(h.post(&[(1, "first"), (1, "second")]));

    let mut other = BatchBuilder::new();
    other.sequencer(&InboxMessage::new(1, 1, b"intruder".to_vec())).unwrap();
    assert!(!h.core.deliver_messages(other.finish()));

    h.core.run_until_idle().unwrap();
    assert_eq!(h.core.messages_status(), MessageStatus::Success);
    assert_eq!(h.core.message_entry_inserted_count().unwrap(), 2);
    let first = InboxMessage::decode(&h.core.get_messages(0, 1).unwrap()[0]).unwrap();
    assert_eq!(first.data, b"first".to_vec());
}

#[test]
fn test_rejected_batch_requires_clear() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a")]);

    // Attaches to the empty-inbox accumulator instead of message 0.
    let mut stale = BatchBuilder::new();
    stale.sequencer(&InboxMessage::new(1, 1, b"b".to_vec())).unwrap();
    assert!(h.core.deliver_messages(stale.finish()));
    h.core.run_until_idle().unwrap();

    assert_eq!(h.core.messages_status(), MessageStatus::Error);
    assert!(!h.post(&[(1, "c")]));
    assert!(h.core.messages_clear_error().unwrap().contains("accumulator"));
    assert_eq!(h.core.messages_status(), MessageStatus::Empty);
    assert_eq!(h.core.message_entry_inserted_count().unwrap(), 1);
}

// =============================================================================
// EXECUTION AND CHECKPOINTS
// =============================================================================

#[test]
fn test_execution_persists_logs_and_sends() {
    let mut h = Harness::new();
    h.deliver(&[(1, "hello"), (1, "send:pay"), (2, "world")]);

    assert!(h.core.machine_idle());
    assert_eq!(h.core.machine_messages_read(), 3);
    assert_eq!(h.core.log_inserted_count().unwrap(), 3);
    assert_eq!(h.core.send_inserted_count().unwrap(), 1);
    assert_eq!(h.core.get_sends(0, 1).unwrap(), vec![b"pay".to_vec()]);

    let logs = h.core.get_logs(0, 3).unwrap();
    assert_eq!(logs[0].bytes(), &hash_bytes(b"hello")[..]);
    assert_eq!(logs[2].bytes(), &hash_bytes(b"world")[..]);

    let gas = message_gas(b"hello") + message_gas(b"send:pay") + message_gas(b"world");
    assert_eq!(h.core.max_checkpoint_gas().unwrap(), gas);
}

#[test]
fn test_out_of_range_queries_fail() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a"), (1, "b")]);

    assert!(matches!(
        h.core.get_logs(1, 2),
        Err(CoreError::Storage(StorageError::OutOfRange { .. }))
    ));
    assert!(matches!(
        h.core.get_messages(0, 3),
        Err(CoreError::Storage(StorageError::OutOfRange { .. }))
    ));
    assert!(h.core.get_sends(0, 0).unwrap().is_empty());
}

#[test]
fn test_checkpoint_round_trip() {
    let mut h = Harness::new();
    h.deliver(&[(1, "x"), (1, "y"), (2, "z")]);
    h.core.trigger_save_checkpoint().unwrap();

    let gas = h.core.max_checkpoint_gas().unwrap();
    let keys = h.core.get_checkpoint_using_gas(gas, false).unwrap().unwrap();
    assert_eq!(keys.machine_hash, h.last_hash());

    match h.core.get_machine_at_gas(gas, MachineForm::Owned).unwrap() {
        ReconstructedMachine::Owned(machine) => assert_eq!(machine.hash(), h.last_hash()),
        other => panic!("expected owned machine, got {:?}", other),
    }
    match h.core.get_machine_at_gas(gas, MachineForm::StateKeys).unwrap() {
        ReconstructedMachine::StateKeys(found) => assert_eq!(found, keys),
        other => panic!("expected state keys, got {:?}", other),
    }
}

#[test]
fn test_manual_checkpoint_idempotent() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a"), (1, "b")]);

    h.core.trigger_save_checkpoint().unwrap();
    let before = checkpoint_gas_values(h.store.snapshot().as_ref()).unwrap();
    assert!(!h.core.trigger_save_checkpoint().unwrap());
    let after = checkpoint_gas_values(h.store.snapshot().as_ref()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_interval_checkpoints_and_in_progress_replacement() {
    let mut h = Harness::new();
    // 1_030 gas each; the interval is 5_000.
    let messages = blocks("m", 12);
    h.deliver(&as_refs(&messages));

    let gas_values = checkpoint_gas_values(h.store.snapshot().as_ref()).unwrap();
    assert_eq!(gas_values.first(), Some(&0));
    assert_eq!(gas_values.last(), Some(&(12 * message_gas(b"m00"))));
    for pair in gas_values.windows(2).take(gas_values.len().saturating_sub(2)) {
        assert!(pair[1] - pair[0] >= 5_000, "interval checkpoints too close: {:?}", gas_values);
    }

    // Catch-up checkpoints replace each other rather than piling up.
    h.deliver(&[(9, "n0")]);
    h.deliver(&[(9, "n1")]);
    let grown = checkpoint_gas_values(h.store.snapshot().as_ref()).unwrap();
    assert!(grown.len() <= gas_values.len() + 1);
    assert_eq!(h.core.log_inserted_count().unwrap(), 14);
}

#[test]
fn test_retention_floor_drops_old_checkpoints() {
    let mut h = Harness::new();
    let messages = blocks("m", 16);
    h.deliver(&as_refs(&messages));
    let before = checkpoint_gas_values(h.store.snapshot().as_ref()).unwrap();
    assert!(before.len() >= 3);

    h.core.checkpoints_min_message_index(16).unwrap();
    let after = checkpoint_gas_values(h.store.snapshot().as_ref()).unwrap();
    assert_eq!(after, vec![*before.last().unwrap()]);
    assert!(!h.core.is_checkpoints_empty().unwrap());
}

// =============================================================================
// MACHINE ERRORS
// =============================================================================

#[test]
fn test_machine_error_sticky_until_cleared() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a"), (1, "panic:boom"), (1, "b")]);

    let error = h.core.machine_error().unwrap();
    assert!(error.contains("boom"));
    assert_eq!(h.core.machine_messages_read(), 1);
    assert!(!h.core.machine_idle());

    // Reads stay servable while stalled.
    assert_eq!(h.core.log_inserted_count().unwrap(), 1);
    assert_eq!(h.core.get_logs(0, 1).unwrap().len(), 1);

    // The poison message is still there: clearing alone fails again.
    assert!(h.core.machine_clear_error().is_some());
    h.core.run_until_idle().unwrap();
    assert!(h.core.machine_error().is_some());

    // Replace it, then clear.
    h.reorg_inbox(1, &[(1, "fixed"), (1, "b")]);
    assert!(h.core.machine_error().is_some());
    assert!(h.core.machine_clear_error().is_some());
    assert_eq!(h.core.machine_clear_error(), None);
    h.core.run_until_idle().unwrap();

    assert_eq!(h.core.machine_error(), None);
    assert_eq!(h.core.machine_messages_read(), 3);
    assert!(h.core.machine_idle());
    assert_eq!(h.core.log_inserted_count().unwrap(), 3);
}

// =============================================================================
// LOGS CURSORS
// =============================================================================

#[test]
fn test_logs_cursor_returns_available_logs() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a"), (1, "b"), (2, "c")]);
    assert_eq!(h.core.log_inserted_count().unwrap(), 3);

    h.core.logs_cursor_request(0, 5).unwrap();
    let batch = h.core.logs_cursor_get_logs(0).unwrap().unwrap();
    assert_eq!(batch.first_log_index, 0);
    assert_eq!(batch.logs.len(), 3);
    assert!(batch.deleted_logs.is_empty());

    h.core.logs_cursor_confirm_received(0).unwrap();
    h.core.run_until_idle().unwrap();
    assert_eq!(h.core.logs_cursor_position(0).unwrap(), 3);
    assert_eq!(h.core.logs_cursor_status(0).unwrap(), LogsCursorStatus::Empty);
}

#[test]
fn test_logs_cursor_request_waits_for_logs() {
    let mut h = Harness::new();
    h.core.logs_cursor_request(0, 2).unwrap();
    assert_eq!(h.core.logs_cursor_get_logs(0).unwrap(), None);

    h.deliver(&[(1, "a")]);
    let batch = h.core.logs_cursor_get_logs(0).unwrap().unwrap();
    assert_eq!(batch.logs.len(), 1);
}

#[test]
fn test_log_pins_bounded_without_consumer() {
    let config = CoreConfig {
        value_cache_capacity: 8,
        ..test_config()
    };
    let mut h = Harness::with_config(Arc::new(MemoryStore::new()), config);
    let messages = blocks("p", 20);
    h.deliver(&as_refs(&messages));

    assert_eq!(h.core.log_inserted_count().unwrap(), 20);
    assert!(h.core.shared.values.lock().pinned_count() <= 8);

    // Unpinned logs are still delivered from the value table.
    h.core.logs_cursor_request(0, 30).unwrap();
    let batch = h.core.logs_cursor_get_logs(0).unwrap().unwrap();
    assert_eq!(batch.logs, h.core.get_logs(0, 20).unwrap());
}

#[test]
fn test_confirmed_cursor_errors_after_reorg() {
    let mut h = Harness::new();
    let messages = blocks("m", 10);
    h.deliver(&as_refs(&messages));

    h.core.logs_cursor_request(0, 10).unwrap();
    assert_eq!(h.core.logs_cursor_get_logs(0).unwrap().unwrap().logs.len(), 10);
    h.core.logs_cursor_confirm_received(0).unwrap();
    h.core.run_until_idle().unwrap();
    assert_eq!(h.core.logs_cursor_position(0).unwrap(), 10);

    assert_eq!(h.core.reorg_to_message_count_or_before(5, false).unwrap(), 5);
    assert_eq!(h.core.log_inserted_count().unwrap(), 5);

    assert!(h.core.logs_cursor_check_error(0).unwrap());
    assert!(matches!(
        h.core.logs_cursor_get_logs(0),
        Err(CoreError::LogsCursor(LogsCursorError::Errored { index: 0, .. }))
    ));
    assert!(h.core.logs_cursor_clear_error(0).unwrap().is_some());
    assert_eq!(h.core.logs_cursor_position(0).unwrap(), 5);
    h.core.logs_cursor_request(0, 10).unwrap();
}

#[test]
fn test_delivered_logs_reported_deleted_after_reorg() {
    let mut h = Harness::new();
    let messages = blocks("m", 6);
    h.deliver(&as_refs(&messages));

    h.core.logs_cursor_request(0, 10).unwrap();
    let delivered = h.core.logs_cursor_get_logs(0).unwrap().unwrap();
    assert_eq!(delivered.logs.len(), 6);

    h.reorg_inbox(3, &[(7, "x"), (7, "y")]);
    assert!(!h.core.logs_cursor_check_error(0).unwrap());

    let batch = h.core.logs_cursor_get_logs(0).unwrap().unwrap();
    assert_eq!(batch.logs, delivered.logs[..3].to_vec());
    assert_eq!(batch.deleted_logs, delivered.logs[3..].to_vec());

    // Reported once.
    assert!(h.core.logs_cursor_get_logs(0).unwrap().unwrap().deleted_logs.is_empty());
}

// =============================================================================
// REORGS
// =============================================================================

#[test]
fn test_reorg_removes_later_checkpoints() {
    let mut h = Harness::new();
    let messages = blocks("m", 12);
    h.deliver(&as_refs(&messages));
    let head_hash = h.last_hash();
    let head_logs = h.core.get_logs(0, 12).unwrap();

    assert_eq!(h.core.reorg_to_message_count_or_before(4, false).unwrap(), 4);
    let snap = h.store.snapshot();
    for gas in checkpoint_gas_values(snap.as_ref()).unwrap() {
        let keys = get_checkpoint(snap.as_ref(), gas).unwrap().unwrap();
        assert!(keys.message_count() <= 4);
    }
    assert_eq!(h.core.message_entry_inserted_count().unwrap(), 4);
    assert_eq!(h.core.log_inserted_count().unwrap(), 4);
    assert_eq!(h.core.get_logs(0, 4).unwrap(), head_logs[..4].to_vec());
    assert_eq!(h.core.machine_messages_read(), 4);

    // The dropped messages are not executed again.
    h.core.run_until_idle().unwrap();
    assert_eq!(h.core.machine_messages_read(), 4);
    assert_eq!(h.core.log_inserted_count().unwrap(), 4);

    // Posting them again regrows the same history.
    h.resync_builder();
    h.deliver(&as_refs(&messages[4..]));
    assert_eq!(h.last_hash(), head_hash);
    assert_eq!(h.core.get_logs(0, 12).unwrap(), head_logs);
}

#[test]
fn test_reorg_with_running_loop_truncates_inbox() {
    let mut h = Harness::new();
    h.core.start_thread().unwrap();
    let messages = blocks("m", 5);
    assert!(h.post(&as_refs(&messages)));
    assert!(wait_until(|| h.core.machine_idle() && h.core.machine_messages_read() == 5));

    assert_eq!(h.core.reorg_to_message_count_or_before(2, false).unwrap(), 2);
    // Let the loop iterate over the truncated inbox.
    thread::sleep(Duration::from_millis(50));
    assert!(wait_until(|| h.core.machine_idle()));

    assert_eq!(h.core.message_entry_inserted_count().unwrap(), 2);
    assert_eq!(h.core.log_inserted_count().unwrap(), 2);
    assert_eq!(h.core.machine_messages_read(), 2);
    let snap = h.store.snapshot();
    for gas in checkpoint_gas_values(snap.as_ref()).unwrap() {
        assert!(get_checkpoint(snap.as_ref(), gas).unwrap().unwrap().message_count() <= 2);
    }

    // New messages attach to the truncated tail.
    h.resync_builder();
    assert!(h.post(&[(9, "fresh")]));
    assert!(wait_until(|| h.core.machine_idle() && h.core.machine_messages_read() == 3));
    assert_eq!(h.core.get_logs(2, 1).unwrap()[0].bytes(), &hash_bytes(b"fresh")[..]);
    h.core.abort_thread();
}

#[test]
fn test_reorg_use_latest_keeps_checkpoint_position() {
    let mut h = Harness::new();
    let messages = blocks("m", 12);
    h.deliver(&as_refs(&messages));

    let restored = h.core.reorg_to_message_count_or_before(7, true).unwrap();
    assert!(restored <= 7);
    let snap = h.store.snapshot();
    let latest = checkpoint_gas_values(snap.as_ref()).unwrap();
    let keys = get_checkpoint(snap.as_ref(), *latest.last().unwrap()).unwrap().unwrap();
    assert_eq!(keys.message_count(), restored);
}

#[test]
fn test_inbox_reorg_rewinds_machine() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a"), (1, "b"), (2, "c"), (2, "send:d")]);
    assert_eq!(h.core.send_inserted_count().unwrap(), 1);

    h.reorg_inbox(2, &[(3, "e")]);
    assert_eq!(h.core.message_entry_inserted_count().unwrap(), 3);
    assert_eq!(h.core.machine_messages_read(), 3);
    assert_eq!(h.core.send_inserted_count().unwrap(), 0);

    let logs = h.core.get_logs(0, 3).unwrap();
    assert_eq!(logs[2].bytes(), &hash_bytes(b"e")[..]);
    assert!(matches!(h.core.get_logs(3, 1), Err(CoreError::Storage(_))));
}

#[test]
fn test_random_ingest_and_reorg_matches_replay() {
    let mut h = Harness::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut expected: Vec<String> = Vec::new();

    for round in 0..30u64 {
        let fresh: Vec<(u64, String)> = (0..rng.gen_range(1..5))
            .map(|i| (round, format!("r{}-{}-{}", round, i, rng.gen::<u16>())))
            .collect();
        if !expected.is_empty() && rng.gen_bool(0.3) {
            let keep = rng.gen_range(0..=expected.len());
            expected.truncate(keep);
            h.reorg_inbox(keep as u64, &as_refs(&fresh));
        } else {
            h.deliver(&as_refs(&fresh));
        }
        expected.extend(fresh.into_iter().map(|(_, data)| data));
        assert_eq!(h.core.message_entry_inserted_count().unwrap(), expected.len() as u64);
    }

    // Replay the whole inbox on a fresh machine.
    let count = expected.len() as u64;
    let snap = h.store.snapshot();
    let messages = read_next_messages(snap.as_ref(), &InboxState::default(), count).unwrap();
    let mut machine = ReferenceMachine::new();
    machine.deliver_messages(messages).unwrap();
    machine.step(&RunBudget::unlimited()).unwrap();
    let replayed_logs = machine.drain_logs();

    assert_eq!(h.last_hash(), machine.hash());
    assert_eq!(h.core.log_inserted_count().unwrap(), count);
    assert_eq!(h.core.get_logs(0, count).unwrap(), replayed_logs);
    for (index, data) in expected.iter().enumerate() {
        assert_eq!(replayed_logs[index].bytes(), &hash_bytes(data.as_bytes())[..]);
    }
}

// =============================================================================
// SIDELOADS AND CURSORS
// =============================================================================

#[test]
fn test_sideload_machine_from_cache_and_replay() {
    let store = Arc::new(MemoryStore::new());
    let mut h = Harness::with_store(store.clone());
    h.deliver(&[(1, "a"), (1, "b"), (2, "c"), (2, "d"), (3, "e")]);

    let (block, gas) = h.core.get_sideload_position(2).unwrap().unwrap();
    assert_eq!(block, 2);
    assert_eq!(gas, 4 * message_gas(b"a"));
    let cached = h.core.get_machine_for_sideload(2).unwrap().unwrap();
    assert_eq!(cached.gas_used(), gas);
    assert_eq!(h.core.get_sideload_position(0).unwrap(), None);

    drop(h);
    let fresh = Harness::with_store(store);
    let replayed = fresh.core.get_machine_for_sideload(2).unwrap().unwrap();
    assert_eq!(replayed.hash(), cached.hash());
}

#[test]
fn test_lazy_cursor_outlives_replaced_checkpoint() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a"), (1, "b")]);
    h.core.shared.recent_machines.lock().invalidate_beyond_messages(0);

    let at = h.core.max_checkpoint_gas().unwrap();
    assert_eq!(at, 2 * message_gas(b"a"));
    let mut cursor = h.core.get_execution_cursor(at).unwrap();
    assert!(!cursor.is_materialized());

    // The next save replaces the in-progress checkpoint the cursor sits on.
    h.deliver(&[(1, "c"), (1, "d")]);
    assert!(get_checkpoint(h.store.snapshot().as_ref(), at).unwrap().is_none());

    h.core
        .advance_execution_cursor(&mut cursor, u64::MAX, false)
        .unwrap();
    assert_eq!(cursor.gas_used().unwrap(), 4 * message_gas(b"a"));
    assert_eq!(cursor.machine_hash().unwrap(), h.last_hash());
}

#[test]
fn test_execution_cursor_through_core() {
    let mut h = Harness::new();
    h.deliver(&[(1, "a"), (1, "b"), (1, "c")]);

    let target = 2 * message_gas(b"a");
    let mut cursor = h.core.get_execution_cursor(target).unwrap();
    assert_eq!(cursor.gas_used().unwrap(), target);
    h.core
        .advance_execution_cursor(&mut cursor, target + 1, true)
        .unwrap();
    assert_eq!(cursor.gas_used().unwrap(), 3 * message_gas(b"a"));

    let machine = h.core.take_execution_cursor_machine(&mut cursor).unwrap();
    assert_eq!(machine.hash(), h.last_hash());
    assert!(matches!(
        h.core.advance_execution_cursor(&mut cursor, u64::MAX, false),
        Err(CoreError::CursorTaken)
    ));
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[test]
fn test_restart_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.img");

    let (hash, logs) = {
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        let mut h = Harness::with_store(store.clone());
        h.deliver(&[(1, "a"), (1, "send:b"), (2, "c")]);
        h.core.logs_cursor_request(0, 2).unwrap();
        h.core.logs_cursor_get_logs(0).unwrap();
        h.core.logs_cursor_confirm_received(0).unwrap();
        h.core.run_until_idle().unwrap();
        store.sync().unwrap();
        (h.last_hash(), h.core.get_logs(0, 3).unwrap())
    };

    let store = Arc::new(MemoryStore::open(&path).unwrap());
    let mut h = Harness::with_store(store);
    assert!(h.core.initialized());
    assert_eq!(h.last_hash(), hash);
    assert_eq!(h.core.get_logs(0, 3).unwrap(), logs);
    assert_eq!(h.core.send_inserted_count().unwrap(), 1);
    assert_eq!(h.core.logs_cursor_position(0).unwrap(), 2);

    h.deliver(&[(3, "d")]);
    assert_eq!(h.core.machine_messages_read(), 4);
}

#[test]
fn test_thread_lifecycle() {
    let core = LedgerCore::new(Arc::new(MemoryStore::new()), Arc::new(ReferenceLoader), test_config());
    assert!(matches!(core.start_thread(), Err(CoreError::NotInitialized)));
    core.initialize().unwrap();
    core.start_thread().unwrap();
    assert!(matches!(core.start_thread(), Err(CoreError::AlreadyRunning)));
    assert!(matches!(core.run_until_idle(), Err(CoreError::AlreadyRunning)));

    let mut builder = BatchBuilder::new();
    for data in ["a", "b", "c"] {
        builder.sequencer(&InboxMessage::new(1, 1, data.as_bytes().to_vec())).unwrap();
    }
    assert!(core.deliver_messages(builder.finish()));
    assert!(wait_until(|| core.machine_idle() && core.machine_messages_read() == 3));
    assert_eq!(core.messages_status(), MessageStatus::Success);

    core.trigger_save_checkpoint().unwrap();
    assert_eq!(core.max_checkpoint_gas().unwrap(), 3 * message_gas(b"a"));
    assert_eq!(core.reorg_to_message_count_or_before(1, false).unwrap(), 1);

    assert_eq!(core.message_entry_inserted_count().unwrap(), 1);

    core.abort_thread();
    assert!(!core.is_running());
    core.run_until_idle().unwrap();
    assert_eq!(core.machine_messages_read(), 1);
}
