use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::messages::{add_messages, MessageBatch};

use super::error::CoreError;
use super::CoreLoop;

impl CoreLoop {
    /// Ingest the mailbox batch, if one is waiting. Returns true if a batch
    /// was processed (successfully or not).
    pub(super) fn ingest_pending(&mut self) -> bool {
        let batch = match self.shared.mailbox.take_ready() {
            Some(batch) => batch,
            None => return false,
        };

        let result = self.ingest(&batch);
        match &result {
            Ok(entry_count) => info!(
                entry_count,
                items = batch.sequencer_batch_items.len(),
                delayed = batch.delayed_messages.len(),
                reorg = ?batch.reorg_batch_items,
                "ingested message batch"
            ),
            Err(e) => warn!(error = %e, "rejected message batch"),
        }
        self.shared.mailbox.finish(result.map(|_| ()).map_err(|e| e.to_string()));
        true
    }

    /// Store one batch. A batch that truncates below what the machine has
    /// already read rewinds the machine in the same transaction.
    fn ingest(&mut self, batch: &MessageBatch) -> Result<u64, CoreError> {
        let shared = Arc::clone(&self.shared);
        // Truncation releases value references held by readers' logs.
        let _guard = shared.reorg_lock.write();

        let mut txn = shared.store.begin();
        let outcome = add_messages(&mut txn, batch)?;
        let rewind = match outcome.rewound_to {
            Some(count) if self.machine.next_message_index() > count => {
                Some(self.rewind_in(&mut txn, count, false)?)
            }
            _ => None,
        };
        shared.store.commit(txn.into_batch())?;

        if let Some(count) = outcome.rewound_to {
            let dropped_sideloads = shared.sideload_cache.lock().invalidate_beyond_messages(count);
            let dropped_recent = shared.recent_machines.lock().invalidate_beyond_messages(count);
            debug!(count, dropped_sideloads, dropped_recent, "inbox truncated");
        }
        if let Some(rewind) = rewind {
            self.install(rewind)?;
        }
        Ok(outcome.entry_count)
    }
}
