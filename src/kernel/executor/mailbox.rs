//! Single-slot message mailbox between producers and the Core Loop.

use parking_lot::Mutex;

use crate::engine::messages::MessageBatch;

/// Mailbox status.
///
/// ```text
/// Empty --post--> Ready --ingest--> Success --status read--> Empty
///                       \-ingest--> Error   --clear_error--> Empty
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    /// Ready to receive a batch.
    Empty,
    /// A batch is waiting for (or undergoing) ingestion.
    Ready,
    /// The last batch was stored.
    Success,
    /// The last batch was rejected; see `clear_error`.
    Error,
}

struct Slot {
    status: MessageStatus,
    batch: Option<MessageBatch>,
    error: Option<String>,
}

pub(crate) struct Mailbox {
    slot: Mutex<Slot>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Mailbox {
            slot: Mutex::new(Slot {
                status: MessageStatus::Empty,
                batch: None,
                error: None,
            }),
        }
    }

    /// Post a batch. Returns false without blocking unless the mailbox is
    /// `Empty`; the batch already in the slot is untouched.
    pub(crate) fn post(&self, batch: MessageBatch) -> bool {
        let mut slot = self.slot.lock();
        if slot.status != MessageStatus::Empty {
            return false;
        }
        slot.batch = Some(batch);
        slot.status = MessageStatus::Ready;
        true
    }

    /// Current status. Reading `Success` acknowledges it.
    pub(crate) fn status(&self) -> MessageStatus {
        let mut slot = self.slot.lock();
        let status = slot.status;
        if status == MessageStatus::Success {
            slot.status = MessageStatus::Empty;
        }
        status
    }

    /// Status without acknowledging.
    pub(crate) fn peek_status(&self) -> MessageStatus {
        self.slot.lock().status
    }

    /// Leave the error state, returning the error text.
    pub(crate) fn clear_error(&self) -> Option<String> {
        let mut slot = self.slot.lock();
        if slot.status != MessageStatus::Error {
            return None;
        }
        slot.status = MessageStatus::Empty;
        slot.error.take()
    }

    /// Core Loop side: take the waiting batch. The status stays `Ready`
    /// until `finish`.
    pub(crate) fn take_ready(&self) -> Option<MessageBatch> {
        let mut slot = self.slot.lock();
        if slot.status != MessageStatus::Ready {
            return None;
        }
        slot.batch.take()
    }

    pub(crate) fn finish(&self, result: Result<(), String>) {
        let mut slot = self.slot.lock();
        match result {
            Ok(()) => {
                slot.status = MessageStatus::Success;
                slot.error = None;
            }
            Err(message) => {
                slot.status = MessageStatus::Error;
                slot.error = Some(message);
            }
        }
    }
}
