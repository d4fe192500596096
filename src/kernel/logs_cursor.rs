//! Logs cursor protocol.
//!
//! Each registered consumer pulls logs through its own cursor:
//!
//! ```text
//! Empty --request--> Requested --fulfil--> Ready --get_logs--> Ready(delivered)
//!   ^                                                              |
//!   +------------- persist position <-- Confirmed <--confirm-------+
//! ```
//!
//! Fulfilment hands out however many logs exist past the confirmed position,
//! up to the requested count; with none available the request just waits.
//! Persisting a confirmed position is the Core Loop's job.
//!
//! On a reorg, logs delivered but not yet confirmed that no longer exist are
//! reported back as `deleted_logs`. Invalidating logs a consumer has already
//! confirmed puts that cursor into a sticky error until cleared.

use std::fmt;

use tracing::{debug, warn};

use crate::engine::outputs::{get_cursor_position, get_logs};
use crate::engine::store::ReadSnapshot;
use crate::engine::values::{Value, ValueCache};
use crate::engine::StorageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogsCursorStatus {
    Empty,
    Requested,
    Ready,
    Confirmed,
    Error,
}

/// Per-cursor refusals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogsCursorError {
    /// No cursor with this index is registered.
    UnknownCursor(usize),

    /// The cursor is mid-protocol and cannot take this call.
    WrongStatus { index: usize, status: LogsCursorStatus },

    /// The pending batch must be fetched before it can be confirmed.
    NotDelivered(usize),

    /// The cursor is in the error state; `clear_error` first.
    Errored { index: usize, message: String },
}

impl fmt::Display for LogsCursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogsCursorError::UnknownCursor(index) => write!(f, "No logs cursor {}", index),
            LogsCursorError::WrongStatus { index, status } => {
                write!(f, "Logs cursor {} is {:?}", index, status)
            }
            LogsCursorError::NotDelivered(index) => {
                write!(f, "Logs cursor {} has not delivered its batch", index)
            }
            LogsCursorError::Errored { index, message } => {
                write!(f, "Logs cursor {} is in error: {}", index, message)
            }
        }
    }
}

impl std::error::Error for LogsCursorError {}

/// One delivery to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogsCursorBatch {
    /// Log index of `logs[0]`.
    pub first_log_index: u64,
    pub logs: Vec<Value>,
    /// Previously delivered logs that a reorg removed, oldest first.
    pub deleted_logs: Vec<Value>,
}

#[derive(Debug)]
struct LogsCursor {
    status: LogsCursorStatus,
    requested: u64,
    confirmed_position: u64,
    data: Vec<Value>,
    deleted_data: Vec<Value>,
    delivered: bool,
    error: Option<String>,
}

impl LogsCursor {
    fn at(confirmed_position: u64) -> Self {
        LogsCursor {
            status: LogsCursorStatus::Empty,
            requested: 0,
            confirmed_position,
            data: Vec::new(),
            deleted_data: Vec::new(),
            delivered: false,
            error: None,
        }
    }

    /// Position after the pending batch.
    fn pending_total_count(&self) -> u64 {
        self.confirmed_position + self.data.len() as u64
    }

    fn fail(&mut self, message: String) {
        self.status = LogsCursorStatus::Error;
        self.error = Some(message);
        self.data.clear();
        self.deleted_data.clear();
        self.delivered = false;
    }
}

/// All registered logs cursors.
#[derive(Debug)]
pub struct LogsCursors {
    cursors: Vec<LogsCursor>,
}

impl LogsCursors {
    /// `count` cursors, all at position zero.
    pub fn new(count: usize) -> Self {
        LogsCursors {
            cursors: (0..count).map(|_| LogsCursor::at(0)).collect(),
        }
    }

    /// `count` cursors at their persisted positions. A position beyond
    /// `log_count` means confirmed logs were lost; that cursor starts in
    /// the error state.
    pub fn load(snap: &dyn ReadSnapshot, count: usize, log_count: u64) -> Result<Self, StorageError> {
        let mut cursors = Vec::with_capacity(count);
        for index in 0..count {
            let position = get_cursor_position(snap, index)?;
            let mut cursor = LogsCursor::at(position.min(log_count));
            if position > log_count {
                warn!(cursor = index, position, log_count, "logs cursor position beyond stored logs");
                cursor.fail(format!(
                    "confirmed position {} exceeds stored log count {}",
                    position, log_count
                ));
            }
            cursors.push(cursor);
        }
        Ok(LogsCursors { cursors })
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    fn cursor(&self, index: usize) -> Result<&LogsCursor, LogsCursorError> {
        self.cursors.get(index).ok_or(LogsCursorError::UnknownCursor(index))
    }

    fn cursor_mut(&mut self, index: usize) -> Result<&mut LogsCursor, LogsCursorError> {
        self.cursors.get_mut(index).ok_or(LogsCursorError::UnknownCursor(index))
    }

    pub fn status(&self, index: usize) -> Result<LogsCursorStatus, LogsCursorError> {
        Ok(self.cursor(index)?.status)
    }

    /// Confirmed (irrevocably acknowledged) log count.
    pub fn position(&self, index: usize) -> Result<u64, LogsCursorError> {
        Ok(self.cursor(index)?.confirmed_position)
    }

    /// Lowest confirmed position across every cursor.
    pub fn min_confirmed_position(&self) -> u64 {
        self.cursors
            .iter()
            .map(|cursor| cursor.confirmed_position)
            .min()
            .unwrap_or(0)
    }

    /// Ask for up to `count` logs past the confirmed position.
    pub fn request(&mut self, index: usize, count: u64) -> Result<(), LogsCursorError> {
        let cursor = self.cursor_mut(index)?;
        match cursor.status {
            LogsCursorStatus::Empty => {
                cursor.requested = count;
                cursor.status = LogsCursorStatus::Requested;
                Ok(())
            }
            LogsCursorStatus::Error => Err(LogsCursorError::Errored {
                index,
                message: cursor.error.clone().unwrap_or_default(),
            }),
            status => Err(LogsCursorError::WrongStatus { index, status }),
        }
    }

    /// Fill every outstanding request from `snap`. Returns the cursors that
    /// became ready.
    pub fn fulfill(
        &mut self,
        snap: &dyn ReadSnapshot,
        values: &mut ValueCache,
        log_count: u64,
    ) -> Result<Vec<usize>, StorageError> {
        let mut ready = Vec::new();
        for index in 0..self.cursors.len() {
            if self.fulfill_one(index, snap, values, log_count)? {
                ready.push(index);
            }
        }
        Ok(ready)
    }

    /// Fill one outstanding request. Returns false if the cursor is not
    /// waiting or no logs are available yet.
    pub fn fulfill_one(
        &mut self,
        index: usize,
        snap: &dyn ReadSnapshot,
        values: &mut ValueCache,
        log_count: u64,
    ) -> Result<bool, StorageError> {
        let cursor = match self.cursors.get_mut(index) {
            Some(cursor) if cursor.status == LogsCursorStatus::Requested => cursor,
            _ => return Ok(false),
        };
        let available = log_count.saturating_sub(cursor.confirmed_position);
        let count = cursor.requested.min(available);
        if count == 0 {
            return Ok(false);
        }
        cursor.data = get_logs(snap, cursor.confirmed_position, count, values)?;
        cursor.delivered = false;
        cursor.status = LogsCursorStatus::Ready;
        debug!(cursor = index, first = cursor.confirmed_position, count, "logs cursor ready");
        Ok(true)
    }

    /// The pending batch, if one is ready. Repeatable until confirmed;
    /// `deleted_logs` is reported once.
    pub fn get_logs(&mut self, index: usize) -> Result<Option<LogsCursorBatch>, LogsCursorError> {
        let cursor = self.cursor_mut(index)?;
        match cursor.status {
            LogsCursorStatus::Ready => {
                cursor.delivered = true;
                Ok(Some(LogsCursorBatch {
                    first_log_index: cursor.confirmed_position,
                    logs: cursor.data.clone(),
                    deleted_logs: std::mem::take(&mut cursor.deleted_data),
                }))
            }
            LogsCursorStatus::Error => Err(LogsCursorError::Errored {
                index,
                message: cursor.error.clone().unwrap_or_default(),
            }),
            _ => Ok(None),
        }
    }

    /// Acknowledge the delivered batch. The position becomes durable when
    /// the Core Loop next persists confirmations.
    pub fn confirm(&mut self, index: usize) -> Result<(), LogsCursorError> {
        let cursor = self.cursor_mut(index)?;
        match cursor.status {
            LogsCursorStatus::Ready if cursor.delivered => {
                cursor.status = LogsCursorStatus::Confirmed;
                Ok(())
            }
            LogsCursorStatus::Ready => Err(LogsCursorError::NotDelivered(index)),
            LogsCursorStatus::Error => Err(LogsCursorError::Errored {
                index,
                message: cursor.error.clone().unwrap_or_default(),
            }),
            status => Err(LogsCursorError::WrongStatus { index, status }),
        }
    }

    /// Advance every confirmed cursor and return `(index, new_position)`
    /// for the caller to persist.
    pub fn take_confirmed(&mut self) -> Vec<(usize, u64)> {
        let mut confirmed = Vec::new();
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            if cursor.status != LogsCursorStatus::Confirmed {
                continue;
            }
            cursor.confirmed_position = cursor.pending_total_count();
            cursor.data.clear();
            cursor.delivered = false;
            cursor.status = LogsCursorStatus::Empty;
            confirmed.push((index, cursor.confirmed_position));
        }
        confirmed
    }

    pub fn check_error(&self, index: usize) -> Result<bool, LogsCursorError> {
        Ok(self.cursor(index)?.status == LogsCursorStatus::Error)
    }

    /// Leave the error state, returning the error text.
    pub fn clear_error(&mut self, index: usize) -> Result<Option<String>, LogsCursorError> {
        let cursor = self.cursor_mut(index)?;
        if cursor.status != LogsCursorStatus::Error {
            return Ok(None);
        }
        cursor.status = LogsCursorStatus::Empty;
        Ok(cursor.error.take())
    }

    /// Roll every cursor back to `log_count` logs. Returns the positions
    /// that changed and must be persisted.
    pub fn reorg(&mut self, log_count: u64) -> Vec<(usize, u64)> {
        let mut moved = Vec::new();
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            let confirmed_beyond = cursor.confirmed_position > log_count
                || (cursor.status == LogsCursorStatus::Confirmed && cursor.pending_total_count() > log_count);
            if confirmed_beyond {
                warn!(
                    cursor = index,
                    confirmed = cursor.confirmed_position,
                    log_count,
                    "reorg invalidated confirmed logs"
                );
                let message = format!(
                    "reorg to {} logs invalidated confirmed logs up to {}",
                    log_count,
                    cursor.pending_total_count().max(cursor.confirmed_position)
                );
                cursor.fail(message);
                if cursor.confirmed_position > log_count {
                    cursor.confirmed_position = log_count;
                    moved.push((index, log_count));
                }
                continue;
            }

            if cursor.status != LogsCursorStatus::Ready || cursor.pending_total_count() <= log_count {
                continue;
            }
            let keep = (log_count - cursor.confirmed_position) as usize;
            let removed = cursor.data.split_off(keep);
            if cursor.delivered {
                debug!(cursor = index, removed = removed.len(), "staging deleted logs");
                cursor.deleted_data.extend(removed);
                cursor.delivered = false;
            } else if cursor.data.is_empty() && cursor.deleted_data.is_empty() {
                cursor.status = LogsCursorStatus::Requested;
            }
        }
        moved
    }
}
