//! ledgercore: execution and checkpoint core for a deterministic VM-based
//! ledger node.
//!
//! A single Core Loop thread owns the live machine. It ingests inbox
//! batches, executes messages, persists logs and sends together with
//! periodic checkpoints, and rolls everything back on reorg. Readers query
//! the store through consistent snapshots.

pub mod engine;
pub mod kernel;

pub use engine::{KvStore, MemoryStore, StorageError};
pub use kernel::{CoreConfig, CoreError, LedgerCore, MessageStatus, ReferenceLoader};
