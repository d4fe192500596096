//! Storage engine: the ordered key-value store, record formats, the value
//! table and the checkpoint, message and output tables built on top of it.

pub mod batch;
pub mod checkpoint;
pub mod errors;
pub mod format;
pub mod image;
pub mod messages;
pub mod outputs;
pub mod store;
pub mod values;

pub use errors::StorageError;
pub use store::{Column, KvStore, MemoryStore, ReadSnapshot, WriteTxn};
