//! Storage devices backing the hybrid log.
//!
//! The engine is generic over the device; the crate ships a file-backed
//! device and a discard device for in-memory operation and tests.

mod file;
mod null;
mod traits;

pub use file::FileDevice;
pub use null::NullDevice;
pub use traits::{StorageDevice, SyncStorageDevice};
