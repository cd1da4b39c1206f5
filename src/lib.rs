//! tidekv - an embedded, concurrent, log-structured key-value store.
//!
//! Records live in a hybrid log: an append-only, paged byte log whose tail
//! region accepts in-place updates while older regions are immutable and
//! age out to a storage device. A cache-line hash index maps key hashes to
//! log addresses, epoch protection makes structural changes safe without
//! blocking readers, and checkpoints capture a crash-consistent cut that
//! [`TideKv::recover`] restores.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use tidekv::{NullDevice, SimpleReadContext, SimpleUpsertContext, TideKv, TideKvConfig};
//!
//! let store = TideKv::<u64, u64, _>::open(TideKvConfig::default(), NullDevice::new())?;
//! let mut session = store.open_session();
//!
//! session.upsert(&SimpleUpsertContext::new(1, 100), 1);
//! let mut read = SimpleReadContext::new(1);
//! session.read(&mut read, 2);
//! assert_eq!(read.value(), Some(100));
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod epoch;
pub mod hlog;
pub mod index;
pub mod record;
pub mod scan;
pub mod status;
pub mod store;
mod utility;

pub use address::{Address, AtomicAddress};
pub use checkpoint::{CheckpointToken, RecoveryResult, SessionSnapshot};
pub use config::TideKvConfig;
pub use device::{FileDevice, NullDevice, StorageDevice, SyncStorageDevice};
pub use record::{AtomicGenLock, GenLock, GenLocked, Key, Record, RecordHeader, TryLock, Value};
pub use scan::{LogScanIterator, ScanRecord};
pub use status::Status;
pub use store::{
    AddContext, DeleteContext, IncrementContext, ReadContext, RmwContext, Session,
    SimpleDeleteContext, SimpleReadContext, SimpleUpsertContext, TideKv, UpsertContext,
};

/// Byte-size helpers for configuration literals.
pub mod size {
    /// One KiB.
    pub const KIB: u64 = 1024;
    /// One MiB.
    pub const MIB: u64 = 1024 * KIB;
    /// One GiB.
    pub const GIB: u64 = 1024 * MIB;
}
