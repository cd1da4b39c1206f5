//! Checkpoint artifacts and coordination.
//!
//! A checkpoint produces two orthogonal artifacts, each identified by a
//! 128-bit token: an *index* artifact (bucket-array image + metadata) and a
//! *log* artifact (resident page snapshot + metadata with per-session
//! serials). Recovery combines one of each.

mod files;
mod state;

pub use files::{artifact_dir, read_index, read_log, write_index, write_log, LogPages};
pub use state::{Action, AtomicSystemState, Phase, SystemState};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Checkpoint token: a fresh UUID per artifact set, rendered in the
/// canonical 36-character dashed form.
pub type CheckpointToken = Uuid;

/// One session's position at the checkpoint cut.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session guid.
    pub guid: Uuid,
    /// Last serial number issued before the cut.
    pub serial: u64,
}

/// Metadata for the log artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Artifact token.
    pub token: CheckpointToken,
    /// Version the checkpoint cut belongs to.
    pub version: u32,
    /// Page size exponent at capture time.
    pub page_size_bits: u32,
    /// `begin` anchor at the cut (raw address).
    pub begin_address: u64,
    /// `head` anchor at the cut (raw address); pages from here up are in
    /// the artifact.
    pub head_address: u64,
    /// Tail at the cut: the recovered log ends here.
    pub checkpoint_tail: u64,
    /// Sessions live at the cut, with their serials.
    pub sessions: Vec<SessionSnapshot>,
}

/// Metadata for the index artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Artifact token.
    pub token: CheckpointToken,
    /// Version the snapshot belongs to.
    pub version: u32,
    /// Bucket count of the imaged table.
    pub table_size: u64,
    /// Overflow buckets in the image.
    pub overflow_count: u64,
    /// Tail at the moment the image was taken; index entries at or past
    /// this address are untrusted and rebuilt from the log scan.
    pub checkpoint_start: u64,
}

/// Everything `recover` reports back.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    /// Version of the recovered state.
    pub version: u32,
    /// Recovered sessions and the serials they persisted through.
    pub sessions: Vec<SessionSnapshot>,
}
