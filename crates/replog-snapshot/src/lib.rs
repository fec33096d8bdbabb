//! Snapshot files and log compaction for replog
//!
//! A snapshot file carries the compacted prefix of the log: a fixed
//! header naming the last included index and term plus the body size,
//! followed by the opaque serialized state. Creation streams through a
//! temporary file that is fsynced and atomically renamed into place;
//! readers may stream the body as soon as the header is persisted.
//! Compaction feeds the log prefix to an application state machine,
//! writes the snapshot (optionally gzip-compressed), and installs it
//! into the log.

pub mod compaction;
pub mod file;

pub use compaction::{compact, compress_state, decompress_state, CompactionOptions};
pub use file::{sweep_stale_temps, SnapshotFile, SnapshotSidecar, SnapshotWriter, SNAPSHOT_HEADER_LEN};

use thiserror::Error;

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors that can occur during snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("compression error: {0}")]
    Compression(String),

    #[error("invalid compression level {0}: must be within 0..=9")]
    InvalidCompressionLevel(u32),

    #[error("index {0} is not present in the log")]
    MissingIndex(u64),

    #[error("state machine has no serialization capability")]
    NoSerialization,

    #[error("storage error: {0}")]
    Storage(#[from] replog_storage::StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
