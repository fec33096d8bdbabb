//! Durable segmented log storage for replog
//!
//! The log is stored as a sequence of segment files, each covering a
//! contiguous index range and named by its first index in fixed-width
//! decimal so a sorted directory listing equals index order. This crate
//! provides:
//! - Durable append with rollover by entry count or byte size
//! - Random and range reads by log index
//! - Truncation, snapshot installation, and segment pruning
//! - Crash recovery that drops a torn tail and rejects interior
//!   corruption
//! - Sequential feeding of an application state machine

pub mod log;
pub mod segment;
pub mod state_machine;

pub use log::{FileLog, LogOptions, SnapshotMeta};
pub use segment::{segment_file_name, Segment};
pub use state_machine::StateMachine;

use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the log storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("invalid log index {index}: {reason}")]
    InvalidIndex { index: u64, reason: String },

    #[error("log directory already locked: {0}")]
    Locked(PathBuf),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("codec error: {0}")]
    Codec(#[from] replog_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
