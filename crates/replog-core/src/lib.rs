//! Core types and wire format for the replog replicated log
//!
//! This crate provides the pieces every other replog crate shares:
//! - Log entry and snapshot chunk types with their fixed binary codec
//! - Request identifiers with embedded timestamps for deduplication
//! - Peer and cluster configuration types with URL validation
//! - The framed wire protocol used by the RPC bus and the broadcast
//!   fan-out channel

pub mod entry;
pub mod peer;
pub mod request_id;
pub mod wire;

pub use entry::{decode_entry_chunk, encode_entry_chunk, EntryKind, LogEntry, SnapshotChunk};
pub use peer::{majority_of, ClusterConfig, Peer, PeerUrl};
pub use request_id::RequestId;
pub use wire::{
    read_message, write_message, BroadcastMessage, EntriesRequest, Frame, LogInfo, Request,
    RequestTag, Response, ResponseStatus, SubscribeControl,
};

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the codec and wire layers
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("truncated input: needed {needed} bytes, had {have}")]
    Truncated { needed: usize, have: usize },

    #[error("unknown entry kind: {0}")]
    UnknownEntryKind(u8),

    #[error("unknown request tag: {0}")]
    UnknownRequestTag(u8),

    #[error("unknown response status: {0}")]
    UnknownResponseStatus(u8),

    #[error("frame exceeds limit: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid peer URL: {0}")]
    InvalidUrl(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization encode error: {0}")]
    SerializationEncode(#[from] bincode::error::EncodeError),

    #[error("serialization decode error: {0}")]
    SerializationDecode(#[from] bincode::error::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer identifier within a cluster
pub type PeerId = String;

/// Term number of a leader epoch
pub type Term = u32;

/// Position of an entry in the replicated log; 0 means "no entry"
pub type LogIndex = u64;
