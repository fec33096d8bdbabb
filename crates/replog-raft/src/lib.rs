//! Raft consensus engine for the replog durable log
//!
//! This crate drives leader election, log replication, and commit-index
//! advancement over the segmented on-disk log. It also owns the
//! leader-side request-id deduplication window. Correctness follows the
//! Raft paper; the rest of the workspace consumes it through a handle
//! exposing the commit index, the leader's identity, and the cluster
//! configuration.

pub mod dedup;
pub mod election;
pub mod node;
pub mod rpc;
pub mod state;

pub use dedup::{DedupMap, DedupVerdict};
pub use election::{ElectionTimer, VoteTracker};
pub use node::{RaftConfig, RaftHandle, RaftNode, RaftTransport, UpdateError};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftMessage, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{LeaderState, PersistentState, RaftRole, VolatileState};

use thiserror::Error;

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur inside the consensus engine
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("node is not the leader")]
    NotLeader,

    #[error("no leader available")]
    NoLeader,

    #[error("request id outside the freshness window")]
    ExpiredRequestId,

    #[error("log inconsistency detected")]
    LogInconsistency,

    #[error("node is shutting down")]
    Shutdown,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] replog_storage::StorageError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] replog_snapshot::SnapshotError),

    #[error("serialization encode error: {0}")]
    SerializationEncode(#[from] bincode::error::EncodeError),

    #[error("serialization decode error: {0}")]
    SerializationDecode(#[from] bincode::error::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
