//! Replog cluster node
//!
//! Wires the durable log, the snapshot store, and the consensus engine
//! behind two listeners:
//! - The RPC server speaking the framed bus (`?` config, `i` log info,
//!   `u` update, `e` entries stream, `*` publisher URL, `r` raft peer
//!   traffic)
//! - The broadcast publisher fanning committed entries out to
//!   subscribers, with heartbeats and secret filtering
//!
//! Startup order is config, log, snapshot sweep, raft, then the
//! listeners; teardown runs in reverse.

pub mod broadcast;
pub mod node;
pub mod server;
pub mod transport;

pub use broadcast::Publisher;
pub use node::{Node, NodeConfig};
pub use server::{RpcServer, ServerContext};
pub use transport::TcpRaftTransport;

use thiserror::Error;

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur while running a node
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] replog_storage::StorageError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] replog_snapshot::SnapshotError),

    #[error("raft error: {0}")]
    Raft(#[from] replog_raft::RaftError),

    #[error("protocol error: {0}")]
    Protocol(#[from] replog_core::CoreError),

    #[error("serialization encode error: {0}")]
    SerializationEncode(#[from] bincode::error::EncodeError),

    #[error("serialization decode error: {0}")]
    SerializationDecode(#[from] bincode::error::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
