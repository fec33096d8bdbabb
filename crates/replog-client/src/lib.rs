//! Leader-tracking RPC client for replog clusters
//!
//! The client keeps a peer list and an opinion about the current
//! leader. Every call routes to the leader when one is known, follows
//! redirect hints, demotes the leader opinion on timeout, and backs off
//! while the cluster is electing. There is no retry cap; callers bound
//! calls with a cancellation token.

pub mod cancel;
pub mod client;
pub mod connection;
pub mod stream;

pub use cancel::CancelToken;
pub use client::{ClientOptions, ClusterClient};
pub use connection::Connection;
pub use stream::{EntryStream, EntryStreamItem};

use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced to client callers
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,

    #[error("cluster has no leader")]
    NoLeader,

    #[error("stream out of order: {0}")]
    OutOfOrder(String),

    #[error("authentication failed: wrong secret")]
    AuthFailure,

    #[error("request id outside the freshness window")]
    Expired,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(#[from] replog_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
