//! Ordered broadcast subscriber for replog
//!
//! A subscriber is a duplex stream over the replicated log:
//! - The read side delivers committed entries in strict index order,
//!   without gaps or duplicates, pulling missed ranges through the RPC
//!   client whenever the broadcast channel skips ahead.
//! - The write side forwards update requests to the cluster leader and
//!   tracks the highest acknowledged commit index.
//!
//! Consumers pull items at their own pace; when they fall behind, the
//! subscriber unsubscribes from the fan-out channel to shed load and
//! resumes once the consumer catches up.

pub mod subscriber;

pub use subscriber::{
    Subscriber, SubscriberEvent, SubscriberItem, SubscriberOptions, SubscriberState,
};

use thiserror::Error;

/// Result type for subscriber operations
pub type Result<T> = std::result::Result<T, SubscriberError>;

/// Errors surfaced by the subscriber
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("authentication failed: wrong secret")]
    AuthFailure,

    #[error("no peers configured")]
    NoPeers,

    #[error("subscriber closed")]
    Closed,

    #[error("client error: {0}")]
    Client(#[from] replog_client::ClientError),

    #[error("protocol error: {0}")]
    Protocol(#[from] replog_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
