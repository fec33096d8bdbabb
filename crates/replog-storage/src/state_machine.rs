//! State machine seam
//!
//! Committed entries are applied in index order to an application state
//! machine. The trait carries an optional backpressure hook, awaited
//! before each apply, and an optional serialization capability used by
//! compaction.

use crate::Result;
use async_trait::async_trait;
use replog_core::{LogEntry, LogIndex};

/// An application state machine fed from the replicated log
#[async_trait]
pub trait StateMachine: Send {
    /// Index of the last entry applied; 0 before any apply
    fn last_applied(&self) -> LogIndex;

    /// Apply one committed entry; called strictly in index order
    async fn apply(&mut self, entry: &LogEntry) -> Result<()>;

    /// Backpressure hook awaited before each apply
    async fn poll_ready(&mut self) -> Result<()> {
        Ok(())
    }

    /// Serialize the full state for snapshotting; None when the state
    /// machine has no serialization capability
    fn snapshot_bytes(&self) -> Option<Vec<u8>> {
        None
    }
}
