//! Raft RPC messages
//!
//! The three RPCs of the Raft paper, carried as one frame of the wire
//! bus between peers:
//! - AppendEntries (log replication and peer heartbeat)
//! - RequestVote (leader election)
//! - InstallSnapshot (chunked snapshot transfer to lagging followers)

use replog_core::{LogEntry, LogIndex, PeerId, Term};
use serde::{Deserialize, Serialize};

/// AppendEntries RPC request
///
/// Invoked by the leader to replicate log entries; empty for heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's id, so followers can redirect clients
    pub leader_id: PeerId,

    /// Index of the entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`
    pub prev_log_term: Term,

    /// Entries to store; empty for heartbeat
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// A heartbeat carrying no entries
    pub fn heartbeat(
        term: Term,
        leader_id: PeerId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit,
        }
    }

    /// True when this request carries no entries
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// AppendEntries RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Responder's term, for the leader to update itself
    pub term: Term,

    /// True when the follower matched `prev_log_index`/`prev_log_term`
    pub success: bool,

    /// The follower's last replicated index on success
    pub match_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    /// Successful replication up to `match_index`
    pub fn success(term: Term, match_index: LogIndex) -> Self {
        Self {
            term,
            success: true,
            match_index: Some(match_index),
        }
    }

    /// Consistency check failed
    pub fn failure(term: Term) -> Self {
        Self {
            term,
            success: false,
            match_index: None,
        }
    }
}

/// RequestVote RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: PeerId,

    /// Index of the candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Responder's term
    pub term: Term,

    /// True when the vote was granted
    pub vote_granted: bool,
}

/// InstallSnapshot RPC request: one chunk of a snapshot transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's id
    pub leader_id: PeerId,

    /// The snapshot replaces entries up to and including this index
    pub last_included_index: LogIndex,

    /// Term of the entry at `last_included_index`
    pub last_included_term: Term,

    /// Position of this chunk in the snapshot body
    pub offset: u64,

    /// Chunk bytes
    pub data: Vec<u8>,

    /// True for the final chunk
    pub done: bool,
}

/// InstallSnapshot RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Responder's term
    pub term: Term,

    /// True when the chunk was accepted
    pub success: bool,
}

/// Envelope for raft traffic on the wire bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVoteRequest(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl RaftMessage {
    /// The term carried by the message
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::AppendEntriesRequest(req) => req.term,
            RaftMessage::AppendEntriesResponse(resp) => resp.term,
            RaftMessage::RequestVoteRequest(req) => req.term,
            RaftMessage::RequestVoteResponse(resp) => resp.term,
            RaftMessage::InstallSnapshotRequest(req) => req.term,
            RaftMessage::InstallSnapshotResponse(resp) => resp.term,
        }
    }

    /// Serialize for a wire frame
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        use bincode::config;
        bincode::encode_to_vec(bincode::serde::Compat(self), config::standard())
    }

    /// Deserialize from a wire frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_core::RequestId;

    #[test]
    fn test_heartbeat() {
        let req = AppendEntriesRequest::heartbeat(1, "leader".to_string(), 10, 1, 10);
        assert!(req.is_heartbeat());
        assert_eq!(req.entries.len(), 0);
    }

    #[test]
    fn test_append_entries_roundtrip() {
        let entries = vec![LogEntry::new(11, 2, RequestId::generate(), b"x".to_vec())];
        let req = AppendEntriesRequest {
            term: 2,
            leader_id: "leader".to_string(),
            prev_log_index: 10,
            prev_log_term: 1,
            entries,
            leader_commit: 10,
        };

        let message = RaftMessage::AppendEntriesRequest(req.clone());
        let bytes = message.to_bytes().unwrap();
        let decoded = RaftMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.term(), 2);
        match decoded {
            RaftMessage::AppendEntriesRequest(decoded) => {
                assert_eq!(decoded.leader_id, req.leader_id);
                assert_eq!(decoded.entries[0].index, 11);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_response_constructors() {
        let ok = AppendEntriesResponse::success(3, 12);
        assert!(ok.success);
        assert_eq!(ok.match_index, Some(12));

        let bad = AppendEntriesResponse::failure(3);
        assert!(!bad.success);
        assert_eq!(bad.match_index, None);
    }

    #[test]
    fn test_snapshot_chunk_roundtrip() {
        let req = InstallSnapshotRequest {
            term: 4,
            leader_id: "leader".to_string(),
            last_included_index: 500,
            last_included_term: 3,
            offset: 4096,
            data: vec![9; 128],
            done: false,
        };
        let bytes = RaftMessage::InstallSnapshotRequest(req).to_bytes().unwrap();
        match RaftMessage::from_bytes(&bytes).unwrap() {
            RaftMessage::InstallSnapshotRequest(decoded) => {
                assert_eq!(decoded.last_included_index, 500);
                assert_eq!(decoded.offset, 4096);
                assert!(!decoded.done);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
