//! Raft state management
//!
//! Splits node state the way the paper does:
//! - Persistent state (term, vote, peer set), written to the
//!   `raft-state` file with a temp-and-rename before any promise is
//!   answered
//! - Volatile state (commit index, last applied)
//! - Leader-only replication bookkeeping (next/match per follower)

use crate::Result;
use replog_core::{ClusterConfig, LogIndex, PeerId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// The three roles a Raft node moves between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Responds to RPCs from leaders and candidates
    Follower,
    /// Campaigning to become leader
    Candidate,
    /// Handles client requests and replicates the log
    Leader,
}

impl RaftRole {
    /// True for the leader role
    pub fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader)
    }
}

/// State every peer persists before answering RPCs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this peer has seen
    pub current_term: Term,

    /// Candidate granted this peer's vote in `current_term`, if any
    pub voted_for: Option<PeerId>,

    /// Peer set the node last knew
    pub peers: ClusterConfig,
}

impl PersistentState {
    /// Initial state for a fresh node
    pub fn new(peers: ClusterConfig) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            peers,
        }
    }

    /// Enter a new election term
    pub fn increment_term(&mut self) {
        self.current_term += 1;
        self.voted_for = None;
    }

    /// Adopt a higher term observed from a peer; returns true on change
    pub fn update_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }

    /// True when a vote for `candidate_id` is allowed this term
    pub fn can_vote_for(&self, candidate_id: &str) -> bool {
        match &self.voted_for {
            None => true,
            Some(voted) => voted == candidate_id,
        }
    }

    /// Serialize for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use bincode::config;
        Ok(bincode::encode_to_vec(
            bincode::serde::Compat(self),
            config::standard(),
        )?)
    }

    /// Deserialize from persisted bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }

    /// Load from the `raft-state` file, or fall back to `default`
    pub async fn load_or(path: &Path, default: Self) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(default),
            Err(err) => Err(err.into()),
        }
    }

    /// Durably write to the `raft-state` file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&self.to_bytes()?).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// State rebuilt on restart
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest entry known committed
    pub commit_index: LogIndex,

    /// Highest entry applied locally
    pub last_applied: LogIndex,
}

impl VolatileState {
    /// Advance the commit index, never backwards
    pub fn update_commit_index(&mut self, index: LogIndex) -> bool {
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }
}

/// Replication bookkeeping, reinitialized on election
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next entry to send, per follower
    pub next_index: HashMap<PeerId, LogIndex>,

    /// Highest replicated entry, per follower
    pub match_index: HashMap<PeerId, LogIndex>,
}

impl LeaderState {
    /// Fresh bookkeeping for the given followers
    pub fn new(followers: &[PeerId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for follower in followers {
            next_index.insert(follower.clone(), last_log_index + 1);
            match_index.insert(follower.clone(), 0);
        }
        Self {
            next_index,
            match_index,
        }
    }

    /// Back off after a failed consistency check
    pub fn decrement_next_index(&mut self, peer_id: &str) {
        if let Some(index) = self.next_index.get_mut(peer_id) {
            if *index > 1 {
                *index -= 1;
            }
        }
    }

    /// Record successful replication up to `match_index`
    pub fn update_replication(&mut self, peer_id: &str, match_index: LogIndex) {
        self.match_index.insert(peer_id.to_string(), match_index);
        self.next_index.insert(peer_id.to_string(), match_index + 1);
    }

    /// Highest index replicated on a majority, counting the leader's
    /// own log at `own_last_index`
    pub fn majority_match(&self, own_last_index: LogIndex) -> LogIndex {
        let mut indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        indices.push(own_last_index);
        indices.sort_unstable();
        // With n entries, element n - majority is the highest index
        // that a majority has reached.
        let majority = replog_core::majority_of(indices.len());
        indices[indices.len() - majority]
    }

    /// Lowest index any follower still needs; feeds prune decisions
    pub fn min_match(&self) -> LogIndex {
        self.match_index.values().copied().min().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_core::Peer;

    fn peers() -> ClusterConfig {
        ClusterConfig::new(vec![
            Peer::new("a", "tcp://127.0.0.1:8047").unwrap(),
            Peer::new("b", "tcp://127.0.0.1:8147").unwrap(),
            Peer::new("c", "tcp://127.0.0.1:8247").unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_term_management() {
        let mut state = PersistentState::new(peers());
        assert_eq!(state.current_term, 0);

        state.increment_term();
        assert_eq!(state.current_term, 1);
        assert!(state.voted_for.is_none());

        assert!(state.update_term(5));
        assert_eq!(state.current_term, 5);
        assert!(!state.update_term(4));
    }

    #[test]
    fn test_voting() {
        let mut state = PersistentState::new(peers());
        assert!(state.can_vote_for("a"));
        state.voted_for = Some("a".to_string());
        assert!(state.can_vote_for("a"));
        assert!(!state.can_vote_for("b"));
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = std::env::temp_dir().join(format!("replog-raft-state-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("raft-state");

        let mut state = PersistentState::new(peers());
        state.current_term = 7;
        state.voted_for = Some("b".to_string());
        state.save(&path).await.unwrap();

        let loaded = PersistentState::load_or(&path, PersistentState::new(ClusterConfig::default()))
            .await
            .unwrap();
        assert_eq!(loaded.current_term, 7);
        assert_eq!(loaded.voted_for.as_deref(), Some("b"));
        assert_eq!(loaded.peers.len(), 3);

        let fresh = PersistentState::load_or(
            &dir.join("missing"),
            PersistentState::new(ClusterConfig::default()),
        )
        .await
        .unwrap();
        assert_eq!(fresh.current_term, 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_majority_match() {
        let followers = vec!["b".to_string(), "c".to_string()];
        let mut leader = LeaderState::new(&followers, 10);

        // Nothing replicated yet: only the leader has index 10.
        assert_eq!(leader.majority_match(10), 0);

        leader.update_replication("b", 8);
        assert_eq!(leader.majority_match(10), 8);

        leader.update_replication("c", 9);
        assert_eq!(leader.majority_match(10), 9);

        assert_eq!(leader.min_match(), 8);
    }

    #[test]
    fn test_next_index_backoff() {
        let followers = vec!["b".to_string()];
        let mut leader = LeaderState::new(&followers, 5);
        assert_eq!(leader.next_index["b"], 6);
        leader.decrement_next_index("b");
        assert_eq!(leader.next_index["b"], 5);
    }
}
