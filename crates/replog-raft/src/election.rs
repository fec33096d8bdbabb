//! Leader election pieces
//!
//! A randomized election timer prevents split votes; a vote tracker
//! counts ballots against the cluster majority.

use rand::Rng;
use replog_core::majority_of;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Election timer with a randomized timeout
#[derive(Debug)]
pub struct ElectionTimer {
    last_reset: Instant,
    timeout: Duration,
    min_timeout_ms: u64,
    max_timeout_ms: u64,
}

impl ElectionTimer {
    /// Create a timer drawing timeouts from `[min_ms, max_ms]`
    pub fn new(min_timeout_ms: u64, max_timeout_ms: u64) -> Self {
        let timeout = Self::random_timeout(min_timeout_ms, max_timeout_ms);
        Self {
            last_reset: Instant::now(),
            timeout,
            min_timeout_ms,
            max_timeout_ms,
        }
    }

    /// Restart with a fresh random timeout
    pub fn reset(&mut self) {
        self.last_reset = Instant::now();
        self.timeout = Self::random_timeout(self.min_timeout_ms, self.max_timeout_ms);
    }

    /// True once the timeout has elapsed since the last reset
    pub fn is_elapsed(&self) -> bool {
        self.last_reset.elapsed() >= self.timeout
    }

    /// Time left before expiry
    pub fn time_remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.last_reset.elapsed())
    }

    fn random_timeout(min_ms: u64, max_ms: u64) -> Duration {
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(min_ms..=max_ms))
    }
}

/// Ballot box for one candidacy
#[derive(Debug)]
pub struct VoteTracker {
    granted: HashSet<String>,
    cluster_size: usize,
}

impl VoteTracker {
    /// Start a candidacy over a cluster of `cluster_size` peers,
    /// counting the candidate's own vote
    pub fn new(own_id: &str, cluster_size: usize) -> Self {
        let mut granted = HashSet::new();
        granted.insert(own_id.to_string());
        Self {
            granted,
            cluster_size,
        }
    }

    /// Record a granted vote; duplicate ballots count once
    pub fn grant(&mut self, voter: &str) {
        self.granted.insert(voter.to_string());
    }

    /// Votes received so far
    pub fn votes(&self) -> usize {
        self.granted.len()
    }

    /// True once a majority has voted for the candidate
    pub fn has_majority(&self) -> bool {
        self.granted.len() >= majority_of(self.cluster_size)
    }
}
