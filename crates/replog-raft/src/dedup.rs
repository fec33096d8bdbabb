//! Leader-side request-id deduplication
//!
//! The leader remembers every applied request id for the freshness
//! window, keyed to the commit index it received. A repeated id within
//! the window answers with the original index instead of appending
//! again. Expiry follows the timestamp embedded in the id, not the
//! receiving peer's clock.

use chrono::Utc;
use dashmap::DashMap;
use replog_core::{LogIndex, RequestId};
use std::time::Duration;

/// Freshness-windowed map from request id to commit index
#[derive(Debug)]
pub struct DedupMap {
    applied: DashMap<RequestId, LogIndex>,
    window: Duration,
}

/// Verdict for an incoming request id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    /// Not seen before and fresh: append it
    Fresh,
    /// Already applied at this index within the window
    Applied(LogIndex),
    /// The embedded timestamp is outside the freshness window
    Expired,
}

impl DedupMap {
    /// Create a map with the given freshness window
    pub fn new(window: Duration) -> Self {
        Self {
            applied: DashMap::new(),
            window,
        }
    }

    /// The configured freshness window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Judge an incoming request id against the window and the map
    pub fn check(&self, request_id: &RequestId) -> DedupVerdict {
        if let Some(index) = self.applied.get(request_id) {
            return DedupVerdict::Applied(*index);
        }
        if !request_id.is_fresh(self.window, Utc::now().timestamp_millis()) {
            return DedupVerdict::Expired;
        }
        DedupVerdict::Fresh
    }

    /// Record an applied request id
    pub fn record(&self, request_id: RequestId, index: LogIndex) {
        self.applied.insert(request_id, index);
    }

    /// Drop ids whose embedded timestamp has left the window
    pub fn prune(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let before = self.applied.len();
        self.applied.retain(|id, _| id.is_fresh(self.window, now));
        before - self.applied.len()
    }

    /// Number of retained ids
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    /// True when no ids are retained
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_then_applied() {
        let map = DedupMap::new(Duration::from_secs(3600));
        let id = RequestId::generate();

        assert_eq!(map.check(&id), DedupVerdict::Fresh);
        map.record(id, 42);
        assert_eq!(map.check(&id), DedupVerdict::Applied(42));
    }

    #[test]
    fn test_expired_id() {
        let map = DedupMap::new(Duration::from_secs(60));
        let stale = RequestId::generate_at(Utc::now().timestamp_millis() - 120_000);
        assert_eq!(map.check(&stale), DedupVerdict::Expired);
    }

    #[test]
    fn test_prune_drops_only_stale_ids() {
        let map = DedupMap::new(Duration::from_secs(60));
        let now = Utc::now().timestamp_millis();

        let fresh = RequestId::generate_at(now);
        let stale = RequestId::generate_at(now - 120_000);
        map.record(fresh, 1);
        map.record(stale, 2);

        assert_eq!(map.prune(), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.check(&fresh), DedupVerdict::Applied(1));
    }

    #[test]
    fn test_applied_wins_over_expiry_until_pruned() {
        // An id that expired but is still in the map answers with its
        // original index; the window toggle is enforced by the caller.
        let map = DedupMap::new(Duration::from_secs(60));
        let stale = RequestId::generate_at(Utc::now().timestamp_millis() - 120_000);
        map.record(stale, 9);
        assert_eq!(map.check(&stale), DedupVerdict::Applied(9));
    }
}
