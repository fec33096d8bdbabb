//! Request identifiers
//!
//! A request id is a fixed 12-byte token that uniquely identifies an
//! update request. The first six bytes carry a big-endian millisecond
//! UTC timestamp; the remaining six are random. The embedded timestamp
//! drives deduplication-window expiry on the leader, independent of the
//! receiving peer's clock.

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of bytes in a request id
pub const REQUEST_ID_LEN: usize = 12;

/// Fixed-width opaque token identifying one update request
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    /// Generate a fresh id stamped with the current wall clock
    pub fn generate() -> Self {
        Self::generate_at(Utc::now().timestamp_millis())
    }

    /// Generate an id with an explicit millisecond timestamp
    pub fn generate_at(timestamp_ms: i64) -> Self {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        let ts = (timestamp_ms as u64) & 0x0000_ffff_ffff_ffff;
        bytes[..6].copy_from_slice(&ts.to_be_bytes()[2..]);
        rand::thread_rng().fill_bytes(&mut bytes[6..]);
        Self(bytes)
    }

    /// Construct from raw bytes
    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Construct from a slice, failing on wrong length
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; REQUEST_ID_LEN] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw byte view
    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }

    /// Millisecond UTC timestamp embedded in the id
    pub fn timestamp_ms(&self) -> i64 {
        let mut buf = [0u8; 8];
        buf[2..].copy_from_slice(&self.0[..6]);
        u64::from_be_bytes(buf) as i64
    }

    /// True if the id's embedded timestamp is within `window` of `now_ms`
    ///
    /// Ids stamped in the future (up to the window) are also accepted so
    /// that modest clock skew between producers does not reject writes.
    pub fn is_fresh(&self, window: Duration, now_ms: i64) -> bool {
        let ts = self.timestamp_ms();
        let window_ms = window.as_millis() as i64;
        ts >= now_ms - window_ms && ts <= now_ms + window_ms
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now().timestamp_millis();
        let id = RequestId::generate_at(now);
        assert_eq!(id.timestamp_ms(), now);
    }

    #[test]
    fn test_uniqueness() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_freshness_window() {
        let now = 1_700_000_000_000i64;
        let window = Duration::from_secs(3600);

        let fresh = RequestId::generate_at(now - 1000);
        assert!(fresh.is_fresh(window, now));

        let expired = RequestId::generate_at(now - 3_600_001);
        assert!(!expired.is_fresh(window, now));

        let skewed = RequestId::generate_at(now + 5000);
        assert!(skewed.is_fresh(window, now));
    }

    #[test]
    fn test_slice_conversion() {
        let id = RequestId::generate();
        let parsed = RequestId::from_slice(id.as_bytes()).unwrap();
        assert_eq!(id, parsed);

        assert!(RequestId::from_slice(&[0u8; 11]).is_none());
    }

    #[test]
    fn test_display_hex() {
        let id = RequestId::from_bytes([0xab; 12]);
        assert_eq!(id.to_string(), "ab".repeat(12));
    }
}
