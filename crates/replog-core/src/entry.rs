//! Log entry and snapshot chunk types with their binary codec
//!
//! Entries are framed as a fixed 17-byte header followed by the payload:
//!
//! ```text
//! [request_id (12) | kind (1) | term (4, BE) | index (LEB128 varint)] payload
//! ```
//!
//! The header width is stable within a cluster. Decoding consumes the
//! whole input slice; the payload extent comes from the outer framing
//! (segment record or wire frame), so chunks never split an entry.

use crate::request_id::{RequestId, REQUEST_ID_LEN};
use crate::{CoreError, LogIndex, Result, Term};
use serde::{Deserialize, Serialize};

/// Fixed portion of the entry header, before the index varint
pub const ENTRY_HEADER_LEN: usize = REQUEST_ID_LEN + 1 + 4;

/// Discriminates what an entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Opaque application state update
    State = 0,
    /// Cluster membership change; payload is the encoded peer list
    Config = 1,
    /// Marker entry written by a new leader to assert its term
    Checkpoint = 2,
}

impl TryFrom<u8> for EntryKind {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EntryKind::State),
            1 => Ok(EntryKind::Config),
            2 => Ok(EntryKind::Checkpoint),
            other => Err(CoreError::UnknownEntryKind(other)),
        }
    }
}

/// One immutable record of the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, dense and starting at 1
    pub index: LogIndex,

    /// Leader epoch that produced the entry
    pub term: Term,

    /// What the payload carries
    pub kind: EntryKind,

    /// Producer-assigned id used for deduplication
    pub request_id: RequestId,

    /// Opaque bytes
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a state entry
    pub fn new(index: LogIndex, term: Term, request_id: RequestId, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::State,
            request_id,
            payload,
        }
    }

    /// Create an entry of an explicit kind
    pub fn with_kind(
        index: LogIndex,
        term: Term,
        kind: EntryKind,
        request_id: RequestId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            index,
            term,
            kind,
            request_id,
            payload,
        }
    }

    /// Size of the encoded form in bytes
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_LEN + varint_len(self.index) + self.payload.len()
    }

    /// Encode into the fixed wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(self.request_id.as_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.term.to_be_bytes());
        write_varint(&mut buf, self.index);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from a slice holding exactly one entry
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_HEADER_LEN + 1 {
            return Err(CoreError::Truncated {
                needed: ENTRY_HEADER_LEN + 1,
                have: bytes.len(),
            });
        }

        let request_id = RequestId::from_slice(&bytes[..REQUEST_ID_LEN])
            .expect("slice length checked above");
        let kind = EntryKind::try_from(bytes[REQUEST_ID_LEN])?;
        let term = Term::from_be_bytes(
            bytes[REQUEST_ID_LEN + 1..ENTRY_HEADER_LEN]
                .try_into()
                .expect("slice length checked above"),
        );

        let rest = &bytes[ENTRY_HEADER_LEN..];
        let (index, consumed) = read_varint(rest).ok_or(CoreError::Truncated {
            needed: ENTRY_HEADER_LEN + 1,
            have: bytes.len(),
        })?;
        let payload = rest[consumed..].to_vec();

        Ok(Self {
            index,
            term,
            kind,
            request_id,
            payload,
        })
    }
}

/// One chunk of a streamed snapshot transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// Last log index the snapshot covers
    pub index: LogIndex,

    /// Offset of this chunk within the snapshot body
    pub byte_offset: u64,

    /// Total size of the snapshot body
    pub byte_size: u64,

    /// True for the final chunk of the transfer
    pub is_last: bool,

    /// Chunk bytes
    pub payload: Vec<u8>,
}

impl SnapshotChunk {
    /// True when this chunk completes the transfer
    pub fn completes_transfer(&self) -> bool {
        self.is_last
    }
}

/// Pack whole entries into one chunk, each behind a length prefix so
/// the receiver can split them back apart
pub fn encode_entry_chunk(entries: &[LogEntry]) -> Vec<u8> {
    let total: usize = entries.iter().map(|e| 4 + e.encoded_len()).sum();
    let mut chunk = Vec::with_capacity(total);
    for entry in entries {
        let bytes = entry.encode();
        chunk.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        chunk.extend_from_slice(&bytes);
    }
    chunk
}

/// Split a chunk produced by [`encode_entry_chunk`] back into entries
pub fn decode_entry_chunk(mut bytes: &[u8]) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(CoreError::Truncated {
                needed: 4,
                have: bytes.len(),
            });
        }
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        if bytes.len() < 4 + len {
            return Err(CoreError::Truncated {
                needed: 4 + len,
                have: bytes.len(),
            });
        }
        entries.push(LogEntry::decode(&bytes[4..4 + len])?);
        bytes = &bytes[4 + len..];
    }
    Ok(entries)
}

/// Number of bytes the LEB128 encoding of `value` occupies
pub fn varint_len(value: u64) -> usize {
    let mut v = value;
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Append the LEB128 encoding of `value` to `buf`
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Read a LEB128 value, returning it and the bytes consumed
pub fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(index: LogIndex) -> LogEntry {
        LogEntry::new(index, 3, RequestId::generate(), b"payload".to_vec())
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            let (decoded, consumed) = read_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        assert!(read_varint(&[]).is_none());
        assert!(read_varint(&[0x80]).is_none());
        assert!(read_varint(&[0x80, 0x80]).is_none());
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = sample_entry(42);
        let bytes = entry.encode();
        assert_eq!(bytes.len(), entry.encoded_len());
        let decoded = LogEntry::decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_entry_roundtrip_large_index() {
        let entry = sample_entry(u64::MAX);
        let decoded = LogEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded.index, u64::MAX);
    }

    #[test]
    fn test_entry_empty_payload() {
        let entry = LogEntry::with_kind(
            1,
            1,
            EntryKind::Checkpoint,
            RequestId::generate(),
            Vec::new(),
        );
        let decoded = LogEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded.kind, EntryKind::Checkpoint);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_entry_truncated() {
        let entry = sample_entry(7);
        let bytes = entry.encode();
        assert!(LogEntry::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_entry_chunk_roundtrip() {
        let entries = vec![sample_entry(3), sample_entry(4), sample_entry(5)];
        let chunk = encode_entry_chunk(&entries);
        let decoded = decode_entry_chunk(&chunk).unwrap();
        assert_eq!(decoded, entries);

        assert!(decode_entry_chunk(&[]).unwrap().is_empty());
        assert!(decode_entry_chunk(&chunk[..chunk.len() - 1]).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = sample_entry(7).encode();
        bytes[REQUEST_ID_LEN] = 9;
        assert!(matches!(
            LogEntry::decode(&bytes),
            Err(CoreError::UnknownEntryKind(9))
        ));
    }
}
