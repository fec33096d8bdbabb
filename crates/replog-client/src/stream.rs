//! Streaming entry reads
//!
//! The server answers an `e` request with a sequence of messages, each
//! carrying whole log entries or one snapshot chunk, and finally a Done
//! marker. The stream checks ordering as it goes: entry indexes must be
//! dense and snapshot chunks contiguous; anything else is `OutOfOrder`,
//! which callers resolve by opening a new stream from `next_index`.

use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::{ClientError, Result};
use replog_core::{
    decode_entry_chunk, LogEntry, LogIndex, ResponseStatus, Response, SnapshotChunk,
};
use std::collections::VecDeque;
use std::time::Duration;

/// One item of an entries stream
#[derive(Debug, Clone)]
pub enum EntryStreamItem {
    /// A log entry, in dense index order
    Entry(LogEntry),
    /// A chunk of a snapshot transfer replacing the log prefix
    Chunk(SnapshotChunk),
}

/// Lazy, ordered stream over an open entries request
pub struct EntryStream {
    connection: Connection,
    correlation: u64,
    /// Next log index expected from the server
    next_index: LogIndex,
    /// Byte offset expected for the next snapshot chunk
    snapshot_offset: u64,
    buffered: VecDeque<EntryStreamItem>,
    read_timeout: Duration,
    cancel: CancelToken,
    done: bool,
}

impl EntryStream {
    pub(crate) fn new(
        connection: Connection,
        correlation: u64,
        from_index: LogIndex,
        read_timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            connection,
            correlation,
            next_index: from_index,
            snapshot_offset: 0,
            buffered: VecDeque::new(),
            read_timeout,
            cancel,
            done: false,
        }
    }

    /// Index the next entry is expected at; the resume point after an
    /// error or the end of the stream
    pub fn next_index(&self) -> LogIndex {
        self.next_index
    }

    /// Pull the next item, in order; None once the stream completes
    pub async fn next(&mut self) -> Result<Option<EntryStreamItem>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }
            self.cancel.check()?;

            let response = tokio::select! {
                response = tokio::time::timeout(
                    self.read_timeout,
                    self.connection.recv_response(self.correlation),
                ) => response.map_err(|_| ClientError::Timeout)??,
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            };

            match response {
                Response::Entries {
                    status: ResponseStatus::Done,
                    ..
                } => {
                    self.done = true;
                }
                Response::Entries {
                    status: ResponseStatus::Entries,
                    chunk,
                    ..
                } => {
                    for entry in decode_entry_chunk(&chunk)? {
                        if entry.index != self.next_index {
                            return Err(ClientError::OutOfOrder(format!(
                                "entry {} where {} expected",
                                entry.index, self.next_index
                            )));
                        }
                        self.next_index += 1;
                        self.buffered.push_back(EntryStreamItem::Entry(entry));
                    }
                }
                Response::Entries {
                    status: ResponseStatus::Snapshot,
                    last_index,
                    byte_offset,
                    byte_size,
                    chunk,
                } => {
                    if byte_offset != self.snapshot_offset {
                        return Err(ClientError::OutOfOrder(format!(
                            "snapshot chunk at byte {} where {} expected",
                            byte_offset, self.snapshot_offset
                        )));
                    }
                    self.snapshot_offset += chunk.len() as u64;
                    let is_last = self.snapshot_offset >= byte_size;
                    if is_last {
                        // Entries resume after the snapshot boundary.
                        self.next_index = last_index + 1;
                        self.snapshot_offset = 0;
                    }
                    self.buffered.push_back(EntryStreamItem::Chunk(SnapshotChunk {
                        index: last_index,
                        byte_offset,
                        byte_size,
                        is_last,
                        payload: chunk,
                    }));
                }
                Response::NotLeader { .. } => {
                    return Err(ClientError::OutOfOrder(
                        "peer lost the log mid-stream".into(),
                    ));
                }
                other => {
                    return Err(ClientError::Rejected(format!(
                        "unexpected response in entries stream: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Drain the remainder of the stream into a vector
    pub async fn collect_remaining(mut self) -> Result<Vec<EntryStreamItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}
