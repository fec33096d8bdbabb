//! Log compaction
//!
//! A compaction job replays the log prefix into an application state
//! machine, serializes the resulting state (optionally gzip-compressed),
//! writes a snapshot file, and installs it into the log, which removes
//! the segments the snapshot covers.

use crate::file::{SnapshotFile, SnapshotWriter};
use crate::{Result, SnapshotError};
use flate2::write::GzEncoder;
use flate2::Compression;
use replog_core::LogIndex;
use replog_storage::{FileLog, StateMachine};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Options for one compaction run
#[derive(Debug, Clone)]
pub struct CompactionOptions {
    /// Gzip level 0..=9; None stores the state uncompressed
    pub compression: Option<u32>,

    /// Whether the snapshot is later served in its compressed form;
    /// when false, consumers expect the body decompressed on read
    pub serve_compressed: bool,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            compression: None,
            serve_compressed: true,
        }
    }
}

/// Gzip-compress state bytes at the given level
pub fn compress_state(data: &[u8], level: u32) -> Result<Vec<u8>> {
    if level > 9 {
        return Err(SnapshotError::InvalidCompressionLevel(level));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| SnapshotError::Compression(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SnapshotError::Compression(format!("finish compression failed: {}", e)))
}

/// Decompress a gzip-compressed snapshot body
pub fn decompress_state(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| SnapshotError::Compression(format!("decompression failed: {}", e)))?;
    Ok(out)
}

/// Compact the log up to `target_index`
///
/// Applies entries through `sm`, writes the snapshot at `snapshot_path`,
/// and installs it, pruning covered segments. Returns the new snapshot.
pub async fn compact(
    log: &mut FileLog,
    sm: &mut dyn StateMachine,
    snapshot_path: &Path,
    target_index: LogIndex,
    options: CompactionOptions,
) -> Result<SnapshotFile> {
    if target_index <= log.snapshot_meta().last_included_index || target_index > log.last_index() {
        return Err(SnapshotError::MissingIndex(target_index));
    }
    if let Some(level) = options.compression {
        if level > 9 {
            return Err(SnapshotError::InvalidCompressionLevel(level));
        }
    }

    let target_term = log
        .term_at(target_index)
        .await?
        .ok_or(SnapshotError::MissingIndex(target_index))?;

    let applied = log.feed_state_machine(sm, target_index).await?;
    if applied < target_index {
        return Err(SnapshotError::MissingIndex(applied + 1));
    }

    let state = sm.snapshot_bytes().ok_or(SnapshotError::NoSerialization)?;
    let (body, compressed) = match options.compression {
        Some(level) => (compress_state(&state, level)?, true),
        None => (state, false),
    };

    let meta = replog_storage::SnapshotMeta {
        last_included_index: target_index,
        last_included_term: target_term,
    };
    let (writer, _ready) =
        SnapshotWriter::begin(snapshot_path, meta, body.len() as u64, compressed).await?;
    let mut writer = writer.serve_compressed(options.serve_compressed);
    writer.write_chunk(&body).await?;
    let snapshot = writer.finish().await?;
    log.install_snapshot(meta).await?;

    info!(
        target = target_index,
        term = target_term,
        size = snapshot.data_size(),
        compressed,
        "compaction complete"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use replog_core::{LogEntry, RequestId};
    use replog_storage::{LogOptions, SnapshotMeta};
    use std::path::PathBuf;

    struct SummingMachine {
        last_applied: LogIndex,
        sum: u64,
    }

    #[async_trait]
    impl StateMachine for SummingMachine {
        fn last_applied(&self) -> LogIndex {
            self.last_applied
        }

        async fn apply(&mut self, entry: &LogEntry) -> replog_storage::Result<()> {
            self.sum += entry.payload.len() as u64;
            self.last_applied = entry.index;
            Ok(())
        }

        fn snapshot_bytes(&self) -> Option<Vec<u8>> {
            Some(self.sum.to_be_bytes().to_vec())
        }
    }

    struct OpaqueMachine {
        last_applied: LogIndex,
    }

    #[async_trait]
    impl StateMachine for OpaqueMachine {
        fn last_applied(&self) -> LogIndex {
            self.last_applied
        }

        async fn apply(&mut self, entry: &LogEntry) -> replog_storage::Result<()> {
            self.last_applied = entry.index;
            Ok(())
        }
    }

    fn test_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("replog-compact-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn filled_log(dir: &Path, entries: u64) -> FileLog {
        let mut log = FileLog::open(
            dir.join("log"),
            SnapshotMeta::default(),
            LogOptions {
                max_entries_per_segment: 100,
                max_bytes_per_segment: 1024 * 1024,
            },
        )
        .await
        .unwrap();
        for _ in 0..entries {
            let index = log.next_index();
            let entry = LogEntry::new(index, 1, RequestId::generate(), vec![b'x'; 8]);
            log.append(entry).await.unwrap();
        }
        log.flush().await.unwrap();
        log
    }

    #[tokio::test]
    async fn test_compaction_install() {
        let dir = test_dir("install");
        let mut log = filled_log(&dir, 1000).await;
        let mut sm = SummingMachine {
            last_applied: 0,
            sum: 0,
        };

        let snapshot = compact(
            &mut log,
            &mut sm,
            &dir.join("snap"),
            500,
            CompactionOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.meta().last_included_index, 500);
        assert_eq!(log.first_index(), 501);
        assert!(log.read(500).await.unwrap().is_none());
        assert_eq!(log.read(501).await.unwrap().unwrap().index, 501);
        assert_eq!(sm.sum, 500 * 8);

        // Segments fully below the boundary are gone.
        assert!(log.list_segments_before(501).is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_compaction_compressed_roundtrip() {
        let dir = test_dir("gzip");
        let mut log = filled_log(&dir, 20).await;
        let mut sm = SummingMachine {
            last_applied: 0,
            sum: 0,
        };

        let snapshot = compact(
            &mut log,
            &mut sm,
            &dir.join("snap"),
            20,
            CompactionOptions {
                compression: Some(6),
                serve_compressed: true,
            },
        )
        .await
        .unwrap();

        assert!(snapshot.is_compressed());
        let body = snapshot.read_body().await.unwrap();
        let state = decompress_state(&body).unwrap();
        assert_eq!(state, (20u64 * 8).to_be_bytes().to_vec());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_compaction_rejects_bad_target() {
        let dir = test_dir("target");
        let mut log = filled_log(&dir, 10).await;
        let mut sm = SummingMachine {
            last_applied: 0,
            sum: 0,
        };

        let err = compact(
            &mut log,
            &mut sm,
            &dir.join("snap"),
            11,
            CompactionOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SnapshotError::MissingIndex(11)));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_compaction_requires_serialization() {
        let dir = test_dir("noser");
        let mut log = filled_log(&dir, 10).await;
        let mut sm = OpaqueMachine { last_applied: 0 };

        let err = compact(
            &mut log,
            &mut sm,
            &dir.join("snap"),
            5,
            CompactionOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SnapshotError::NoSerialization));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_invalid_compression_level() {
        assert!(matches!(
            compress_state(b"data", 10),
            Err(SnapshotError::InvalidCompressionLevel(10))
        ));
        let compressed = compress_state(b"data data data", 9).unwrap();
        assert_eq!(decompress_state(&compressed).unwrap(), b"data data data");
    }
}
