//! Segment files
//!
//! A segment is a length-prefixed sequence of records:
//!
//! ```text
//! [len u32 BE | entry bytes | checksum u64 BE]*
//! ```
//!
//! followed, once the segment is sealed, by an index footer mapping
//! relative positions to byte offsets:
//!
//! ```text
//! [count u32 | offsets u64* | first_index u64 | footer_len u32 | magic u32]
//! ```
//!
//! The active (last) segment has no footer; its offsets are rebuilt by a
//! forward scan on open, which also truncates a torn tail left by a
//! crash. A sealed segment that fails its scan is fatal.

use crate::{Result, StorageError};
use replog_core::{LogEntry, LogIndex};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::warn;

const FOOTER_MAGIC: u32 = 0x5345_474c;

/// Largest record accepted when scanning; larger length prefixes are
/// treated as corruption
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// File name of the segment whose first entry has `first_index`
pub fn segment_file_name(first_index: LogIndex) -> String {
    format!("{:020}.seg", first_index)
}

/// Parse a segment file name back into its first index
pub fn parse_segment_file_name(name: &str) -> Option<LogIndex> {
    let stem = name.strip_suffix(".seg")?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

/// One segment of the log, with its record offsets resident in memory
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    first_index: LogIndex,
    /// Byte offset of each record, in index order
    offsets: Vec<u64>,
    /// End of the record region (file size excluding any footer)
    records_end: u64,
    sealed: bool,
}

impl Segment {
    /// Create a new empty, unsealed segment file
    pub async fn create(dir: &Path, first_index: LogIndex) -> Result<Self> {
        let path = dir.join(segment_file_name(first_index));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            first_index,
            offsets: Vec::new(),
            records_end: 0,
            sealed: false,
        })
    }

    /// Open an existing segment
    ///
    /// `interior` marks segments other than the last one: a torn tail is
    /// only tolerated (and truncated away) on the last segment.
    pub async fn open(path: PathBuf, interior: bool) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let first_index = parse_segment_file_name(&name).ok_or_else(|| {
            StorageError::CorruptLog(format!("unparseable segment name: {}", name))
        })?;

        let mut file = File::open(&path).await?;
        let file_len = file.metadata().await?.len();

        if let Some(segment) = Self::open_sealed(&path, first_index, &mut file, file_len).await? {
            return Ok(segment);
        }

        Self::open_by_scan(path, first_index, &mut file, file_len, interior).await
    }

    /// Try to open via the footer; returns None when no footer is present
    async fn open_sealed(
        path: &Path,
        first_index: LogIndex,
        file: &mut File,
        file_len: u64,
    ) -> Result<Option<Segment>> {
        if file_len < 8 {
            return Ok(None);
        }
        file.seek(SeekFrom::End(-8)).await?;
        let footer_len = file.read_u32().await? as u64;
        let magic = file.read_u32().await?;
        if magic != FOOTER_MAGIC {
            return Ok(None);
        }
        if footer_len + 8 > file_len {
            return Err(StorageError::CorruptLog(format!(
                "{}: footer length {} exceeds file",
                path.display(),
                footer_len
            )));
        }

        let footer_start = file_len - 8 - footer_len;
        file.seek(SeekFrom::Start(footer_start)).await?;
        let count = file.read_u32().await? as usize;
        if footer_len != 4 + 8 * count as u64 + 8 {
            return Err(StorageError::CorruptLog(format!(
                "{}: footer length does not match entry count",
                path.display()
            )));
        }
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(file.read_u64().await?);
        }
        let footer_first = file.read_u64().await?;
        if footer_first != first_index {
            return Err(StorageError::CorruptLog(format!(
                "{}: footer first index {} does not match name",
                path.display(),
                footer_first
            )));
        }

        Ok(Some(Segment {
            path: path.to_path_buf(),
            first_index,
            offsets,
            records_end: footer_start,
            sealed: true,
        }))
    }

    /// Rebuild offsets by scanning records forward
    async fn open_by_scan(
        path: PathBuf,
        first_index: LogIndex,
        file: &mut File,
        file_len: u64,
        interior: bool,
    ) -> Result<Segment> {
        let mut offsets = Vec::new();
        let mut pos = 0u64;
        let mut expected = first_index;
        file.seek(SeekFrom::Start(0)).await?;

        let truncate_at = loop {
            if pos == file_len {
                break None;
            }
            if pos + 4 > file_len {
                break Some(pos);
            }
            let len = file.read_u32().await? as u64;
            if len as usize > MAX_RECORD_LEN || pos + 4 + len + 8 > file_len {
                break Some(pos);
            }
            let mut entry_bytes = vec![0u8; len as usize];
            file.read_exact(&mut entry_bytes).await?;
            let stored_sum = file.read_u64().await?;
            if checksum(&entry_bytes) != stored_sum {
                break Some(pos);
            }
            let entry = match LogEntry::decode(&entry_bytes) {
                Ok(entry) => entry,
                Err(_) => break Some(pos),
            };
            if entry.index != expected {
                break Some(pos);
            }
            offsets.push(pos);
            expected += 1;
            pos += 4 + len + 8;
        };

        if let Some(at) = truncate_at {
            if interior {
                return Err(StorageError::CorruptLog(format!(
                    "{}: corrupt record at offset {}",
                    path.display(),
                    at
                )));
            }
            warn!(
                segment = %path.display(),
                offset = at,
                "truncating torn tail from last segment"
            );
            let writable = OpenOptions::new().write(true).open(&path).await?;
            writable.set_len(at).await?;
            writable.sync_all().await?;
            pos = at;
        }

        Ok(Segment {
            path,
            first_index,
            offsets,
            records_end: pos,
            sealed: false,
        })
    }

    /// First index this segment covers
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Last index present, or None when empty
    pub fn last_index(&self) -> Option<LogIndex> {
        if self.offsets.is_empty() {
            None
        } else {
            Some(self.first_index + self.offsets.len() as u64 - 1)
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True when no entries have been written yet
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Bytes occupied by records
    pub fn byte_size(&self) -> u64 {
        self.records_end
    }

    /// True once the footer has been written
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when `index` falls inside this segment
    pub fn contains(&self, index: LogIndex) -> bool {
        index >= self.first_index && Some(index) <= self.last_index()
    }

    /// Append one encoded entry through the given writer handle
    pub async fn append(&mut self, writer: &mut File, entry: &LogEntry) -> Result<()> {
        debug_assert!(!self.sealed);
        let entry_bytes = entry.encode();
        let mut record = Vec::with_capacity(4 + entry_bytes.len() + 8);
        record.extend_from_slice(&(entry_bytes.len() as u32).to_be_bytes());
        record.extend_from_slice(&entry_bytes);
        record.extend_from_slice(&checksum(&entry_bytes).to_be_bytes());
        writer.write_all(&record).await?;
        self.offsets.push(self.records_end);
        self.records_end += record.len() as u64;
        Ok(())
    }

    /// Write the index footer and make the segment immutable
    pub async fn seal(&mut self, writer: &mut File) -> Result<()> {
        debug_assert!(!self.sealed);
        let mut footer = Vec::with_capacity(4 + 8 * self.offsets.len() + 16);
        footer.extend_from_slice(&(self.offsets.len() as u32).to_be_bytes());
        for offset in &self.offsets {
            footer.extend_from_slice(&offset.to_be_bytes());
        }
        footer.extend_from_slice(&self.first_index.to_be_bytes());
        let footer_len = footer.len() as u32;
        footer.extend_from_slice(&footer_len.to_be_bytes());
        footer.extend_from_slice(&FOOTER_MAGIC.to_be_bytes());
        writer.write_all(&footer).await?;
        writer.sync_all().await?;
        self.sealed = true;
        Ok(())
    }

    /// Read the entry at `index`
    pub async fn read(&self, index: LogIndex) -> Result<LogEntry> {
        let rel = index.checked_sub(self.first_index).ok_or_else(|| {
            StorageError::InvalidIndex {
                index,
                reason: "below segment range".into(),
            }
        })? as usize;
        let offset = *self.offsets.get(rel).ok_or_else(|| StorageError::InvalidIndex {
            index,
            reason: "beyond segment range".into(),
        })?;

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let len = file.read_u32().await? as usize;
        if len > MAX_RECORD_LEN {
            return Err(StorageError::CorruptLog(format!(
                "{}: record length {} at offset {}",
                self.path.display(),
                len,
                offset
            )));
        }
        let mut entry_bytes = vec![0u8; len];
        file.read_exact(&mut entry_bytes).await?;
        let stored_sum = file.read_u64().await?;
        if checksum(&entry_bytes) != stored_sum {
            return Err(StorageError::CorruptLog(format!(
                "{}: checksum mismatch at index {}",
                self.path.display(),
                index
            )));
        }
        let entry = LogEntry::decode(&entry_bytes)?;
        if entry.index != index {
            return Err(StorageError::CorruptLog(format!(
                "{}: entry index {} where {} expected",
                self.path.display(),
                entry.index,
                index
            )));
        }
        Ok(entry)
    }

    /// Drop entries with index greater than `index`, shrinking the file
    pub async fn truncate_after(&mut self, index: LogIndex) -> Result<()> {
        if Some(index) >= self.last_index() {
            return Ok(());
        }
        let keep = (index + 1).saturating_sub(self.first_index) as usize;
        let new_end = if keep == 0 {
            0
        } else {
            // Offset of the first dropped record bounds the kept region.
            self.offsets[keep]
        };
        let writable = OpenOptions::new().write(true).open(&self.path).await?;
        writable.set_len(new_end).await?;
        writable.sync_all().await?;
        self.offsets.truncate(keep);
        self.records_end = new_end;
        self.sealed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_core::RequestId;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("replog-segment-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(index: LogIndex) -> LogEntry {
        LogEntry::new(index, 1, RequestId::generate(), format!("e{}", index).into_bytes())
    }

    async fn writer_for(segment: &Segment) -> File {
        OpenOptions::new()
            .append(true)
            .open(segment.path())
            .await
            .unwrap()
    }

    #[test]
    fn test_segment_names_sort_with_indexes() {
        let names: Vec<String> = [1u64, 9, 10, 11, 99, 100, 1_000_000]
            .iter()
            .map(|i| segment_file_name(*i))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
        assert_eq!(parse_segment_file_name(&names[2]), Some(10));
        assert_eq!(parse_segment_file_name("garbage.seg"), None);
    }

    #[tokio::test]
    async fn test_append_read_roundtrip() {
        let dir = test_dir("roundtrip");
        let mut segment = Segment::create(&dir, 5).await.unwrap();
        let mut writer = writer_for(&segment).await;

        for i in 5..8 {
            segment.append(&mut writer, &entry(i)).await.unwrap();
        }
        writer.sync_all().await.unwrap();

        assert_eq!(segment.last_index(), Some(7));
        let read = segment.read(6).await.unwrap();
        assert_eq!(read.payload, b"e6");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_seal_and_reopen() {
        let dir = test_dir("seal");
        let mut segment = Segment::create(&dir, 1).await.unwrap();
        let mut writer = writer_for(&segment).await;
        for i in 1..4 {
            segment.append(&mut writer, &entry(i)).await.unwrap();
        }
        segment.seal(&mut writer).await.unwrap();
        let path = segment.path().to_path_buf();
        drop(segment);

        let reopened = Segment::open(path, true).await.unwrap();
        assert!(reopened.is_sealed());
        assert_eq!(reopened.last_index(), Some(3));
        assert_eq!(reopened.read(2).await.unwrap().payload, b"e2");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_on_scan() {
        let dir = test_dir("torn");
        let mut segment = Segment::create(&dir, 1).await.unwrap();
        let mut writer = writer_for(&segment).await;
        for i in 1..3 {
            segment.append(&mut writer, &entry(i)).await.unwrap();
        }
        writer.sync_all().await.unwrap();
        let path = segment.path().to_path_buf();
        let good_len = segment.byte_size();
        drop(segment);

        // Simulate a crash mid-append: a length prefix with half a record.
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_be_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let reopened = Segment::open(path.clone(), false).await.unwrap();
        assert_eq!(reopened.last_index(), Some(2));
        assert_eq!(reopened.byte_size(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_interior_corruption_is_fatal() {
        let dir = test_dir("interior");
        let mut segment = Segment::create(&dir, 1).await.unwrap();
        let mut writer = writer_for(&segment).await;
        for i in 1..3 {
            segment.append(&mut writer, &entry(i)).await.unwrap();
        }
        writer.sync_all().await.unwrap();
        let path = segment.path().to_path_buf();
        drop(segment);

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(6)).unwrap();
            file.write_all(&[0xff; 4]).unwrap();
        }

        let err = Segment::open(path, true).await.unwrap_err();
        assert!(matches!(err, StorageError::CorruptLog(_)));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_truncate_after() {
        let dir = test_dir("truncate");
        let mut segment = Segment::create(&dir, 1).await.unwrap();
        let mut writer = writer_for(&segment).await;
        for i in 1..6 {
            segment.append(&mut writer, &entry(i)).await.unwrap();
        }
        writer.sync_all().await.unwrap();
        drop(writer);

        segment.truncate_after(3).await.unwrap();
        assert_eq!(segment.last_index(), Some(3));
        assert!(segment.read(4).await.is_err());
        assert_eq!(segment.read(3).await.unwrap().payload, b"e3");

        // Truncating at or past the end is a no-op.
        segment.truncate_after(10).await.unwrap();
        assert_eq!(segment.last_index(), Some(3));

        let _ = std::fs::remove_dir_all(dir);
    }
}
