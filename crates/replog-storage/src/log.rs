//! The file-backed rolling log
//!
//! A log directory holds segment files plus a `lock` file asserting the
//! exclusive writer. Appends go to the last (active) segment, which
//! rolls over by entry count or byte size; durability is via fsync on
//! `flush` and on segment seal. Installing a snapshot moves the log's
//! base forward and removes the segments the snapshot covers.

use crate::segment::{parse_segment_file_name, Segment};
use crate::state_machine::StateMachine;
use crate::{Result, StorageError};
use replog_core::{LogEntry, LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tracing::{debug, info};

/// Rollover and durability options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOptions {
    /// Entries per segment before rollover
    pub max_entries_per_segment: usize,

    /// Bytes per segment before rollover
    pub max_bytes_per_segment: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            max_entries_per_segment: 16 * 1024,
            max_bytes_per_segment: 16 * 1024 * 1024,
        }
    }
}

/// Identity of an installed snapshot, as far as the log cares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Entries up to and including this index live in the snapshot
    pub last_included_index: LogIndex,

    /// Term of the entry at `last_included_index`
    pub last_included_term: Term,
}

/// Exclusive advisory lock on the log directory, released on drop
#[derive(Debug)]
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join("lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::Locked(path))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The durable, segmented, compactable log
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    options: LogOptions,
    /// Segments in index order; the last one is active
    segments: Vec<Segment>,
    /// Append handle for the active segment
    writer: Option<File>,
    /// Compacted prefix boundary
    base: SnapshotMeta,
    /// Term of the last entry (or of the base when empty)
    last_term: Term,
    _lock: DirLock,
}

impl FileLog {
    /// Open (or create) the log in `dir`, recovering from a crash
    ///
    /// `base` names the currently installed snapshot; the log's first
    /// index becomes `base.last_included_index + 1`.
    pub async fn open(dir: impl Into<PathBuf>, base: SnapshotMeta, options: LogOptions) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let lock = DirLock::acquire(&dir)?;

        let mut names = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = listing.next_entry().await? {
            let name = dirent.file_name().to_string_lossy().into_owned();
            if parse_segment_file_name(&name).is_some() {
                names.push(name);
            }
        }
        names.sort();

        let mut log = Self {
            dir,
            options,
            segments: Vec::with_capacity(names.len()),
            writer: None,
            base,
            last_term: base.last_included_term,
            _lock: lock,
        };

        for (i, name) in names.iter().enumerate() {
            let interior = i + 1 < names.len();
            let segment = Segment::open(log.dir.join(name), interior).await?;
            log.segments.push(segment);
        }

        log.apply_snapshot_bound(base).await?;
        log.check_chain()?;

        let last = log.last_index();
        if last > base.last_included_index {
            log.last_term = log
                .read(last)
                .await?
                .map(|entry| entry.term)
                .unwrap_or(base.last_included_term);
        }

        info!(
            dir = %log.dir.display(),
            first = log.first_index(),
            last = log.last_index(),
            segments = log.segments.len(),
            "opened log"
        );
        Ok(log)
    }

    /// Verify segment chain density and ordering
    fn check_chain(&self) -> Result<()> {
        let mut expected = self.base.last_included_index + 1;
        for (i, segment) in self.segments.iter().enumerate() {
            if segment.first_index() != expected {
                return Err(StorageError::CorruptLog(format!(
                    "segment {} starts at {} where {} expected",
                    segment.path().display(),
                    segment.first_index(),
                    expected
                )));
            }
            if segment.is_empty() && i + 1 < self.segments.len() {
                return Err(StorageError::CorruptLog(format!(
                    "empty interior segment {}",
                    segment.path().display()
                )));
            }
            expected = segment.last_index().map(|l| l + 1).unwrap_or(expected);
        }
        Ok(())
    }

    /// First index present (or the virtual first index when empty)
    pub fn first_index(&self) -> LogIndex {
        self.base.last_included_index + 1
    }

    /// Highest index present; equals the base index when empty
    pub fn last_index(&self) -> LogIndex {
        self.segments
            .iter()
            .rev()
            .find_map(|s| s.last_index())
            .unwrap_or(self.base.last_included_index)
    }

    /// Index the next append will receive
    pub fn next_index(&self) -> LogIndex {
        self.last_index() + 1
    }

    /// Term of the newest entry (or of the snapshot when empty)
    pub fn last_term(&self) -> Term {
        self.last_term
    }

    /// Currently installed snapshot boundary
    pub fn snapshot_meta(&self) -> SnapshotMeta {
        self.base
    }

    /// True when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.last_index() == self.base.last_included_index
    }

    async fn reopen_writer(&mut self) -> Result<()> {
        let active = self.segments.last().expect("active segment exists");
        self.writer = Some(
            OpenOptions::new()
                .append(true)
                .open(active.path())
                .await?,
        );
        Ok(())
    }

    /// Seal the active segment if full and open a fresh one as needed
    async fn roll_if_needed(&mut self) -> Result<()> {
        let needs_new = match self.segments.last() {
            None => true,
            Some(active) if active.is_sealed() => true,
            Some(active) => {
                active.len() >= self.options.max_entries_per_segment
                    || active.byte_size() >= self.options.max_bytes_per_segment
            }
        };
        if !needs_new {
            if self.writer.is_none() {
                self.reopen_writer().await?;
            }
            return Ok(());
        }

        if let Some(active) = self.segments.last_mut() {
            if !active.is_sealed() && !active.is_empty() {
                let mut writer = match self.writer.take() {
                    Some(writer) => writer,
                    None => OpenOptions::new().append(true).open(active.path()).await?,
                };
                active.seal(&mut writer).await?;
                debug!(segment = %active.path().display(), "sealed segment");
            }
        }

        let first = self.next_index();
        let segment = Segment::create(&self.dir, first).await?;
        self.segments.push(segment);
        self.reopen_writer().await?;
        Ok(())
    }

    /// Durable append at the next index
    ///
    /// The entry's index must equal `next_index()` and its term must not
    /// regress; anything else means the caller and the disk disagree.
    pub async fn append(&mut self, entry: LogEntry) -> Result<LogIndex> {
        let next = self.next_index();
        if entry.index != next {
            return Err(StorageError::InvalidIndex {
                index: entry.index,
                reason: format!("next append index is {}", next),
            });
        }
        if entry.term < self.last_term {
            return Err(StorageError::CorruptLog(format!(
                "term regression: {} after {}",
                entry.term, self.last_term
            )));
        }

        self.roll_if_needed().await?;
        let writer = self.writer.as_mut().expect("writer opened by roll_if_needed");
        let active = self.segments.last_mut().expect("active segment exists");
        active.append(writer, &entry).await?;
        self.last_term = entry.term;
        Ok(next)
    }

    /// Fsync outstanding appends
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.sync_data().await?;
        }
        Ok(())
    }

    fn segment_for(&self, index: LogIndex) -> Option<&Segment> {
        let pos = self
            .segments
            .partition_point(|s| s.first_index() <= index);
        let segment = self.segments.get(pos.checked_sub(1)?)?;
        segment.contains(index).then_some(segment)
    }

    /// Read one entry; None below the snapshot boundary or past the end
    pub async fn read(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        if index <= self.base.last_included_index || index > self.last_index() {
            return Ok(None);
        }
        let segment = self.segment_for(index).ok_or_else(|| StorageError::CorruptLog(
            format!("no segment covers index {}", index),
        ))?;
        segment.read(index).await.map(Some)
    }

    /// Term at `index`, answering for the snapshot boundary as well
    pub async fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == self.base.last_included_index {
            return Ok(Some(self.base.last_included_term));
        }
        Ok(self.read(index).await?.map(|entry| entry.term))
    }

    /// Stream entries `from..=to` in order through `f`
    ///
    /// Stops when `f` returns false, `to` is passed, or delivering the
    /// next entry would exceed `byte_budget` (at least one entry is
    /// always delivered when available). Returns the last index
    /// delivered, or `from - 1` when none was.
    pub async fn read_range<F>(
        &self,
        from: LogIndex,
        to: LogIndex,
        byte_budget: u64,
        mut f: F,
    ) -> Result<LogIndex>
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let start = from.max(self.first_index());
        let end = to.min(self.last_index());
        let mut last_delivered = from.saturating_sub(1);
        let mut spent = 0u64;

        for index in start..=end {
            let entry = self.read(index).await?.ok_or_else(|| {
                StorageError::CorruptLog(format!("hole at index {}", index))
            })?;
            let entry_len = entry.encoded_len() as u64;
            if byte_budget > 0 && spent > 0 && spent + entry_len > byte_budget {
                break;
            }
            spent += entry_len;
            last_delivered = index;
            if !f(&entry) {
                break;
            }
        }
        Ok(last_delivered)
    }

    /// Remove all entries with index greater than `index`; idempotent
    pub async fn truncate_after(&mut self, index: LogIndex) -> Result<()> {
        if index >= self.last_index() {
            return Ok(());
        }
        if index < self.base.last_included_index {
            return Err(StorageError::InvalidIndex {
                index,
                reason: "cannot truncate into the installed snapshot".into(),
            });
        }

        while let Some(last) = self.segments.last() {
            if last.first_index() > index {
                let segment = self.segments.pop().expect("just observed");
                tokio::fs::remove_file(segment.path()).await?;
                debug!(segment = %segment.path().display(), "removed segment on truncate");
            } else {
                break;
            }
        }
        self.writer = None;

        if let Some(active) = self.segments.last_mut() {
            active.truncate_after(index).await?;
        }

        self.last_term = if index == self.base.last_included_index {
            self.base.last_included_term
        } else {
            self.read(index)
                .await?
                .map(|entry| entry.term)
                .unwrap_or(self.base.last_included_term)
        };
        Ok(())
    }

    /// Drop segments the snapshot covers, rewriting a straddling one
    async fn apply_snapshot_bound(&mut self, meta: SnapshotMeta) -> Result<()> {
        let bound = meta.last_included_index;
        if bound == 0 {
            return Ok(());
        }

        let mut kept = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            let covered = match segment.last_index() {
                Some(last) => last <= bound,
                None => segment.first_index() <= bound,
            };
            if covered {
                tokio::fs::remove_file(segment.path()).await?;
                debug!(segment = %segment.path().display(), "removed compacted segment");
            } else {
                kept.push(segment);
            }
        }
        self.segments = kept;
        self.writer = None;

        // A segment straddling the boundary keeps its tail under a new name.
        if let Some(first) = self.segments.first() {
            if first.first_index() <= bound {
                let old_path = first.path().to_path_buf();
                let last = first.last_index().expect("straddling segment is non-empty");
                let sealed = self.segments.len() > 1;

                let mut replacement = Segment::create(&self.dir, bound + 1).await?;
                let mut writer = OpenOptions::new()
                    .append(true)
                    .open(replacement.path())
                    .await?;
                for index in bound + 1..=last {
                    let entry = first.read(index).await?;
                    replacement.append(&mut writer, &entry).await?;
                }
                if sealed {
                    replacement.seal(&mut writer).await?;
                } else {
                    writer.sync_all().await?;
                }

                self.segments[0] = replacement;
                tokio::fs::remove_file(&old_path).await?;
                info!(
                    from = bound + 1,
                    to = last,
                    "rewrote straddling segment after snapshot install"
                );
            }
        }
        Ok(())
    }

    /// Atomically adopt a snapshot, replacing the log prefix it covers
    pub async fn install_snapshot(&mut self, meta: SnapshotMeta) -> Result<()> {
        if meta.last_included_index <= self.base.last_included_index {
            return Ok(());
        }

        if meta.last_included_index >= self.last_index() {
            // The snapshot supersedes everything on disk.
            for segment in self.segments.drain(..) {
                tokio::fs::remove_file(segment.path()).await?;
            }
            self.writer = None;
            self.last_term = meta.last_included_term;
        } else {
            self.apply_snapshot_bound(meta).await?;
        }

        self.base = meta;
        info!(
            last_included = meta.last_included_index,
            term = meta.last_included_term,
            "installed snapshot"
        );
        Ok(())
    }

    /// Apply committed entries up to `up_to` in index order
    pub async fn feed_state_machine(
        &self,
        sm: &mut dyn StateMachine,
        up_to: LogIndex,
    ) -> Result<LogIndex> {
        let end = up_to.min(self.last_index());
        let mut next = sm.last_applied() + 1;
        while next <= end {
            sm.poll_ready().await?;
            let entry = self.read(next).await?.ok_or_else(|| StorageError::InvalidIndex {
                index: next,
                reason: "not present in the log".into(),
            })?;
            sm.apply(&entry).await?;
            next += 1;
        }
        Ok(sm.last_applied())
    }

    /// Path of the segment holding `index`
    pub fn find_segment_of(&self, index: LogIndex) -> Option<PathBuf> {
        self.segment_for(index).map(|s| s.path().to_path_buf())
    }

    /// Paths of sealed segments entirely below `index`, oldest first
    pub fn list_segments_before(&self, index: LogIndex) -> Vec<PathBuf> {
        self.segments
            .iter()
            .filter(|s| s.is_sealed() && s.last_index().is_some_and(|l| l < index))
            .map(|s| s.path().to_path_buf())
            .collect()
    }

    /// The log directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
