//! The snapshot file
//!
//! Layout:
//!
//! ```text
//! [last_included_index u64 BE | last_included_term u32 BE | data_size u64 BE] data...
//! ```
//!
//! A writer streams header-then-body into `<path>.tmp-<uuid>` beside the
//! final path, fsyncs, then renames. A `watch` signal fires once the
//! header is persisted so a dedicated install channel may stream the
//! body concurrently with the writer. A JSON sidecar records the body's
//! sha256 and whether the body is gzip-compressed; the checksum is
//! verified on open when the sidecar is present.

use crate::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use replog_storage::SnapshotMeta;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::watch;
use tracing::{info, warn};

/// Bytes in the fixed snapshot header
pub const SNAPSHOT_HEADER_LEN: u64 = 8 + 4 + 8;

/// Sidecar metadata written next to the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSidecar {
    /// Hex sha256 of the body bytes as stored
    pub checksum: String,
    /// Body size in bytes as stored
    pub size_bytes: u64,
    /// True when the body is a gzip stream
    pub compressed: bool,
    /// Whether a compressed body is served as-is; false asks the
    /// serving layer to decompress before chunking
    #[serde(default = "serve_compressed_default")]
    pub serve_compressed: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

fn serve_compressed_default() -> bool {
    true
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    path.with_file_name(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
    path.with_file_name(name)
}

/// Remove orphaned snapshot temporaries left by a crashed writer
pub async fn sweep_stale_temps(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut listing = match tokio::fs::read_dir(dir).await {
        Ok(listing) => listing,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    while let Some(dirent) = listing.next_entry().await? {
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name.contains(".tmp-") {
            warn!(file = %name, "removing stale snapshot temporary");
            tokio::fs::remove_file(dirent.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Streaming snapshot writer
pub struct SnapshotWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: File,
    meta: SnapshotMeta,
    data_size: u64,
    written: u64,
    compressed: bool,
    serve_compressed: bool,
    hasher: Sha256,
    ready_tx: watch::Sender<bool>,
}

impl SnapshotWriter {
    /// Open a temporary file and persist the header
    ///
    /// The returned receiver flips to `true` once the header has hit
    /// disk, at which point concurrent readers may begin streaming.
    pub async fn begin(
        path: &Path,
        meta: SnapshotMeta,
        data_size: u64,
        compressed: bool,
    ) -> Result<(Self, watch::Receiver<bool>)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = temp_path(path);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await?;

        let mut header = Vec::with_capacity(SNAPSHOT_HEADER_LEN as usize);
        header.extend_from_slice(&meta.last_included_index.to_be_bytes());
        header.extend_from_slice(&meta.last_included_term.to_be_bytes());
        header.extend_from_slice(&data_size.to_be_bytes());
        file.write_all(&header).await?;
        file.sync_data().await?;

        let (ready_tx, ready_rx) = watch::channel(true);

        Ok((
            Self {
                final_path: path.to_path_buf(),
                tmp_path,
                file,
                meta,
                data_size,
                written: 0,
                compressed,
                serve_compressed: true,
                hasher: Sha256::new(),
                ready_tx,
            },
            ready_rx,
        ))
    }

    /// Ask the serving layer to decompress the body before chunking
    pub fn serve_compressed(mut self, serve: bool) -> Self {
        self.serve_compressed = serve;
        self
    }

    /// Append body bytes
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.written + chunk.len() as u64 > self.data_size {
            return Err(SnapshotError::Corrupt(format!(
                "body overrun: {} bytes past declared size {}",
                self.written + chunk.len() as u64 - self.data_size,
                self.data_size
            )));
        }
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Fsync, rename into place, and write the sidecar
    pub async fn finish(self) -> Result<SnapshotFile> {
        if self.written != self.data_size {
            return Err(SnapshotError::Corrupt(format!(
                "body short: {} of {} bytes written",
                self.written, self.data_size
            )));
        }
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;

        let sidecar = SnapshotSidecar {
            checksum: format!("{:x}", self.hasher.finalize()),
            size_bytes: self.data_size,
            compressed: self.compressed,
            serve_compressed: self.serve_compressed,
            created_at: Utc::now(),
        };
        tokio::fs::write(
            sidecar_path(&self.final_path),
            serde_json::to_string_pretty(&sidecar)?,
        )
        .await?;

        // The ready signal dies with the writer once the file is final.
        drop(self.ready_tx);

        info!(
            path = %self.final_path.display(),
            last_included = self.meta.last_included_index,
            size = self.data_size,
            "snapshot written"
        );

        Ok(SnapshotFile {
            path: self.final_path,
            meta: self.meta,
            data_size: self.data_size,
            sidecar: Some(sidecar),
        })
    }
}

/// An installed snapshot, open for chunked reads
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
    meta: SnapshotMeta,
    data_size: u64,
    sidecar: Option<SnapshotSidecar>,
}

impl SnapshotFile {
    /// Write a snapshot in one piece
    pub async fn create(
        path: &Path,
        meta: SnapshotMeta,
        data: &[u8],
        compressed: bool,
    ) -> Result<Self> {
        let (mut writer, _ready) =
            SnapshotWriter::begin(path, meta, data.len() as u64, compressed).await?;
        writer.write_chunk(data).await?;
        writer.finish().await
    }

    /// Open an existing snapshot, validating header and checksum
    pub async fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();
        if len < SNAPSHOT_HEADER_LEN {
            return Err(SnapshotError::Corrupt(format!(
                "{}: shorter than the header",
                path.display()
            )));
        }

        let last_included_index = file.read_u64().await?;
        let last_included_term = file.read_u32().await?;
        let data_size = file.read_u64().await?;
        if len != SNAPSHOT_HEADER_LEN + data_size {
            return Err(SnapshotError::Corrupt(format!(
                "{}: declared body of {} bytes, file holds {}",
                path.display(),
                data_size,
                len - SNAPSHOT_HEADER_LEN
            )));
        }

        let sidecar = match tokio::fs::read_to_string(sidecar_path(path)).await {
            Ok(json) => Some(serde_json::from_str::<SnapshotSidecar>(&json)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let snapshot = Self {
            path: path.to_path_buf(),
            meta: SnapshotMeta {
                last_included_index,
                last_included_term,
            },
            data_size,
            sidecar,
        };

        if let Some(sidecar) = &snapshot.sidecar {
            let mut hasher = Sha256::new();
            let mut body = file;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let actual = format!("{:x}", hasher.finalize());
            if actual != sidecar.checksum {
                return Err(SnapshotError::ChecksumMismatch {
                    expected: sidecar.checksum.clone(),
                    actual,
                });
            }
        }

        Ok(snapshot)
    }

    /// Identity the snapshot covers
    pub fn meta(&self) -> SnapshotMeta {
        self.meta
    }

    /// Body size in bytes as stored
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// True when the body is a gzip stream
    pub fn is_compressed(&self) -> bool {
        self.sidecar.as_ref().map(|s| s.compressed).unwrap_or(false)
    }

    /// True when a compressed body should be streamed as-is
    pub fn serves_compressed(&self) -> bool {
        self.sidecar
            .as_ref()
            .map(|s| s.serve_compressed)
            .unwrap_or(true)
    }

    /// The snapshot path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `len` body bytes starting at `offset`
    pub async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset > self.data_size {
            return Err(SnapshotError::Corrupt(format!(
                "chunk offset {} beyond body of {} bytes",
                offset, self.data_size
            )));
        }
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(SNAPSHOT_HEADER_LEN + offset)).await?;
        let want = len.min((self.data_size - offset) as usize);
        let mut chunk = vec![0u8; want];
        file.read_exact(&mut chunk).await?;
        Ok(chunk)
    }

    /// Read the whole body
    pub async fn read_body(&self) -> Result<Vec<u8>> {
        self.read_chunk(0, self.data_size as usize).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("replog-snap-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn meta(index: u64, term: u32) -> SnapshotMeta {
        SnapshotMeta {
            last_included_index: index,
            last_included_term: term,
        }
    }

    #[tokio::test]
    async fn test_create_open_roundtrip() {
        let dir = test_dir("roundtrip");
        let path = dir.join("snap");
        let body = b"the compacted state".to_vec();

        let written = SnapshotFile::create(&path, meta(500, 3), &body, false)
            .await
            .unwrap();
        assert_eq!(written.data_size(), body.len() as u64);

        let opened = SnapshotFile::open(&path).await.unwrap();
        assert_eq!(opened.meta(), meta(500, 3));
        assert!(!opened.is_compressed());
        assert_eq!(opened.read_body().await.unwrap(), body);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_chunked_reads() {
        let dir = test_dir("chunks");
        let path = dir.join("snap");
        let body: Vec<u8> = (0..=255u8).collect();
        SnapshotFile::create(&path, meta(10, 1), &body, false)
            .await
            .unwrap();

        let snapshot = SnapshotFile::open(&path).await.unwrap();
        assert_eq!(snapshot.read_chunk(0, 16).await.unwrap(), &body[..16]);
        assert_eq!(snapshot.read_chunk(100, 56).await.unwrap(), &body[100..156]);
        // A read past the end is clamped.
        assert_eq!(snapshot.read_chunk(250, 100).await.unwrap(), &body[250..]);
        assert!(snapshot.read_chunk(300, 1).await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_checksum_detects_tamper() {
        let dir = test_dir("tamper");
        let path = dir.join("snap");
        SnapshotFile::create(&path, meta(5, 1), b"body bytes", false)
            .await
            .unwrap();

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(SNAPSHOT_HEADER_LEN + 2)).unwrap();
            file.write_all(b"X").unwrap();
        }

        let err = SnapshotFile::open(&path).await.unwrap_err();
        assert!(matches!(err, SnapshotError::ChecksumMismatch { .. }));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_truncated_body_rejected() {
        let dir = test_dir("short");
        let path = dir.join("snap");
        SnapshotFile::create(&path, meta(5, 1), b"full body", false)
            .await
            .unwrap();

        let full = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();

        let err = SnapshotFile::open(&path).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_writer_enforces_declared_size() {
        let dir = test_dir("size");
        let path = dir.join("snap");

        let (mut writer, ready) = SnapshotWriter::begin(&path, meta(1, 1), 4, false)
            .await
            .unwrap();
        assert!(*ready.borrow());
        writer.write_chunk(b"ab").await.unwrap();
        assert!(writer.write_chunk(b"cde").await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_unfinished_writer_leaves_no_final_file() {
        let dir = test_dir("unfinished");
        let path = dir.join("snap");
        {
            let (mut writer, _ready) = SnapshotWriter::begin(&path, meta(1, 1), 8, false)
                .await
                .unwrap();
            writer.write_chunk(b"1234").await.unwrap();
            // Dropped before finish: simulated crash.
        }
        assert!(!path.exists());

        let removed = sweep_stale_temps(&dir).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        let _ = std::fs::remove_dir_all(dir);
    }
}
