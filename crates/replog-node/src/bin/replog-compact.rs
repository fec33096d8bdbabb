//! Offline log compaction tool
//!
//! Replays the log prefix into a state machine, writes the snapshot,
//! and installs it. Exit codes: 1 fatal, 2 missing target, 3 missing
//! state machine, 4 missing index and peer, 5 index not in the log,
//! 6 state machine lacks serialization, 7 invalid compression level,
//! 8 missing data root.

use async_trait::async_trait;
use clap::Parser;
use replog_client::{CancelToken, ClientOptions, ClusterClient};
use replog_core::{LogEntry, LogIndex};
use replog_snapshot::{compact, sweep_stale_temps, CompactionOptions, SnapshotError, SnapshotFile};
use replog_storage::{FileLog, LogOptions, SnapshotMeta, StateMachine};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::error;

const EXIT_FATAL: i32 = 1;
const EXIT_MISSING_TARGET: i32 = 2;
const EXIT_MISSING_STATE_MACHINE: i32 = 3;
const EXIT_MISSING_INDEX: i32 = 4;
const EXIT_INDEX_NOT_IN_LOG: i32 = 5;
const EXIT_NO_SERIALIZATION: i32 = 6;
const EXIT_INVALID_COMPRESSION: i32 = 7;
const EXIT_MISSING_DATA_ROOT: i32 = 8;

#[derive(Parser, Debug)]
#[command(name = "replog-compact", about = "Compact a replog data directory into a snapshot")]
struct Args {
    /// Target snapshot path
    #[arg(long)]
    target: Option<PathBuf>,

    /// Built-in state machine to replay: "digest" or "null"
    #[arg(long)]
    state_machine: Option<String>,

    /// Compaction index; omitted, it derives from --peer as
    /// min(commit_index, prune_index)
    #[arg(long)]
    index: Option<LogIndex>,

    /// Peer URL to derive the compaction index from
    #[arg(long)]
    peer: Option<String>,

    /// Data root holding log/ and snap
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log directory override
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Existing snapshot path override
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Gzip level 0..=9; omit for an uncompressed snapshot
    #[arg(long)]
    compression: Option<u32>,

    /// Serve the snapshot body in its compressed form
    #[arg(long)]
    serve_compressed: bool,
}

/// Replays entries into a digest over payload bytes; serializable
struct DigestMachine {
    last_applied: LogIndex,
    entries: u64,
    bytes: u64,
    hasher: Sha256,
}

#[derive(Serialize)]
struct DigestState {
    last_applied: LogIndex,
    entries: u64,
    bytes: u64,
    digest: String,
}

#[async_trait]
impl StateMachine for DigestMachine {
    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    async fn apply(&mut self, entry: &LogEntry) -> replog_storage::Result<()> {
        self.hasher.update(&entry.payload);
        self.entries += 1;
        self.bytes += entry.payload.len() as u64;
        self.last_applied = entry.index;
        Ok(())
    }

    fn snapshot_bytes(&self) -> Option<Vec<u8>> {
        let state = DigestState {
            last_applied: self.last_applied,
            entries: self.entries,
            bytes: self.bytes,
            digest: format!("{:x}", self.hasher.clone().finalize()),
        };
        serde_json::to_vec(&state).ok()
    }
}

/// Replays entries without retaining anything; not serializable
struct NullMachine {
    last_applied: LogIndex,
}

#[async_trait]
impl StateMachine for NullMachine {
    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    async fn apply(&mut self, entry: &LogEntry) -> replog_storage::Result<()> {
        self.last_applied = entry.index;
        Ok(())
    }
}

fn exit_with(code: i32, message: &str) -> ! {
    error!("{}", message);
    std::process::exit(code);
}

async fn derive_index(peer_url: &str) -> Result<LogIndex, String> {
    let client = ClusterClient::from_urls(&[peer_url], ClientOptions::default())
        .map_err(|e| e.to_string())?;
    let cancel = CancelToken::new();
    let info = client
        .request_log_info(true, &cancel)
        .await
        .map_err(|e| e.to_string())?;
    let index = if info.prune_index > 0 {
        info.commit_index.min(info.prune_index)
    } else {
        info.commit_index
    };
    Ok(index)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let Some(target) = args.target else {
        exit_with(EXIT_MISSING_TARGET, "missing --target snapshot path");
    };
    let state_machine = match args.state_machine.as_deref() {
        Some("digest") => Box::new(DigestMachine {
            last_applied: 0,
            entries: 0,
            bytes: 0,
            hasher: Sha256::new(),
        }) as Box<dyn StateMachine>,
        Some("null") => Box::new(NullMachine { last_applied: 0 }) as Box<dyn StateMachine>,
        Some(other) => exit_with(
            EXIT_MISSING_STATE_MACHINE,
            &format!("unknown state machine '{}'", other),
        ),
        None => exit_with(EXIT_MISSING_STATE_MACHINE, "missing --state-machine"),
    };
    if let Some(level) = args.compression {
        if level > 9 {
            exit_with(
                EXIT_INVALID_COMPRESSION,
                &format!("compression level {} outside 0..=9", level),
            );
        }
    }
    let Some(data_dir) = args.data_dir else {
        exit_with(EXIT_MISSING_DATA_ROOT, "missing --data-dir");
    };

    let index = match (args.index, args.peer.as_deref()) {
        (Some(index), _) => index,
        (None, Some(peer)) => match derive_index(peer).await {
            Ok(index) => index,
            Err(err) => exit_with(EXIT_FATAL, &format!("peer query failed: {}", err)),
        },
        (None, None) => exit_with(EXIT_MISSING_INDEX, "missing --index and --peer"),
    };

    if let Err(err) = sweep_stale_temps(&data_dir).await {
        exit_with(EXIT_FATAL, &format!("temp sweep failed: {}", err));
    }

    let snapshot_path = args.snapshot.unwrap_or_else(|| data_dir.join("snap"));
    let base = match SnapshotFile::open(&snapshot_path).await {
        Ok(snapshot) => snapshot.meta(),
        Err(SnapshotError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            SnapshotMeta::default()
        }
        Err(err) => exit_with(EXIT_FATAL, &format!("cannot open snapshot: {}", err)),
    };

    let log_dir = args.log_dir.unwrap_or_else(|| data_dir.join("log"));
    let mut log = match FileLog::open(&log_dir, base, LogOptions::default()).await {
        Ok(log) => log,
        Err(err) => exit_with(EXIT_FATAL, &format!("cannot open log: {}", err)),
    };

    let mut state_machine = state_machine;
    let options = CompactionOptions {
        compression: args.compression,
        serve_compressed: args.serve_compressed,
    };
    match compact(&mut log, state_machine.as_mut(), &target, index, options).await {
        Ok(snapshot) => {
            println!(
                "snapshot {} written: last_included_index={} size={}",
                snapshot.path().display(),
                snapshot.meta().last_included_index,
                snapshot.data_size()
            );
        }
        Err(SnapshotError::MissingIndex(index)) => exit_with(
            EXIT_INDEX_NOT_IN_LOG,
            &format!("index {} is not present in the log", index),
        ),
        Err(SnapshotError::NoSerialization) => exit_with(
            EXIT_NO_SERIALIZATION,
            "state machine lacks a serialization capability",
        ),
        Err(SnapshotError::InvalidCompressionLevel(level)) => exit_with(
            EXIT_INVALID_COMPRESSION,
            &format!("compression level {} outside 0..=9", level),
        ),
        Err(err) => exit_with(EXIT_FATAL, &format!("compaction failed: {}", err)),
    }
}
