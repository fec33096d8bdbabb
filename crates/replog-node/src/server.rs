//! The framed RPC server
//!
//! One task per connection; every request is answered with a message
//! echoing its correlation id. The `e` request holds its connection for
//! the duration of the stream, answering with entry chunks (or snapshot
//! chunks when the requested index predates the log) and a final Done
//! marker.

use crate::transport::{encode_raft_reply, RaftEnvelope};
use crate::Result;
use replog_core::{
    encode_entry_chunk, read_message, write_message, EntriesRequest, EntryKind, LogEntry, Request,
    Response, ResponseStatus,
};
use replog_raft::{RaftHandle, UpdateError};
use replog_snapshot::SnapshotFile;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default byte budget per entries chunk
const DEFAULT_BYTE_BUDGET: u64 = 256 * 1024;

/// Bytes per snapshot chunk on the `e` stream
const SNAPSHOT_CHUNK_BYTES: usize = 64 * 1024;

/// Everything a connection handler needs
pub struct ServerContext {
    pub raft: RaftHandle,
    pub secret: Vec<u8>,
    pub publisher_url: String,
    pub snapshot_path: PathBuf,
}

/// The RPC listener
pub struct RpcServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    /// Serve the framed bus on the given listener
    pub fn spawn(listener: TcpListener, context: ServerContext) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let context = Arc::new(context);

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "rpc accept failed");
                        continue;
                    }
                };
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, context).await {
                        debug!(peer = %peer_addr, error = %err, "rpc connection ended");
                    }
                });
            }
        });

        info!(addr = %local_addr, "rpc server started");
        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(mut stream: TcpStream, context: Arc<ServerContext>) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let frames = match read_message(&mut stream).await {
            Ok(frames) => frames,
            Err(_) => return Ok(()),
        };
        let (correlation, request) = match Request::decode(&frames) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(error = %err, "malformed request");
                return Ok(());
            }
        };

        match request {
            Request::Entries(request) => {
                serve_entries(&mut stream, correlation, request, &context).await?;
            }
            other => {
                let response = answer(other, &context).await;
                write_message(&mut stream, &response.encode(correlation)?).await?;
            }
        }
    }
}

async fn answer(request: Request, context: &ServerContext) -> Response {
    match request {
        Request::Config => Response::Config {
            config: context.raft.cluster_config(),
            leader_id: context.raft.leader_id(),
        },
        Request::LogInfo { any_peer } => {
            if !any_peer && !context.raft.is_leader() {
                return Response::NotLeader {
                    leader: context.raft.leader_hint(),
                };
            }
            let mut info = context.raft.log_info().await;
            info.snapshot_size = tokio::fs::metadata(&context.snapshot_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            Response::LogInfo(info)
        }
        Request::Update {
            request_id,
            payload,
        } => match context
            .raft
            .client_update(request_id, EntryKind::State, payload)
            .await
        {
            Ok(commit_index) => Response::UpdateOk { commit_index },
            Err(UpdateError::NotLeader(leader)) => Response::NotLeader { leader },
            Err(UpdateError::Expired) => Response::Expired,
            Err(UpdateError::Invalid(message)) => Response::Invalid { message },
            Err(UpdateError::Shutdown) => Response::Invalid {
                message: "node shutting down".into(),
            },
        },
        Request::PublisherUrl { secret } => {
            if secret == context.secret {
                Response::PublisherUrl {
                    url: Some(context.publisher_url.clone()),
                }
            } else {
                warn!("publisher url request with wrong secret");
                Response::AuthFailure
            }
        }
        Request::Raft { data } => match RaftEnvelope::from_bytes(&data) {
            Ok(envelope) => {
                let reply = context.raft.deliver(envelope.from, envelope.message).await;
                match encode_raft_reply(&reply) {
                    Ok(data) => Response::Raft { data },
                    Err(err) => Response::Invalid {
                        message: err.to_string(),
                    },
                }
            }
            Err(err) => Response::Invalid {
                message: format!("malformed raft envelope: {}", err),
            },
        },
        Request::Entries(_) => unreachable!("entries handled by serve_entries"),
    }
}

/// Stream committed entries (and the snapshot, when needed) in order
async fn serve_entries(
    stream: &mut TcpStream,
    correlation: u64,
    request: EntriesRequest,
    context: &ServerContext,
) -> Result<()> {
    let byte_budget = if request.byte_budget == 0 {
        DEFAULT_BYTE_BUDGET
    } else {
        request.byte_budget
    };
    let mut remaining = if request.count_limit == 0 {
        u64::MAX
    } else {
        request.count_limit
    };
    let mut next = request.from_index.max(1);
    let log = context.raft.log();

    // A request predating the log switches to a snapshot transfer.
    let first_index = { log.read().await.first_index() };
    if next < first_index {
        match SnapshotFile::open(&context.snapshot_path).await {
            Ok(snapshot) => {
                let meta = snapshot.meta();

                // A compressed body marked not-served-compressed is
                // inflated before chunking.
                let inflated = if snapshot.is_compressed() && !snapshot.serves_compressed() {
                    Some(replog_snapshot::decompress_state(
                        &snapshot.read_body().await?,
                    )?)
                } else {
                    None
                };
                let size = inflated
                    .as_ref()
                    .map(|body| body.len() as u64)
                    .unwrap_or_else(|| snapshot.data_size());

                let mut offset = 0u64;
                debug!(last_included = meta.last_included_index, size, "streaming snapshot");
                loop {
                    let chunk = match &inflated {
                        Some(body) => {
                            let start = offset as usize;
                            let end = (start + SNAPSHOT_CHUNK_BYTES).min(body.len());
                            body[start..end].to_vec()
                        }
                        None => snapshot.read_chunk(offset, SNAPSHOT_CHUNK_BYTES).await?,
                    };
                    let chunk_len = chunk.len() as u64;
                    let response = Response::Entries {
                        status: ResponseStatus::Snapshot,
                        last_index: meta.last_included_index,
                        byte_offset: offset,
                        byte_size: size,
                        chunk,
                    };
                    write_message(stream, &response.encode(correlation)?).await?;
                    offset += chunk_len;
                    if offset >= size {
                        break;
                    }
                }
                next = meta.last_included_index + 1;
            }
            Err(err) => {
                // No snapshot on disk: entries simply start at the log.
                debug!(error = %err, "no snapshot to stream");
                next = first_index;
            }
        }
    }

    loop {
        let commit = context.raft.commit_index();
        if next > commit || remaining == 0 {
            break;
        }

        let mut batch: Vec<LogEntry> = Vec::new();
        let last = {
            let log = log.read().await;
            log.read_range(next, commit, byte_budget, |entry| {
                batch.push(entry.clone());
                (batch.len() as u64) < remaining
            })
            .await?
        };
        if batch.is_empty() {
            break;
        }

        let response = Response::Entries {
            status: ResponseStatus::Entries,
            last_index: last,
            byte_offset: 0,
            byte_size: 0,
            chunk: encode_entry_chunk(&batch),
        };
        write_message(stream, &response.encode(correlation)?).await?;
        remaining = remaining.saturating_sub(batch.len() as u64);
        next = last + 1;
    }

    let done = Response::Entries {
        status: ResponseStatus::Done,
        last_index: next.saturating_sub(1),
        byte_offset: 0,
        byte_size: 0,
        chunk: Vec::new(),
    };
    write_message(stream, &done.encode(correlation)?).await?;
    Ok(())
}
