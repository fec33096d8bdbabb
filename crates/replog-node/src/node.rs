//! Node wiring
//!
//! Brings a node up in dependency order: configuration, snapshot sweep,
//! durable log, consensus engine, then the RPC server and the broadcast
//! publisher. Teardown runs in reverse; the log lock is released when
//! the node is dropped.

use crate::broadcast::Publisher;
use crate::server::{RpcServer, ServerContext};
use crate::transport::TcpRaftTransport;
use crate::{NodeError, Result};
use replog_core::{ClusterConfig, Peer, PeerId};
use replog_raft::{RaftConfig, RaftHandle, RaftNode};
use replog_snapshot::{sweep_stale_temps, SnapshotFile};
use replog_storage::{FileLog, LogOptions, SnapshotMeta};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id
    pub id: PeerId,

    /// Data root: holds `log/`, `snap`, and `raft-state`
    pub data_dir: PathBuf,

    /// RPC bind address; port 0 picks a free port
    pub rpc_addr: SocketAddr,

    /// Broadcast bind address; port 0 picks a free port
    pub publisher_addr: SocketAddr,

    /// Cluster secret for the broadcast channel
    pub secret: Vec<u8>,

    /// Cluster members; empty means a single-peer cluster of this node
    pub peers: ClusterConfig,

    /// Segment rollover options
    pub log_options: LogOptions,

    /// Broadcast heartbeat interval
    pub heartbeat_interval: Duration,

    /// Election timeout range (milliseconds)
    pub election_timeout_ms: (u64, u64),

    /// Request-id freshness window
    pub request_id_ttl: Duration,

    /// Reject updates whose request id left the freshness window
    pub reject_expired_request_ids: bool,
}

impl NodeConfig {
    /// Defaults rooted at `data_dir`, binding loopback ports chosen by
    /// the OS
    pub fn new(id: impl Into<PeerId>, data_dir: impl Into<PathBuf>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            data_dir: data_dir.into(),
            rpc_addr: "127.0.0.1:0".parse().expect("literal address"),
            publisher_addr: "127.0.0.1:0".parse().expect("literal address"),
            secret: secret.into(),
            peers: ClusterConfig::default(),
            log_options: LogOptions::default(),
            heartbeat_interval: Duration::from_millis(500),
            election_timeout_ms: (1500, 3000),
            request_id_ttl: Duration::from_secs(8 * 3600),
            reject_expired_request_ids: true,
        }
    }
}

/// A running node
pub struct Node {
    config: NodeConfig,
    raft: RaftHandle,
    rpc: RpcServer,
    publisher: Publisher,
    self_peer: Peer,
}

impl Node {
    /// Start a node: config, snapshot sweep, log, raft, listeners
    pub async fn start(mut config: NodeConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        sweep_stale_temps(&config.data_dir).await?;

        let snapshot_path = config.data_dir.join("snap");
        let base = match SnapshotFile::open(&snapshot_path).await {
            Ok(snapshot) => snapshot.meta(),
            Err(replog_snapshot::SnapshotError::Io(err))
                if err.kind() == std::io::ErrorKind::NotFound =>
            {
                SnapshotMeta::default()
            }
            Err(err) => return Err(err.into()),
        };

        let log = FileLog::open(
            config.data_dir.join("log"),
            base,
            config.log_options.clone(),
        )
        .await?;

        // Listeners bind first so a port-0 config learns its real
        // address before the peer set is fixed.
        let rpc_listener = TcpListener::bind(config.rpc_addr).await?;
        let rpc_addr = rpc_listener.local_addr()?;
        let publisher_listener = TcpListener::bind(config.publisher_addr).await?;

        let self_peer = Peer::new(config.id.clone(), &format!("tcp://{}", rpc_addr))
            .map_err(|e| NodeError::Config(e.to_string()))?;
        if config.peers.is_empty() {
            config.peers = ClusterConfig::new(vec![self_peer.clone()])
                .map_err(|e| NodeError::Config(e.to_string()))?;
        } else if config.peers.peer(&config.id).is_none() {
            return Err(NodeError::Config(format!(
                "peer set does not contain this node ({})",
                config.id
            )));
        }

        let mut raft_config = RaftConfig::new(
            config.id.clone(),
            config.peers.clone(),
            &config.data_dir,
        );
        raft_config.election_timeout_min_ms = config.election_timeout_ms.0;
        raft_config.election_timeout_max_ms = config.election_timeout_ms.1;
        // Peer heartbeats must outpace the election timeout.
        raft_config.heartbeat_interval_ms = (config.election_timeout_ms.0 / 3).max(10);
        raft_config.request_id_ttl = config.request_id_ttl;
        raft_config.reject_expired_request_ids = config.reject_expired_request_ids;

        let transport = Arc::new(TcpRaftTransport::new(
            config.id.clone(),
            Duration::from_millis(500),
        ));
        let raft = RaftNode::spawn(raft_config, log, transport).await?;

        let publisher = Publisher::spawn(
            publisher_listener,
            config.secret.clone(),
            config.heartbeat_interval,
            raft.clone(),
        )?;

        let rpc = RpcServer::spawn(
            rpc_listener,
            ServerContext {
                raft: raft.clone(),
                secret: config.secret.clone(),
                publisher_url: publisher.url().to_string(),
                snapshot_path,
            },
        )?;

        info!(id = %config.id, rpc = %rpc.local_addr(), publisher = %publisher.url(), "node started");
        Ok(Self {
            config,
            raft,
            rpc,
            publisher,
            self_peer,
        })
    }

    /// Handle to the consensus engine
    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    /// RPC bind address
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    /// This node as a client-facing peer
    pub fn self_peer(&self) -> Peer {
        self.self_peer.clone()
    }

    /// Advertised broadcast URL
    pub fn publisher_url(&self) -> &str {
        self.publisher.url()
    }

    /// Connected broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }

    /// The node's data directory
    pub fn data_dir(&self) -> &std::path::Path {
        &self.config.data_dir
    }

    /// Stop the node: listeners first, then the consensus engine
    pub fn shutdown(&self) {
        self.publisher.shutdown();
        self.rpc.shutdown();
        self.raft.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
