//! The replog cluster node binary

use clap::Parser;
use replog_core::{ClusterConfig, Peer};
use replog_node::{Node, NodeConfig};
use replog_storage::LogOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "replog-node", about = "Raft-replicated log node with broadcast fan-out")]
struct Args {
    /// This node's id
    #[arg(long)]
    id: String,

    /// Data root directory
    #[arg(long)]
    data_dir: PathBuf,

    /// RPC bind address
    #[arg(long, default_value = "127.0.0.1:8047")]
    bind: SocketAddr,

    /// Broadcast bind address
    #[arg(long, default_value = "127.0.0.1:8048")]
    publisher_bind: SocketAddr,

    /// Cluster secret for the broadcast channel
    #[arg(long, env = "REPLOG_SECRET")]
    secret: String,

    /// Cluster members as id=tcp://ip:port, repeatable; omit for a
    /// single-peer cluster
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Entries per log segment before rollover
    #[arg(long, default_value_t = 16384)]
    max_entries_per_segment: usize,

    /// Bytes per log segment before rollover
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    max_bytes_per_segment: u64,

    /// Broadcast heartbeat interval in milliseconds
    #[arg(long, default_value_t = 500)]
    heartbeat_interval_ms: u64,

    /// Accept updates whose request id left the freshness window
    #[arg(long)]
    allow_expired_request_ids: bool,
}

fn parse_peers(specs: &[String]) -> Result<ClusterConfig, String> {
    let mut peers = Vec::with_capacity(specs.len());
    for spec in specs {
        let (id, url) = spec
            .split_once('=')
            .ok_or_else(|| format!("peer spec '{}' is not id=url", spec))?;
        peers.push(Peer::new(id, url).map_err(|e| e.to_string())?);
    }
    ClusterConfig::new(peers).map_err(|e| e.to_string())
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
    let peers = match parse_peers(&args.peers) {
        Ok(peers) => peers,
        Err(err) => {
            error!(error = %err, "invalid peer configuration");
            std::process::exit(1);
        }
    };

    let mut config = NodeConfig::new(&args.id, &args.data_dir, args.secret.as_bytes());
    config.rpc_addr = args.bind;
    config.publisher_addr = args.publisher_bind;
    config.peers = peers;
    config.log_options = LogOptions {
        max_entries_per_segment: args.max_entries_per_segment,
        max_bytes_per_segment: args.max_bytes_per_segment,
    };
    config.heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
    config.reject_expired_request_ids = !args.allow_expired_request_ids;

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(err) => {
            error!(error = %err, "node failed to start");
            std::process::exit(1);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "signal wait failed");
    }
    node.shutdown();
}
