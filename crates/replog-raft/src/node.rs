//! The Raft node
//!
//! All mutable consensus state is confined to one task driving an
//! internal message loop; the rest of the process talks to it through a
//! cloneable handle. The node owns the durable log (shared read-only
//! with the RPC layer), persists term and vote before answering any
//! promise, and advances the commit index at the majority match.

use crate::dedup::{DedupMap, DedupVerdict};
use crate::election::{ElectionTimer, VoteTracker};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftMessage, RequestVoteRequest, RequestVoteResponse,
};
use crate::state::{LeaderState, PersistentState, RaftRole, VolatileState};
use crate::Result;
use async_trait::async_trait;
use replog_core::{
    ClusterConfig, EntryKind, LogEntry, LogIndex, LogInfo, Peer, PeerId, RequestId, Term,
};
use replog_snapshot::SnapshotFile;
use replog_storage::{FileLog, SnapshotMeta};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Entries per AppendEntries message
const REPLICATION_BATCH: u64 = 64;

/// Bytes per InstallSnapshot chunk
const SNAPSHOT_CHUNK_BYTES: usize = 256 * 1024;

/// Configuration for a Raft node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's id
    pub id: PeerId,

    /// All cluster members, self included
    pub peers: ClusterConfig,

    /// Where `{current_term, voted_for, peers}` is persisted
    pub state_path: PathBuf,

    /// Where a received snapshot is written before install
    pub snapshot_path: PathBuf,

    /// Minimum election timeout (milliseconds)
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout (milliseconds)
    pub election_timeout_max_ms: u64,

    /// Peer heartbeat interval (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Request-id freshness window
    pub request_id_ttl: Duration,

    /// Reject an update whose request id is older than the freshness
    /// window even when its original append has been forgotten; the
    /// false setting re-appends instead
    pub reject_expired_request_ids: bool,
}

impl RaftConfig {
    /// Defaults for the given identity and peer set
    pub fn new(id: impl Into<PeerId>, peers: ClusterConfig, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            id: id.into(),
            peers,
            state_path: data_dir.join("raft-state"),
            snapshot_path: data_dir.join("snap"),
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            heartbeat_interval_ms: 500,
            request_id_ttl: Duration::from_secs(8 * 3600),
            reject_expired_request_ids: true,
        }
    }
}

/// How an update request can fail at the node
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("not the leader")]
    NotLeader(Option<Peer>),

    #[error("request id outside the freshness window")]
    Expired,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("node shutting down")]
    Shutdown,
}

/// Network seam between peers; implementations live with the server
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    /// Deliver a message to a peer and return its synchronous reply
    async fn send(&self, to: &Peer, message: RaftMessage) -> Result<Option<RaftMessage>>;
}

enum Command {
    ClientUpdate {
        request_id: RequestId,
        kind: EntryKind,
        payload: Vec<u8>,
        reply: oneshot::Sender<std::result::Result<LogIndex, UpdateError>>,
    },
    Inbound {
        from: PeerId,
        message: RaftMessage,
        reply: oneshot::Sender<Option<RaftMessage>>,
    },
    Response {
        from: PeerId,
        message: RaftMessage,
    },
    SnapshotReplicated {
        from: PeerId,
        last_included: LogIndex,
    },
    Shutdown,
}

/// Snapshot of node status readable without touching the loop
#[derive(Debug, Clone, Default)]
struct Status {
    role: Option<RaftRole>,
    leader_id: Option<PeerId>,
    current_term: Term,
    commit_index: LogIndex,
    last_applied: LogIndex,
    prune_index: LogIndex,
    peers: ClusterConfig,
}

struct Shared {
    id: PeerId,
    log: Arc<RwLock<FileLog>>,
    status: parking_lot::RwLock<Status>,
    commit_rx: watch::Receiver<(Term, LogIndex)>,
}

/// Cloneable handle to a running Raft node
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl RaftHandle {
    /// Submit an update; resolves with the commit index once a majority
    /// has persisted the entry
    pub async fn client_update(
        &self,
        request_id: RequestId,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> std::result::Result<LogIndex, UpdateError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ClientUpdate {
                request_id,
                kind,
                payload,
                reply,
            })
            .map_err(|_| UpdateError::Shutdown)?;
        rx.await.map_err(|_| UpdateError::Shutdown)?
    }

    /// Deliver an inbound peer message; returns the synchronous reply
    pub async fn deliver(&self, from: PeerId, message: RaftMessage) -> Option<RaftMessage> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Inbound {
                from,
                message,
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Shared handle to the durable log for read paths
    pub fn log(&self) -> Arc<RwLock<FileLog>> {
        Arc::clone(&self.shared.log)
    }

    /// Watch `(term, commit_index)` advances
    pub fn commit_watch(&self) -> watch::Receiver<(Term, LogIndex)> {
        self.shared.commit_rx.clone()
    }

    /// This node's id
    pub fn id(&self) -> &PeerId {
        &self.shared.id
    }

    /// True when this node currently leads
    pub fn is_leader(&self) -> bool {
        self.shared
            .status
            .read()
            .role
            .map(|r| r.is_leader())
            .unwrap_or(false)
    }

    /// Id of the leader this node believes in
    pub fn leader_id(&self) -> Option<PeerId> {
        self.shared.status.read().leader_id.clone()
    }

    /// The leader this node believes in, as a redirect hint
    pub fn leader_hint(&self) -> Option<Peer> {
        let status = self.shared.status.read();
        let leader_id = status.leader_id.clone()?;
        status.peers.peer(&leader_id).cloned()
    }

    /// Cluster configuration as currently applied
    pub fn cluster_config(&self) -> ClusterConfig {
        self.shared.status.read().peers.clone()
    }

    /// Current commit index
    pub fn commit_index(&self) -> LogIndex {
        self.shared.status.read().commit_index
    }

    /// Log state summary for the `i` request; `snapshot_size` is left
    /// for the serving layer to fill in
    pub async fn log_info(&self) -> LogInfo {
        let (first_index, last_index) = {
            let log = self.shared.log.read().await;
            (log.first_index(), log.last_index())
        };
        let status = self.shared.status.read();
        LogInfo {
            is_leader: status.role.map(|r| r.is_leader()).unwrap_or(false),
            leader_id: status.leader_id.clone(),
            current_term: status.current_term,
            first_index,
            last_applied: status.last_applied,
            commit_index: status.commit_index,
            last_index,
            prune_index: status.prune_index,
            snapshot_size: 0,
        }
    }

    /// Stop the node loop
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// The consensus engine task
pub struct RaftNode {
    config: RaftConfig,
    persistent: PersistentState,
    volatile: VolatileState,
    role: RaftRole,
    leader_state: Option<LeaderState>,
    votes: Option<VoteTracker>,
    leader_id: Option<PeerId>,
    election_timer: ElectionTimer,
    last_heartbeat: Instant,
    last_dedup_prune: Instant,
    dedup: DedupMap,
    pending_acks: BTreeMap<LogIndex, Vec<oneshot::Sender<std::result::Result<LogIndex, UpdateError>>>>,
    in_flight: HashSet<PeerId>,
    snapshot_buf: Option<(SnapshotMeta, Vec<u8>)>,
    log: Arc<RwLock<FileLog>>,
    transport: Arc<dyn RaftTransport>,
    shared: Arc<Shared>,
    commit_tx: watch::Sender<(Term, LogIndex)>,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl RaftNode {
    /// Load persisted state, spawn the node loop, and return its handle
    pub async fn spawn(
        config: RaftConfig,
        log: FileLog,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<RaftHandle> {
        let persistent = PersistentState::load_or(
            &config.state_path,
            PersistentState::new(config.peers.clone()),
        )
        .await?;

        let base = log.snapshot_meta();
        let volatile = VolatileState {
            commit_index: base.last_included_index,
            last_applied: base.last_included_index,
        };

        let log = Arc::new(RwLock::new(log));
        let (commit_tx, commit_rx) =
            watch::channel((persistent.current_term, volatile.commit_index));
        let (tx, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id: config.id.clone(),
            log: Arc::clone(&log),
            status: parking_lot::RwLock::new(Status {
                role: Some(RaftRole::Follower),
                leader_id: None,
                current_term: persistent.current_term,
                commit_index: volatile.commit_index,
                last_applied: volatile.last_applied,
                prune_index: volatile.last_applied,
                peers: persistent.peers.clone(),
            }),
            commit_rx,
        });

        let node = Self {
            election_timer: ElectionTimer::new(
                config.election_timeout_min_ms,
                config.election_timeout_max_ms,
            ),
            last_heartbeat: Instant::now(),
            last_dedup_prune: Instant::now(),
            dedup: DedupMap::new(config.request_id_ttl),
            pending_acks: BTreeMap::new(),
            in_flight: HashSet::new(),
            snapshot_buf: None,
            role: RaftRole::Follower,
            leader_state: None,
            votes: None,
            leader_id: None,
            volatile,
            persistent,
            log,
            transport,
            shared: Arc::clone(&shared),
            commit_tx,
            tx: tx.clone(),
            rx,
            config,
        };

        let handle = RaftHandle { tx, shared };
        tokio::spawn(node.run());
        Ok(handle)
    }

    async fn run(mut self) {
        info!(id = %self.config.id, term = self.persistent.current_term, "raft node starting");
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => {
                        if let Err(err) = self.handle_command(command).await {
                            error!(id = %self.config.id, error = %err, "raft command failed");
                        }
                    }
                },
                _ = tick.tick() => {
                    if let Err(err) = self.handle_tick().await {
                        error!(id = %self.config.id, error = %err, "raft tick failed");
                    }
                }
            }
        }

        for (_, acks) in std::mem::take(&mut self.pending_acks) {
            for ack in acks {
                let _ = ack.send(Err(UpdateError::Shutdown));
            }
        }
        info!(id = %self.config.id, "raft node stopped");
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::ClientUpdate {
                request_id,
                kind,
                payload,
                reply,
            } => self.handle_client_update(request_id, kind, payload, reply).await,
            Command::Inbound {
                from,
                message,
                reply,
            } => {
                let response = self.handle_message(&from, message).await?;
                let _ = reply.send(response);
                Ok(())
            }
            Command::Response { from, message } => {
                self.handle_message(&from, message).await.map(|_| ())
            }
            Command::SnapshotReplicated {
                from,
                last_included,
            } => {
                self.in_flight.remove(&from);
                if let Some(leader_state) = self.leader_state.as_mut() {
                    leader_state.update_replication(&from, last_included);
                }
                self.publish_status();
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn handle_tick(&mut self) -> Result<()> {
        if self.last_dedup_prune.elapsed() >= Duration::from_secs(60) {
            self.last_dedup_prune = Instant::now();
            let dropped = self.dedup.prune();
            if dropped > 0 {
                debug!(id = %self.config.id, dropped, "pruned expired request ids");
            }
        }
        match self.role {
            RaftRole::Leader => {
                if self.last_heartbeat.elapsed()
                    >= Duration::from_millis(self.config.heartbeat_interval_ms)
                {
                    self.replicate_all().await?;
                    self.last_heartbeat = Instant::now();
                }
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if self.election_timer.is_elapsed() {
                    self.start_election().await?;
                }
            }
        }
        Ok(())
    }

    fn followers(&self) -> Vec<Peer> {
        self.persistent
            .peers
            .peers
            .iter()
            .filter(|p| p.id != self.config.id)
            .cloned()
            .collect()
    }

    fn publish_status(&self) {
        let prune_index = match (&self.role, &self.leader_state) {
            (RaftRole::Leader, Some(leader_state)) if !leader_state.match_index.is_empty() => {
                self.volatile.commit_index.min(leader_state.min_match())
            }
            _ => self.volatile.last_applied,
        };
        let mut status = self.shared.status.write();
        status.role = Some(self.role);
        status.leader_id = self.leader_id.clone();
        status.current_term = self.persistent.current_term;
        status.commit_index = self.volatile.commit_index;
        status.last_applied = self.volatile.last_applied;
        status.prune_index = prune_index;
        status.peers = self.persistent.peers.clone();
    }

    async fn start_election(&mut self) -> Result<()> {
        self.persistent.increment_term();
        self.persistent.voted_for = Some(self.config.id.clone());
        self.persistent.save(&self.config.state_path).await?;
        self.election_timer.reset();
        self.leader_id = None;

        let cluster = self.persistent.peers.len().max(1);
        self.votes = Some(VoteTracker::new(&self.config.id, cluster));
        self.role = RaftRole::Candidate;

        debug!(id = %self.config.id, term = self.persistent.current_term, "starting election");

        if self
            .votes
            .as_ref()
            .map(|v| v.has_majority())
            .unwrap_or(false)
        {
            self.become_leader().await?;
            self.publish_status();
            return Ok(());
        }

        let (last_log_index, last_log_term) = {
            let log = self.log.read().await;
            (log.last_index(), log.last_term())
        };
        let request = RequestVoteRequest {
            term: self.persistent.current_term,
            candidate_id: self.config.id.clone(),
            last_log_index,
            last_log_term,
        };
        for peer in self.followers() {
            self.send_to_peer(peer, RaftMessage::RequestVoteRequest(request.clone()));
        }
        self.publish_status();
        Ok(())
    }

    async fn become_leader(&mut self) -> Result<()> {
        let last_log_index = self.log.read().await.last_index();
        let follower_ids: Vec<PeerId> = self.followers().iter().map(|p| p.id.clone()).collect();

        self.role = RaftRole::Leader;
        self.leader_id = Some(self.config.id.clone());
        self.leader_state = Some(LeaderState::new(&follower_ids, last_log_index));
        self.votes = None;
        self.last_heartbeat = Instant::now();
        info!(id = %self.config.id, term = self.persistent.current_term, "became leader");

        // Over a non-empty log, a checkpoint entry asserts the new term
        // and gives the commit index something to advance through; a
        // fresh log keeps index 1 for the first client update.
        if last_log_index > 0 {
            let checkpoint = RequestId::generate();
            self.append_as_leader(checkpoint, EntryKind::Checkpoint, Vec::new())
                .await?;
        }
        self.replicate_all().await?;
        Ok(())
    }

    fn step_down(&mut self, term: Term) {
        if self.role.is_leader() || self.role == RaftRole::Candidate {
            debug!(id = %self.config.id, term, "stepping down to follower");
        }
        self.role = RaftRole::Follower;
        self.leader_state = None;
        self.votes = None;
        self.in_flight.clear();
        self.election_timer.reset();

        // Acks for uncommitted entries cannot be kept; the new leader
        // may truncate them away.
        let commit = self.volatile.commit_index;
        let pending = std::mem::take(&mut self.pending_acks);
        for (index, acks) in pending {
            if index > commit {
                for ack in acks {
                    let _ = ack.send(Err(UpdateError::NotLeader(None)));
                }
            }
        }
    }

    async fn append_as_leader(
        &mut self,
        request_id: RequestId,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> Result<LogIndex> {
        let index = {
            let mut log = self.log.write().await;
            let index = log.next_index();
            let entry = LogEntry::with_kind(
                index,
                self.persistent.current_term,
                kind,
                request_id,
                payload,
            );
            log.append(entry).await?;
            log.flush().await?;
            index
        };
        self.dedup.record(request_id, index);

        if self.persistent.peers.majority() <= 1 {
            self.advance_commit(index).await?;
        }
        Ok(index)
    }

    async fn handle_client_update(
        &mut self,
        request_id: RequestId,
        kind: EntryKind,
        payload: Vec<u8>,
        reply: oneshot::Sender<std::result::Result<LogIndex, UpdateError>>,
    ) -> Result<()> {
        if !self.role.is_leader() {
            let hint = self
                .leader_id
                .as_ref()
                .and_then(|id| self.persistent.peers.peer(id).cloned());
            let _ = reply.send(Err(UpdateError::NotLeader(hint)));
            return Ok(());
        }

        match self.dedup.check(&request_id) {
            DedupVerdict::Applied(index) => {
                debug!(id = %self.config.id, %request_id, index, "duplicate request id");
                let _ = reply.send(Ok(index));
                return Ok(());
            }
            DedupVerdict::Expired if self.config.reject_expired_request_ids => {
                let _ = reply.send(Err(UpdateError::Expired));
                return Ok(());
            }
            DedupVerdict::Expired => {
                warn!(id = %self.config.id, %request_id, "appending update with expired request id");
            }
            DedupVerdict::Fresh => {}
        }

        let index = self.append_as_leader(request_id, kind, payload).await?;

        if index <= self.volatile.commit_index {
            let _ = reply.send(Ok(index));
        } else {
            self.pending_acks.entry(index).or_default().push(reply);
            self.replicate_all().await?;
            self.last_heartbeat = Instant::now();
        }
        Ok(())
    }

    /// Apply newly committed entries: dedup bookkeeping, config entries,
    /// pending client acks, and the commit watch
    async fn advance_commit(&mut self, new_commit: LogIndex) -> Result<()> {
        if !self.volatile.update_commit_index(new_commit) {
            return Ok(());
        }

        let from = self.volatile.last_applied + 1;
        for index in from..=new_commit {
            let entry = { self.log.read().await.read(index).await? };
            let Some(entry) = entry else { continue };
            self.dedup.record(entry.request_id, entry.index);
            if entry.kind == EntryKind::Config {
                match ClusterConfig::from_bytes(&entry.payload) {
                    Ok(peers) => {
                        info!(id = %self.config.id, members = peers.len(), "applied config entry");
                        self.persistent.peers = peers;
                        self.persistent.save(&self.config.state_path).await?;
                    }
                    Err(err) => {
                        warn!(id = %self.config.id, error = %err, "ignoring malformed config entry")
                    }
                }
            }
        }
        self.volatile.last_applied = new_commit;

        let resolved: Vec<LogIndex> = self
            .pending_acks
            .range(..=new_commit)
            .map(|(index, _)| *index)
            .collect();
        for index in resolved {
            if let Some(acks) = self.pending_acks.remove(&index) {
                for ack in acks {
                    let _ = ack.send(Ok(index));
                }
            }
        }

        let _ = self
            .commit_tx
            .send((self.persistent.current_term, new_commit));
        self.publish_status();
        Ok(())
    }

    fn send_to_peer(&self, peer: Peer, message: RaftMessage) {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match transport.send(&peer, message).await {
                Ok(Some(response)) => {
                    let _ = tx.send(Command::Response {
                        from: peer.id,
                        message: response,
                    });
                }
                Ok(None) => {}
                Err(err) => debug!(peer = %peer.id, error = %err, "peer send failed"),
            }
        });
    }

    async fn replicate_all(&mut self) -> Result<()> {
        for peer in self.followers() {
            if !self.in_flight.contains(&peer.id) {
                self.replicate_to(peer).await?;
            }
        }
        Ok(())
    }

    async fn replicate_to(&mut self, peer: Peer) -> Result<()> {
        let Some(leader_state) = self.leader_state.as_ref() else {
            return Ok(());
        };
        let next = leader_state
            .next_index
            .get(&peer.id)
            .copied()
            .unwrap_or(1);

        let (first_index, last_index) = {
            let log = self.log.read().await;
            (log.first_index(), log.last_index())
        };

        if next < first_index {
            self.send_snapshot_to(peer).await?;
            return Ok(());
        }

        let prev = next - 1;
        let prev_term = {
            let log = self.log.read().await;
            log.term_at(prev).await?.unwrap_or(0)
        };

        let mut entries = Vec::new();
        if next <= last_index {
            let to = last_index.min(next + REPLICATION_BATCH - 1);
            let log = self.log.read().await;
            log.read_range(next, to, 0, |entry| {
                entries.push(entry.clone());
                true
            })
            .await?;
        }

        let request = AppendEntriesRequest {
            term: self.persistent.current_term,
            leader_id: self.config.id.clone(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit: self.volatile.commit_index,
        };
        self.in_flight.insert(peer.id.clone());
        self.send_to_peer(peer, RaftMessage::AppendEntriesRequest(request));
        Ok(())
    }

    /// Stream the current snapshot to a follower that fell behind the
    /// first log index
    async fn send_snapshot_to(&mut self, peer: Peer) -> Result<()> {
        let snapshot = SnapshotFile::open(&self.config.snapshot_path).await?;
        let meta = snapshot.meta();
        let term = self.persistent.current_term;
        let leader_id = self.config.id.clone();
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();

        self.in_flight.insert(peer.id.clone());
        tokio::spawn(async move {
            let total = snapshot.data_size();
            let mut offset = 0u64;
            loop {
                let chunk = match snapshot.read_chunk(offset, SNAPSHOT_CHUNK_BYTES).await {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!(peer = %peer.id, error = %err, "snapshot read failed");
                        return;
                    }
                };
                let done = offset + chunk.len() as u64 >= total;
                let request = InstallSnapshotRequest {
                    term,
                    leader_id: leader_id.clone(),
                    last_included_index: meta.last_included_index,
                    last_included_term: meta.last_included_term,
                    offset,
                    data: chunk,
                    done,
                };
                offset += request.data.len() as u64;
                match transport
                    .send(&peer, RaftMessage::InstallSnapshotRequest(request))
                    .await
                {
                    Ok(Some(RaftMessage::InstallSnapshotResponse(resp))) if resp.success => {}
                    other => {
                        debug!(peer = %peer.id, "snapshot transfer aborted: {:?}", other.err());
                        return;
                    }
                }
                if done {
                    let _ = tx.send(Command::SnapshotReplicated {
                        from: peer.id.clone(),
                        last_included: meta.last_included_index,
                    });
                    return;
                }
            }
        });
        Ok(())
    }

    async fn handle_message(
        &mut self,
        from: &str,
        message: RaftMessage,
    ) -> Result<Option<RaftMessage>> {
        // Any higher term demotes us before the message is considered.
        if message.term() > self.persistent.current_term {
            self.persistent.update_term(message.term());
            self.persistent.save(&self.config.state_path).await?;
            self.step_down(message.term());
        }

        let response = match message {
            RaftMessage::AppendEntriesRequest(request) => {
                Some(RaftMessage::AppendEntriesResponse(
                    self.handle_append_entries(request).await?,
                ))
            }
            RaftMessage::RequestVoteRequest(request) => Some(RaftMessage::RequestVoteResponse(
                self.handle_request_vote(request).await?,
            )),
            RaftMessage::InstallSnapshotRequest(request) => {
                Some(RaftMessage::InstallSnapshotResponse(
                    self.handle_install_snapshot(request).await?,
                ))
            }
            RaftMessage::AppendEntriesResponse(response) => {
                self.handle_append_entries_response(from, response).await?;
                None
            }
            RaftMessage::RequestVoteResponse(response) => {
                self.handle_request_vote_response(from, response).await?;
                None
            }
            RaftMessage::InstallSnapshotResponse(_) => None,
        };
        self.publish_status();
        Ok(response)
    }

    async fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let current_term = self.persistent.current_term;
        if request.term < current_term {
            return Ok(AppendEntriesResponse::failure(current_term));
        }

        if self.role != RaftRole::Follower {
            self.step_down(request.term);
        }
        self.leader_id = Some(request.leader_id.clone());
        self.election_timer.reset();

        // Consistency check against the preceding entry.
        if request.prev_log_index > 0 {
            let prev_term = {
                let log = self.log.read().await;
                log.term_at(request.prev_log_index).await?
            };
            match prev_term {
                Some(term) if term == request.prev_log_term => {}
                _ => return Ok(AppendEntriesResponse::failure(current_term)),
            }
        }

        let mut match_index = request.prev_log_index;
        if !request.entries.is_empty() {
            let mut log = self.log.write().await;
            for entry in &request.entries {
                if entry.index < log.first_index() {
                    match_index = entry.index;
                    continue;
                }
                if entry.index <= log.last_index() {
                    let existing = log.term_at(entry.index).await?;
                    if existing == Some(entry.term) {
                        match_index = entry.index;
                        continue;
                    }
                    // Conflicting suffix: drop ours, take the leader's.
                    log.truncate_after(entry.index - 1).await?;
                }
                log.append(entry.clone()).await?;
                match_index = entry.index;
            }
            log.flush().await?;
        } else {
            match_index = self.log.read().await.last_index().min(request.prev_log_index);
        }

        let last_index = self.log.read().await.last_index();
        let commit = request.leader_commit.min(last_index);
        self.advance_commit(commit).await?;

        Ok(AppendEntriesResponse::success(current_term, match_index.max(request.prev_log_index)))
    }

    async fn handle_request_vote(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let current_term = self.persistent.current_term;
        if request.term < current_term {
            return Ok(RequestVoteResponse {
                term: current_term,
                vote_granted: false,
            });
        }

        let (last_log_index, last_log_term) = {
            let log = self.log.read().await;
            (log.last_index(), log.last_term())
        };
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);

        let grant = log_ok && self.persistent.can_vote_for(&request.candidate_id);
        if grant {
            self.persistent.voted_for = Some(request.candidate_id.clone());
            self.persistent.save(&self.config.state_path).await?;
            self.election_timer.reset();
            debug!(id = %self.config.id, candidate = %request.candidate_id, term = request.term, "vote granted");
        }
        Ok(RequestVoteResponse {
            term: self.persistent.current_term,
            vote_granted: grant,
        })
    }

    async fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let current_term = self.persistent.current_term;
        if request.term < current_term {
            return Ok(InstallSnapshotResponse {
                term: current_term,
                success: false,
            });
        }
        self.leader_id = Some(request.leader_id.clone());
        self.election_timer.reset();

        let meta = SnapshotMeta {
            last_included_index: request.last_included_index,
            last_included_term: request.last_included_term,
        };

        let resumes_current = matches!(
            &self.snapshot_buf,
            Some((existing, buffer))
                if *existing == meta && request.offset == buffer.len() as u64
        );
        if !resumes_current {
            if request.offset != 0 {
                // Out-of-order chunk: drop the transfer and make the
                // leader restart it.
                self.snapshot_buf = None;
                return Ok(InstallSnapshotResponse {
                    term: current_term,
                    success: false,
                });
            }
            self.snapshot_buf = Some((meta, Vec::new()));
        }
        let (_, buffer) = self.snapshot_buf.as_mut().expect("transfer buffer present");
        buffer.extend_from_slice(&request.data);

        if request.done {
            let (meta, data) = self.snapshot_buf.take().expect("buffer exists");
            SnapshotFile::create(&self.config.snapshot_path, meta, &data, false).await?;
            {
                let mut log = self.log.write().await;
                log.install_snapshot(meta).await?;
            }
            self.volatile.commit_index = self.volatile.commit_index.max(meta.last_included_index);
            self.volatile.last_applied = self.volatile.last_applied.max(meta.last_included_index);
            let _ = self
                .commit_tx
                .send((self.persistent.current_term, self.volatile.commit_index));
            info!(
                id = %self.config.id,
                last_included = meta.last_included_index,
                "installed snapshot from leader"
            );
        }

        Ok(InstallSnapshotResponse {
            term: current_term,
            success: true,
        })
    }

    async fn handle_append_entries_response(
        &mut self,
        from: &str,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        self.in_flight.remove(from);
        if !self.role.is_leader() || response.term < self.persistent.current_term {
            return Ok(());
        }

        let Some(leader_state) = self.leader_state.as_mut() else {
            return Ok(());
        };

        if response.success {
            if let Some(match_index) = response.match_index {
                leader_state.update_replication(from, match_index);
            }
            let last_index = self.log.read().await.last_index();
            let majority_match = self
                .leader_state
                .as_ref()
                .expect("leader state present")
                .majority_match(last_index);

            // Only entries from the current term commit by counting.
            if majority_match > self.volatile.commit_index {
                let term_ok = {
                    let log = self.log.read().await;
                    log.term_at(majority_match).await? == Some(self.persistent.current_term)
                };
                if term_ok {
                    self.advance_commit(majority_match).await?;
                }
            }

            // Keep pushing while the follower is behind.
            let behind = self
                .leader_state
                .as_ref()
                .expect("leader state present")
                .next_index
                .get(from)
                .is_some_and(|next| *next <= last_index);
            if behind {
                if let Some(peer) = self.persistent.peers.peer(from).cloned() {
                    self.replicate_to(peer).await?;
                }
            }
        } else {
            leader_state.decrement_next_index(from);
            if let Some(peer) = self.persistent.peers.peer(from).cloned() {
                self.replicate_to(peer).await?;
            }
        }
        Ok(())
    }

    async fn handle_request_vote_response(
        &mut self,
        from: &str,
        response: RequestVoteResponse,
    ) -> Result<()> {
        if self.role != RaftRole::Candidate || response.term < self.persistent.current_term {
            return Ok(());
        }
        if response.vote_granted {
            if let Some(votes) = self.votes.as_mut() {
                votes.grant(from);
                if votes.has_majority() {
                    self.become_leader().await?;
                }
            }
        }
        Ok(())
    }
}
