//! The cluster client
//!
//! Routing rules, applied to every call:
//! 1. Send to the leader when one is known, otherwise round-robin over
//!    the peers starting at a random offset chosen at construction.
//! 2. Wait up to `request_timeout` for the reply.
//! 3. A redirect hint is adopted and the call retried at the new leader.
//! 4. "Not leader, leader unknown" clears the opinion and backs off for
//!    the election grace delay before trying a different peer.
//! 5. A timeout demotes the leader opinion and moves to a different
//!    peer. Retries are unbounded; callers bound them by cancelling.

use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::stream::EntryStream;
#[cfg(test)]
use crate::stream::EntryStreamItem;
use crate::{ClientError, Result};
use parking_lot::RwLock;
use rand::Rng;
use replog_core::{
    ClusterConfig, EntriesRequest, LogIndex, LogInfo, Peer, PeerId, Request, RequestId, Response,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Client tuning knobs
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-RPC reply deadline
    pub request_timeout: Duration,

    /// Backoff while the cluster reports no leader
    pub election_grace_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            election_grace_delay: Duration::from_millis(300),
        }
    }
}

/// RPC client with a leader opinion
pub struct ClusterClient {
    peers: RwLock<Vec<Peer>>,
    leader: RwLock<Option<Peer>>,
    cursor: AtomicUsize,
    options: ClientOptions,
}

impl ClusterClient {
    /// Build a client over the given peer set
    pub fn new(peers: Vec<Peer>, options: ClientOptions) -> Result<Self> {
        if peers.is_empty() {
            return Err(ClientError::InvalidArgument("empty peer list".into()));
        }
        let cursor = rand::thread_rng().gen_range(0..peers.len());
        Ok(Self {
            peers: RwLock::new(peers),
            leader: RwLock::new(None),
            cursor: AtomicUsize::new(cursor),
            options,
        })
    }

    /// Build from URL strings
    pub fn from_urls(urls: &[&str], options: ClientOptions) -> Result<Self> {
        let peers = urls
            .iter()
            .enumerate()
            .map(|(i, url)| Peer::new(format!("peer-{}", i), url))
            .collect::<replog_core::Result<Vec<_>>>()
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
        Self::new(peers, options)
    }

    /// The client's current leader opinion
    pub fn leader_opinion(&self) -> Option<Peer> {
        self.leader.read().clone()
    }

    /// Known peers
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().clone()
    }

    /// Replace the peer set, keeping the leader opinion when it survives
    pub fn set_peers(&self, peers: Vec<Peer>) {
        let mut leader = self.leader.write();
        if let Some(current) = leader.as_ref() {
            if !peers.iter().any(|p| p.id == current.id) {
                *leader = None;
            }
        }
        *self.peers.write() = peers;
    }

    fn pick_peer(&self) -> Peer {
        if let Some(leader) = self.leader.read().clone() {
            return leader;
        }
        let peers = self.peers.read();
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
        peers[index].clone()
    }

    fn adopt_leader(&self, hint: Peer) {
        debug!(leader = %hint.id, url = %hint.url, "adopting leader");
        {
            let mut peers = self.peers.write();
            if !peers.iter().any(|p| p.id == hint.id) {
                peers.push(hint.clone());
            }
        }
        *self.leader.write() = Some(hint);
    }

    fn demote(&self, peer: &Peer) {
        let mut leader = self.leader.write();
        if leader.as_ref().is_some_and(|l| l.id == peer.id) {
            debug!(leader = %peer.id, "demoting leader opinion");
            *leader = None;
        }
    }

    fn clear_leader(&self) {
        *self.leader.write() = None;
    }

    /// Drive one request to a useful response, following the routing
    /// rules; returns the response and the peer that served it
    pub async fn call(&self, request: Request, cancel: &CancelToken) -> Result<(Response, Peer)> {
        loop {
            cancel.check()?;
            let peer = self.pick_peer();

            let exchange = async {
                let mut connection = Connection::connect(&peer).await?;
                connection.exchange(&request).await
            };
            let outcome = tokio::select! {
                outcome = tokio::time::timeout(self.options.request_timeout, exchange) => outcome,
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            };

            match outcome {
                Err(_) => {
                    debug!(peer = %peer.id, "request timed out");
                    self.demote(&peer);
                }
                Ok(Err(ClientError::Io(err))) => {
                    debug!(peer = %peer.id, error = %err, "peer unreachable");
                    self.demote(&peer);
                    cancel.sleep(Duration::from_millis(50)).await?;
                }
                Ok(Err(err)) => return Err(err),
                Ok(Ok(Response::NotLeader { leader: Some(hint) })) => {
                    self.adopt_leader(hint);
                }
                Ok(Ok(Response::NotLeader { leader: None })) => {
                    self.clear_leader();
                    cancel.sleep(self.options.election_grace_delay).await?;
                }
                Ok(Ok(response)) => return Ok((response, peer)),
            }
        }
    }

    /// `?` — cluster configuration from any peer
    pub async fn request_config(
        &self,
        cancel: &CancelToken,
    ) -> Result<(ClusterConfig, Option<PeerId>)> {
        let (response, _) = self.call(Request::Config, cancel).await?;
        match response {
            Response::Config { config, leader_id } => {
                self.set_peers(config.peers.clone());
                if let Some(id) = &leader_id {
                    if let Some(peer) = config.peer(id).cloned() {
                        self.adopt_leader(peer);
                    }
                }
                Ok((config, leader_id))
            }
            other => Err(unexpected(other)),
        }
    }

    /// `i` — log info; restricted to the leader unless `any_peer`
    pub async fn request_log_info(&self, any_peer: bool, cancel: &CancelToken) -> Result<LogInfo> {
        let (response, _) = self.call(Request::LogInfo { any_peer }, cancel).await?;
        match response {
            Response::LogInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// `u` — submit an update; repeated calls with the same request id
    /// resolve to the original commit index
    pub async fn request_update(
        &self,
        request_id: RequestId,
        payload: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<LogIndex> {
        let request = Request::Update {
            request_id,
            payload,
        };
        let (response, _) = self.call(request, cancel).await?;
        match response {
            Response::UpdateOk { commit_index } => Ok(commit_index),
            Response::Expired => Err(ClientError::Expired),
            Response::Invalid { message } => Err(ClientError::Rejected(message)),
            other => Err(unexpected(other)),
        }
    }

    /// `*` — publisher URL for the broadcast channel
    pub async fn request_publisher_url(
        &self,
        secret: &[u8],
        cancel: &CancelToken,
    ) -> Result<Option<String>> {
        let request = Request::PublisherUrl {
            secret: secret.to_vec(),
        };
        let (response, _) = self.call(request, cancel).await?;
        match response {
            Response::PublisherUrl { url } => Ok(url),
            Response::AuthFailure => Err(ClientError::AuthFailure),
            other => Err(unexpected(other)),
        }
    }

    /// `e` — open a resumable ordered stream of entries (or snapshot
    /// chunks when `from_index` predates the log)
    pub async fn request_entries(
        &self,
        entries: EntriesRequest,
        cancel: &CancelToken,
    ) -> Result<EntryStream> {
        loop {
            cancel.check()?;
            let peer = self.pick_peer();
            let opened = tokio::time::timeout(self.options.request_timeout, async {
                let mut connection = Connection::connect(&peer).await?;
                let correlation = connection.send_request(&Request::Entries(entries)).await?;
                Ok::<_, ClientError>((connection, correlation))
            })
            .await;

            match opened {
                Err(_) => {
                    self.demote(&peer);
                }
                Ok(Err(err)) => {
                    warn!(peer = %peer.id, error = %err, "entries request failed to open");
                    self.demote(&peer);
                    cancel.sleep(Duration::from_millis(50)).await?;
                }
                Ok(Ok((connection, correlation))) => {
                    return Ok(EntryStream::new(
                        connection,
                        correlation,
                        entries.from_index,
                        self.options.request_timeout,
                        cancel.clone(),
                    ));
                }
            }
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::Rejected(format!("unexpected response: {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_core::{read_message, write_message, ResponseStatus};
    use tokio::net::TcpListener;

    async fn bind_peer(id: &str) -> (Peer, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = Peer::new(id, &format!("tcp://{}", addr)).unwrap();
        (peer, listener)
    }

    /// Accept one connection and answer each request with the scripted
    /// responses, in order.
    fn serve_script(listener: TcpListener, responses: Vec<Response>) {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for response in responses {
                let frames = read_message(&mut stream).await.unwrap();
                let (correlation, _) = Request::decode(&frames).unwrap();
                let out = response.encode(correlation).unwrap();
                write_message(&mut stream, &out).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_redirect_adoption() {
        let (peer_a, listener_a) = bind_peer("a").await;
        let (peer_b, listener_b) = bind_peer("b").await;

        serve_script(
            listener_a,
            vec![Response::NotLeader {
                leader: Some(peer_b.clone()),
            }],
        );
        serve_script(listener_b, vec![Response::UpdateOk { commit_index: 7 }]);

        let client = ClusterClient::new(vec![peer_a], ClientOptions::default()).unwrap();
        let cancel = CancelToken::new();
        let index = client
            .request_update(RequestId::generate(), b"x".to_vec(), &cancel)
            .await
            .unwrap();
        assert_eq!(index, 7);
        assert_eq!(client.leader_opinion().unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_timeout_demotes_and_retries() {
        let (peer_a, listener_a) = bind_peer("a").await;
        let (peer_b, listener_b) = bind_peer("b").await;

        // Peer a accepts but never answers.
        tokio::spawn(async move {
            let (_stream, _) = listener_a.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        serve_script(listener_b, vec![Response::UpdateOk { commit_index: 3 }]);

        let options = ClientOptions {
            request_timeout: Duration::from_millis(100),
            election_grace_delay: Duration::from_millis(10),
        };
        let client = ClusterClient::new(vec![peer_a.clone(), peer_b], options).unwrap();
        // Pretend a is the known leader so the first try hits it.
        client.adopt_leader(peer_a);

        let cancel = CancelToken::new();
        let index = client
            .request_update(RequestId::generate(), b"x".to_vec(), &cancel)
            .await
            .unwrap();
        assert_eq!(index, 3);
        // The silent leader was demoted, the responder is not adopted
        // (only explicit hints and config answers set the opinion).
        assert!(client.leader_opinion().is_none() || client.leader_opinion().unwrap().id == "b");
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        // A peer that is never reachable: nothing listens on the port.
        let (peer, listener) = bind_peer("a").await;
        drop(listener);

        let options = ClientOptions {
            request_timeout: Duration::from_millis(50),
            election_grace_delay: Duration::from_millis(10),
        };
        let client = ClusterClient::new(vec![peer], options).unwrap();
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = client
            .request_update(RequestId::generate(), b"x".to_vec(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_round_robin_visits_all_peers() {
        let peers: Vec<Peer> = (0..4)
            .map(|i| Peer::new(format!("p{}", i), &format!("tcp://127.0.0.1:{}", 19000 + i)).unwrap())
            .collect();
        let client = ClusterClient::new(peers.clone(), ClientOptions::default()).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(client.pick_peer().id);
        }
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn test_expired_update_surfaces() {
        let (peer, listener) = bind_peer("a").await;
        serve_script(listener, vec![Response::Expired]);

        let client = ClusterClient::new(vec![peer], ClientOptions::default()).unwrap();
        let cancel = CancelToken::new();
        let err = client
            .request_update(RequestId::generate(), b"x".to_vec(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Expired));
    }

    #[tokio::test]
    async fn test_request_config_adopts_leader() {
        let (peer, listener) = bind_peer("a").await;
        let config = ClusterConfig::new(vec![
            Peer::new("a", "tcp://127.0.0.1:19101").unwrap(),
            Peer::new("b", "tcp://127.0.0.1:19102").unwrap(),
        ])
        .unwrap();
        serve_script(
            listener,
            vec![Response::Config {
                config: config.clone(),
                leader_id: Some("b".to_string()),
            }],
        );

        let client = ClusterClient::new(vec![peer], ClientOptions::default()).unwrap();
        let cancel = CancelToken::new();
        let (fetched, leader_id) = client.request_config(&cancel).await.unwrap();
        assert_eq!(fetched, config);
        assert_eq!(leader_id.as_deref(), Some("b"));
        assert_eq!(client.leader_opinion().unwrap().id, "b");
        assert_eq!(client.peers().len(), 2);
    }

    #[tokio::test]
    async fn test_entries_stream_end_to_end() {
        use replog_core::{encode_entry_chunk, LogEntry};

        let (peer, listener) = bind_peer("a").await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frames = read_message(&mut stream).await.unwrap();
            let (correlation, request) = Request::decode(&frames).unwrap();
            let from = match request {
                Request::Entries(req) => req.from_index,
                other => panic!("unexpected request: {:?}", other),
            };
            assert_eq!(from, 1);

            let entries: Vec<LogEntry> = (1..=3)
                .map(|i| LogEntry::new(i, 1, RequestId::generate(), vec![i as u8]))
                .collect();
            let chunk = Response::Entries {
                status: ResponseStatus::Entries,
                last_index: 3,
                byte_offset: 0,
                byte_size: 0,
                chunk: encode_entry_chunk(&entries),
            };
            write_message(&mut stream, &chunk.encode(correlation).unwrap())
                .await
                .unwrap();
            let done = Response::Entries {
                status: ResponseStatus::Done,
                last_index: 3,
                byte_offset: 0,
                byte_size: 0,
                chunk: Vec::new(),
            };
            write_message(&mut stream, &done.encode(correlation).unwrap())
                .await
                .unwrap();
        });

        let client = ClusterClient::new(vec![peer], ClientOptions::default()).unwrap();
        let cancel = CancelToken::new();
        let mut stream = client
            .request_entries(
                EntriesRequest {
                    from_index: 1,
                    byte_budget: 0,
                    count_limit: 0,
                },
                &cancel,
            )
            .await
            .unwrap();

        let mut indexes = Vec::new();
        while let Some(item) = stream.next().await.unwrap() {
            match item {
                EntryStreamItem::Entry(entry) => indexes.push(entry.index),
                EntryStreamItem::Chunk(_) => panic!("no snapshot expected"),
            }
        }
        assert_eq!(indexes, vec![1, 2, 3]);
        assert_eq!(stream.next_index(), 4);
    }
}
