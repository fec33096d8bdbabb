//! The duplex subscriber
//!
//! Read-side state machine:
//!
//! ```text
//! Disconnected -> Discovering -> Subscribed -> Paused -> Closed
//! ```
//!
//! Discovery asks any peer for the cluster configuration, learns the
//! publisher URL through the `*` request, connects the fan-out socket
//! and subscribes under the cluster secret. Broadcast messages whose
//! entries extend the delivered prefix are pushed to the consumer in
//! order; a message that skips ahead is parked in the `ahead` queue
//! while the missing range is pulled through the RPC client. Silence
//! past the unresponsiveness threshold re-enters discovery.

use crate::{Result, SubscriberError};
use parking_lot::RwLock;
use replog_client::{
    CancelToken, ClientError, ClientOptions, ClusterClient, EntryStreamItem,
};
use replog_core::{
    read_message, write_message, BroadcastMessage, EntriesRequest, LogEntry, LogIndex, Peer,
    PeerUrl, RequestId, SnapshotChunk, SubscribeControl,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

/// Subscriber tuning knobs
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Cluster secret, used as the subscription filter and identity
    pub secret: Vec<u8>,

    /// Highest index already held by the consumer; delivery starts
    /// after it
    pub last_index: LogIndex,

    /// Read-side channel capacity; the consumer falling this far
    /// behind pauses the fan-out subscription
    pub delivery_capacity: usize,

    /// Publisher heartbeat interval; silence past twice this (floor
    /// 100 ms) re-enters discovery
    pub heartbeat_interval: Duration,

    /// Serialize writes through a single slot so commit order matches
    /// submission order across retries
    pub single_slot_writes: bool,

    /// RPC client options
    pub client: ClientOptions,
}

impl SubscriberOptions {
    /// Defaults for the given secret
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            last_index: 0,
            delivery_capacity: 64,
            heartbeat_interval: Duration::from_millis(500),
            single_slot_writes: false,
            client: ClientOptions::default(),
        }
    }

    /// Threshold after which the publisher counts as unresponsive
    pub fn unresponsiveness_timeout(&self) -> Duration {
        (self.heartbeat_interval * 2).max(Duration::from_millis(100))
    }
}

/// Items delivered on the read side, in strict index order
#[derive(Debug, Clone)]
pub enum SubscriberItem {
    /// A committed log entry
    Entry(LogEntry),
    /// A chunk of a snapshot replacing the log prefix
    Chunk(SnapshotChunk),
}

/// Out-of-band notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// The subscriber is caught up with the broadcast stream
    Fresh,
    /// A gap of this many entries is being recovered over RPC
    Stale { gap: u64 },
    /// The publisher went silent; discovery restarts
    Timeout,
    /// Unrecoverable failure; the subscriber is closed
    Fatal(String),
}

/// Lifecycle states of the read side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Discovering,
    /// Receiving broadcasts; whether the stream is currently fresh or
    /// recovering a gap is reported through [`SubscriberEvent::Fresh`]
    /// and [`SubscriberEvent::Stale`] rather than split into substates
    Subscribed,
    Paused,
    Closed,
}

struct Counters {
    last_log_index: AtomicU64,
    last_update_log_index: AtomicU64,
    state: RwLock<SubscriberState>,
}

/// The duplex handle held by the consumer
pub struct Subscriber {
    items_rx: mpsc::Receiver<SubscriberItem>,
    events_rx: mpsc::UnboundedReceiver<SubscriberEvent>,
    client: Arc<ClusterClient>,
    counters: Arc<Counters>,
    cancel: CancelToken,
    started: Arc<Notify>,
    start_flag: Arc<AtomicBool>,
    write_slot: Arc<Mutex<()>>,
    single_slot_writes: bool,
}

impl Subscriber {
    /// Build a subscriber over the given peers and spawn its pump
    ///
    /// The pump stays in `Disconnected` until the first read or write
    /// demand.
    pub fn connect(peers: Vec<Peer>, options: SubscriberOptions) -> Result<Self> {
        if peers.is_empty() {
            return Err(SubscriberError::NoPeers);
        }
        let client = Arc::new(
            ClusterClient::new(peers, options.client.clone())
                .map_err(SubscriberError::Client)?,
        );
        let counters = Arc::new(Counters {
            last_log_index: AtomicU64::new(options.last_index),
            last_update_log_index: AtomicU64::new(0),
            state: RwLock::new(SubscriberState::Disconnected),
        });
        let (items_tx, items_rx) = mpsc::channel(options.delivery_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let started = Arc::new(Notify::new());
        let start_flag = Arc::new(AtomicBool::new(false));

        let pump = Pump {
            client: Arc::clone(&client),
            options: options.clone(),
            counters: Arc::clone(&counters),
            items_tx,
            events_tx,
            cancel: cancel.clone(),
            ahead: BTreeMap::new(),
            catchup_rx: None,
            fresh_emitted: false,
        };
        {
            let started = Arc::clone(&started);
            let start_flag = Arc::clone(&start_flag);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if !start_flag.load(Ordering::Acquire) {
                    tokio::select! {
                        _ = started.notified() => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                pump.run().await;
            });
        }

        Ok(Self {
            items_rx,
            events_rx,
            client,
            counters,
            cancel,
            started,
            start_flag,
            write_slot: Arc::new(Mutex::new(())),
            single_slot_writes: options.single_slot_writes,
        })
    }

    fn ensure_started(&self) {
        if !self.start_flag.swap(true, Ordering::AcqRel) {
            self.started.notify_one();
        }
    }

    /// Pull the next item; None once the subscriber is closed
    pub async fn recv(&mut self) -> Option<SubscriberItem> {
        self.ensure_started();
        self.items_rx.recv().await
    }

    /// Pull the next out-of-band event
    pub async fn next_event(&mut self) -> Option<SubscriberEvent> {
        self.ensure_started();
        self.events_rx.recv().await
    }

    /// Forward one update to the cluster; resolves with its commit index
    pub async fn send(&self, payload: Vec<u8>) -> Result<LogIndex> {
        self.ensure_started();
        let _slot = if self.single_slot_writes {
            Some(self.write_slot.lock().await)
        } else {
            None
        };
        let index = self
            .client
            .request_update(RequestId::generate(), payload, &self.cancel)
            .await?;
        self.counters
            .last_update_log_index
            .fetch_max(index, Ordering::AcqRel);
        Ok(index)
    }

    /// Forward a batch of updates
    ///
    /// Requests run concurrently unless `single_slot_writes` is set, so
    /// commit order across retries is not guaranteed.
    pub async fn send_batch(&self, payloads: Vec<Vec<u8>>) -> Result<Vec<LogIndex>> {
        self.ensure_started();
        if self.single_slot_writes {
            let mut indexes = Vec::with_capacity(payloads.len());
            for payload in payloads {
                indexes.push(self.send(payload).await?);
            }
            return Ok(indexes);
        }

        let tasks: Vec<_> = payloads
            .into_iter()
            .map(|payload| {
                let client = Arc::clone(&self.client);
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    client
                        .request_update(RequestId::generate(), payload, &cancel)
                        .await
                })
            })
            .collect();

        let mut indexes = Vec::with_capacity(tasks.len());
        for task in tasks {
            let index = task
                .await
                .map_err(|_| SubscriberError::Closed)?
                .map_err(SubscriberError::Client)?;
            self.counters
                .last_update_log_index
                .fetch_max(index, Ordering::AcqRel);
            indexes.push(index);
        }
        Ok(indexes)
    }

    /// Highest entry index delivered on the read side
    pub fn last_log_index(&self) -> LogIndex {
        self.counters.last_log_index.load(Ordering::Acquire)
    }

    /// Highest commit index acknowledged for this subscriber's writes
    pub fn last_update_log_index(&self) -> LogIndex {
        self.counters.last_update_log_index.load(Ordering::Acquire)
    }

    /// Current read-side state
    pub fn state(&self) -> SubscriberState {
        *self.counters.state.read()
    }

    /// Stop the pump and discard any gap recovery in flight
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Flow {
    Reconnect,
    Fatal,
}

enum CatchupItem {
    Item(EntryStreamItem),
    End,
    Failed(String),
}

struct Pump {
    client: Arc<ClusterClient>,
    options: SubscriberOptions,
    counters: Arc<Counters>,
    items_tx: mpsc::Sender<SubscriberItem>,
    events_tx: mpsc::UnboundedSender<SubscriberEvent>,
    cancel: CancelToken,
    /// Broadcast messages received while a gap is being recovered,
    /// keyed by their last index
    ahead: BTreeMap<LogIndex, BroadcastMessage>,
    catchup_rx: Option<mpsc::Receiver<CatchupItem>>,
    fresh_emitted: bool,
}

impl Pump {
    fn set_state(&self, state: SubscriberState) {
        *self.counters.state.write() = state;
    }

    fn last(&self) -> LogIndex {
        self.counters.last_log_index.load(Ordering::Acquire)
    }

    fn emit(&self, event: SubscriberEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(SubscriberState::Discovering);
            self.ahead.clear();
            self.catchup_rx = None;

            let stream = match self.discover().await {
                Ok(stream) => stream,
                Err(SubscriberError::AuthFailure) => {
                    self.emit(SubscriberEvent::Fatal("wrong cluster secret".into()));
                    break;
                }
                Err(SubscriberError::Client(ClientError::Cancelled)) => break,
                Err(err) => {
                    debug!(error = %err, "discovery failed, retrying");
                    if self
                        .cancel
                        .sleep(self.options.client.election_grace_delay)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };

            match self.subscribed_loop(stream).await {
                Flow::Reconnect => continue,
                Flow::Fatal => break,
            }
        }
        self.set_state(SubscriberState::Closed);
        info!("subscriber pump stopped");
    }

    async fn discover(&mut self) -> Result<TcpStream> {
        self.client.request_config(&self.cancel).await.map_err(|err| match err {
            ClientError::AuthFailure => SubscriberError::AuthFailure,
            other => SubscriberError::Client(other),
        })?;

        let url = self
            .client
            .request_publisher_url(&self.options.secret, &self.cancel)
            .await
            .map_err(|err| match err {
                ClientError::AuthFailure => SubscriberError::AuthFailure,
                other => SubscriberError::Client(other),
            })?
            .ok_or(SubscriberError::Client(ClientError::NoLeader))?;

        let addr = PeerUrl::parse(&url)?.socket_addr();
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_message(
            &mut stream,
            &SubscribeControl::Subscribe {
                secret: self.options.secret.clone(),
            }
            .encode(),
        )
        .await?;
        debug!(publisher = %url, "subscribed to fan-out channel");
        Ok(stream)
    }

    async fn subscribed_loop(&mut self, mut stream: TcpStream) -> Flow {
        self.set_state(SubscriberState::Subscribed);
        self.fresh_emitted = false;
        let unresponsive = self.options.unresponsiveness_timeout();
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                incoming = tokio::time::timeout(unresponsive, read_message(&mut stream)) => {
                    match incoming {
                        Err(_) => {
                            debug!("publisher unresponsive");
                            self.emit(SubscriberEvent::Timeout);
                            return Flow::Reconnect;
                        }
                        Ok(Err(_)) => return Flow::Reconnect,
                        Ok(Ok(frames)) => {
                            let (secret, message) = match BroadcastMessage::decode(&frames) {
                                Ok(decoded) => decoded,
                                Err(err) => {
                                    warn!(error = %err, "malformed broadcast message");
                                    return Flow::Reconnect;
                                }
                            };
                            if secret != self.options.secret {
                                self.emit(SubscriberEvent::Fatal("wrong cluster secret".into()));
                                return Flow::Fatal;
                            }
                            if let Some(flow) = self.handle_broadcast(&mut stream, message).await {
                                return flow;
                            }
                        }
                    }
                }
                item = async { self.catchup_rx.as_mut().expect("guarded by if").recv().await },
                    if self.catchup_rx.is_some() =>
                {
                    if let Some(flow) = self.handle_catchup_item(&mut stream, item).await {
                        return flow;
                    }
                }
                _ = cancel.cancelled() => return Flow::Fatal,
            }
        }
    }

    async fn handle_broadcast(
        &mut self,
        stream: &mut TcpStream,
        message: BroadcastMessage,
    ) -> Option<Flow> {
        let last = self.last();

        if message.prev_index() <= last {
            for entry in message.entries {
                if entry.index <= self.last() {
                    continue;
                }
                if let Some(flow) = self.deliver(stream, SubscriberItem::Entry(entry)).await {
                    return Some(flow);
                }
            }
            if !self.fresh_emitted && self.catchup_rx.is_none() && self.ahead.is_empty() {
                self.fresh_emitted = true;
                self.emit(SubscriberEvent::Fresh);
            }
        } else {
            let gap = message.prev_index() - last;
            self.ahead.insert(message.last_log_index, message);
            if self.catchup_rx.is_none() {
                self.start_catchup(last + 1, gap);
                self.fresh_emitted = false;
                self.emit(SubscriberEvent::Stale { gap });
            }
        }
        None
    }

    fn start_catchup(&mut self, from: LogIndex, count: u64) {
        debug!(from, count, "recovering missed entries over RPC");
        let (tx, rx) = mpsc::channel(16);
        self.catchup_rx = Some(rx);

        let client = Arc::clone(&self.client);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let request = EntriesRequest {
                from_index: from,
                byte_budget: 0,
                count_limit: count,
            };
            let mut stream = match client.request_entries(request, &cancel).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = tx.send(CatchupItem::Failed(err.to_string())).await;
                    return;
                }
            };
            loop {
                match stream.next().await {
                    Ok(Some(item)) => {
                        if tx.send(CatchupItem::Item(item)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(CatchupItem::End).await;
                        return;
                    }
                    Err(err) => {
                        let _ = tx.send(CatchupItem::Failed(err.to_string())).await;
                        return;
                    }
                }
            }
        });
    }

    async fn handle_catchup_item(
        &mut self,
        stream: &mut TcpStream,
        item: Option<CatchupItem>,
    ) -> Option<Flow> {
        match item {
            Some(CatchupItem::Item(EntryStreamItem::Entry(entry))) => {
                if entry.index <= self.last() {
                    return None;
                }
                if entry.index != self.last() + 1 {
                    // The server skipped ahead; restart from where we are.
                    warn!(
                        got = entry.index,
                        expected = self.last() + 1,
                        "out-of-order catch-up entry, restarting recovery"
                    );
                    self.catchup_rx = None;
                    return self.resume_recovery().await;
                }
                self.deliver(stream, SubscriberItem::Entry(entry)).await
            }
            Some(CatchupItem::Item(EntryStreamItem::Chunk(chunk))) => {
                self.deliver(stream, SubscriberItem::Chunk(chunk)).await
            }
            Some(CatchupItem::Failed(reason)) => {
                debug!(reason = %reason, "catch-up stream failed, restarting recovery");
                self.catchup_rx = None;
                self.resume_recovery().await
            }
            Some(CatchupItem::End) | None => {
                self.catchup_rx = None;
                self.drain_ahead(stream).await
            }
        }
    }

    /// Restart gap recovery against the parked broadcast backlog
    async fn resume_recovery(&mut self) -> Option<Flow> {
        let last = self.last();
        let target = self
            .ahead
            .values()
            .next()
            .map(|message| message.prev_index());
        match target {
            Some(prev) if prev > last => {
                self.start_catchup(last + 1, prev - last);
                None
            }
            // Nothing parked demands recovery; the next broadcast
            // drives progress.
            _ => None,
        }
    }

    /// Apply parked broadcasts in order once a catch-up completed
    async fn drain_ahead(&mut self, stream: &mut TcpStream) -> Option<Flow> {
        while let Some((&key, _)) = self.ahead.iter().next() {
            let message = self.ahead.remove(&key).expect("key just observed");
            let last = self.last();

            if message.last_log_index <= last {
                continue;
            }
            if message.prev_index() > last {
                // A smaller gap remains; recover it and keep the rest
                // parked.
                let gap = message.prev_index() - last;
                self.ahead.insert(message.last_log_index, message);
                self.start_catchup(last + 1, gap);
                self.emit(SubscriberEvent::Stale { gap });
                return None;
            }
            for entry in message.entries {
                if entry.index <= self.last() {
                    continue;
                }
                if let Some(flow) = self.deliver(stream, SubscriberItem::Entry(entry)).await {
                    return Some(flow);
                }
            }
        }

        if !self.fresh_emitted {
            self.fresh_emitted = true;
            self.emit(SubscriberEvent::Fresh);
        }
        None
    }

    /// Push one item to the consumer, pausing the fan-out subscription
    /// while the delivery channel is full
    async fn deliver(&mut self, stream: &mut TcpStream, item: SubscriberItem) -> Option<Flow> {
        let advance = match &item {
            SubscriberItem::Entry(entry) => Some(entry.index),
            SubscriberItem::Chunk(chunk) if chunk.is_last => Some(chunk.index),
            SubscriberItem::Chunk(_) => None,
        };

        match self.items_tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.cancel.cancel();
                return Some(Flow::Fatal);
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                // Shed load: stop the fan-out until the consumer pulls.
                self.set_state(SubscriberState::Paused);
                let _ = write_message(stream, &SubscribeControl::Unsubscribe.encode()).await;
                debug!("consumer backpressure, fan-out paused");

                let permit = tokio::select! {
                    permit = self.items_tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.cancel.cancel();
                            return Some(Flow::Fatal);
                        }
                    },
                    _ = self.cancel.cancelled() => return Some(Flow::Fatal),
                };
                permit.send(item);

                // The paused catch-up stream resumes first (it is pull
                // driven), then the fan-out subscription.
                if write_message(
                    stream,
                    &SubscribeControl::Subscribe {
                        secret: self.options.secret.clone(),
                    }
                    .encode(),
                )
                .await
                .is_err()
                {
                    return Some(Flow::Reconnect);
                }
                self.set_state(SubscriberState::Subscribed);
            }
        }

        if let Some(index) = advance {
            self.counters
                .last_log_index
                .fetch_max(index, Ordering::AcqRel);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresponsiveness_threshold() {
        let mut options = SubscriberOptions::new(b"s".to_vec());
        assert_eq!(
            options.unresponsiveness_timeout(),
            Duration::from_millis(1000)
        );

        options.heartbeat_interval = Duration::from_millis(20);
        assert_eq!(
            options.unresponsiveness_timeout(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_connect_requires_peers() {
        let result = Subscriber::connect(vec![], SubscriberOptions::new(b"s".to_vec()));
        assert!(matches!(result, Err(SubscriberError::NoPeers)));
    }

    #[tokio::test]
    async fn test_counters_start_at_configured_index() {
        let peer = Peer::new("a", "tcp://127.0.0.1:19301").unwrap();
        let mut options = SubscriberOptions::new(b"s".to_vec());
        options.last_index = 42;
        let subscriber = Subscriber::connect(vec![peer], options).unwrap();

        assert_eq!(subscriber.last_log_index(), 42);
        assert_eq!(subscriber.last_update_log_index(), 0);
        // No demand yet: the pump has not left Disconnected.
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);
        subscriber.close();
    }
}
