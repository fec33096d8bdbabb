//! Broadcast publisher
//!
//! While this node leads, committed entries fan out to subscribers over
//! per-connection channels. A subscriber connects, subscribes with the
//! cluster secret, and receives `[secret | term | last_log_index |
//! entry...]` messages; an empty message every heartbeat interval
//! asserts liveness. A wrong secret drops the connection; a subscriber
//! whose outbound queue fills is dropped too and recovers through gap
//! recovery. Closing the publisher discards all pending sends.

use dashmap::DashMap;
use replog_core::{read_message, write_message, BroadcastMessage, Frame, LogEntry, SubscribeControl};
use replog_raft::RaftHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Entries per broadcast message
const BROADCAST_BATCH: usize = 64;

/// Outbound queue depth per subscriber
const SUBSCRIBER_QUEUE: usize = 256;

struct SubscriberConn {
    tx: mpsc::Sender<Arc<Vec<Frame>>>,
    subscribed: Arc<AtomicBool>,
}

/// The fan-out side of the broadcast channel
pub struct Publisher {
    url: String,
    subscribers: Arc<DashMap<Uuid, SubscriberConn>>,
    accept_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl Publisher {
    /// Start publishing on the given listener
    pub fn spawn(
        listener: TcpListener,
        secret: Vec<u8>,
        heartbeat_interval: Duration,
        raft: RaftHandle,
    ) -> crate::Result<Self> {
        let addr = listener.local_addr()?;
        let url = format!("tcp://{}", addr);
        let subscribers: Arc<DashMap<Uuid, SubscriberConn>> = Arc::new(DashMap::new());

        let accept_task = {
            let subscribers = Arc::clone(&subscribers);
            let secret = secret.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, peer_addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "publisher accept failed");
                            continue;
                        }
                    };
                    debug!(peer = %peer_addr, "subscriber connecting");
                    tokio::spawn(handle_subscriber(
                        stream,
                        secret.clone(),
                        Arc::clone(&subscribers),
                    ));
                }
            })
        };

        let pump_task = {
            let subscribers = Arc::clone(&subscribers);
            let secret = secret.clone();
            tokio::spawn(async move {
                pump(raft, secret, heartbeat_interval, subscribers).await;
            })
        };

        info!(url = %url, "broadcast publisher started");
        Ok(Self {
            url,
            subscribers,
            accept_task,
            pump_task,
        })
    }

    /// Advertised publisher URL, served through the `*` request
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connected subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stop publishing; pending sends are dropped immediately
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.pump_task.abort();
        self.subscribers.clear();
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_subscriber(
    stream: tokio::net::TcpStream,
    secret: Vec<u8>,
    subscribers: Arc<DashMap<Uuid, SubscriberConn>>,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    // The first message must subscribe with the right secret.
    let handshake = tokio::time::timeout(Duration::from_secs(10), read_message(&mut read_half)).await;
    match handshake {
        Ok(Ok(frames)) => match SubscribeControl::decode(&frames) {
            Ok(SubscribeControl::Subscribe { secret: offered }) if offered == secret => {}
            Ok(_) => {
                warn!("subscriber authentication failed: wrong secret");
                return;
            }
            Err(err) => {
                warn!(error = %err, "malformed subscribe handshake");
                return;
            }
        },
        _ => return,
    }

    let id = Uuid::new_v4();
    let subscribed = Arc::new(AtomicBool::new(true));
    let (tx, mut rx) = mpsc::channel::<Arc<Vec<Frame>>>(SUBSCRIBER_QUEUE);
    subscribers.insert(
        id,
        SubscriberConn {
            tx,
            subscribed: Arc::clone(&subscribed),
        },
    );
    debug!(subscriber = %id, "subscriber registered");

    // Writer: forward queued broadcast messages.
    let writer = tokio::spawn(async move {
        while let Some(frames) = rx.recv().await {
            if write_message(&mut write_half, &frames).await.is_err() {
                break;
            }
        }
    });

    // Reader: process subscribe/unsubscribe toggles until the peer
    // goes away.
    loop {
        match read_message(&mut read_half).await {
            Ok(frames) => match SubscribeControl::decode(&frames) {
                Ok(SubscribeControl::Subscribe { secret: offered }) => {
                    if offered == secret {
                        subscribed.store(true, Ordering::Release);
                        debug!(subscriber = %id, "subscription resumed");
                    } else {
                        warn!(subscriber = %id, "re-subscribe with wrong secret");
                        break;
                    }
                }
                Ok(SubscribeControl::Unsubscribe) => {
                    subscribed.store(false, Ordering::Release);
                    debug!(subscriber = %id, "subscription paused");
                }
                Err(_) => break,
            },
            Err(_) => break,
        }
    }

    subscribers.remove(&id);
    writer.abort();
    debug!(subscriber = %id, "subscriber gone");
}

async fn pump(
    raft: RaftHandle,
    secret: Vec<u8>,
    heartbeat_interval: Duration,
    subscribers: Arc<DashMap<Uuid, SubscriberConn>>,
) {
    let mut commit_rx = raft.commit_watch();
    let (mut term, mut last_published) = *commit_rx.borrow();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let (new_term, commit) = *commit_rx.borrow();
                term = new_term;
                if commit <= last_published {
                    continue;
                }

                let mut entries: Vec<LogEntry> = Vec::new();
                {
                    let log = raft.log();
                    let log = log.read().await;
                    let from = (last_published + 1).max(log.first_index());
                    if let Err(err) = log
                        .read_range(from, commit, 0, |entry| {
                            entries.push(entry.clone());
                            true
                        })
                        .await
                    {
                        warn!(error = %err, "publisher failed to read committed entries");
                        continue;
                    }
                }

                for batch in entries.chunks(BROADCAST_BATCH) {
                    let last_index = batch.last().map(|e| e.index).unwrap_or(commit);
                    let message = BroadcastMessage {
                        term,
                        last_log_index: last_index,
                        entries: batch.to_vec(),
                    };
                    publish(&subscribers, Arc::new(message.encode(&secret)));
                }
                last_published = commit;
            }
            _ = heartbeat.tick() => {
                let message = BroadcastMessage::heartbeat(term, last_published);
                publish(&subscribers, Arc::new(message.encode(&secret)));
            }
        }
    }
}

fn publish(subscribers: &DashMap<Uuid, SubscriberConn>, frames: Arc<Vec<Frame>>) {
    let mut dropped = Vec::new();
    for entry in subscribers.iter() {
        if !entry.subscribed.load(Ordering::Acquire) {
            continue;
        }
        match entry.tx.try_send(Arc::clone(&frames)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A subscriber this far behind recovers over RPC.
                warn!(subscriber = %entry.key(), "subscriber queue full, dropping connection");
                dropped.push(*entry.key());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*entry.key()),
        }
    }
    for id in dropped {
        subscribers.remove(&id);
    }
}
