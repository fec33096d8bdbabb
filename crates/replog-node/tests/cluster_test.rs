//! End-to-end tests over a running node: client RPCs, broadcast
//! delivery, catch-up, and backpressure.

use replog_client::{CancelToken, ClientOptions, ClusterClient};
use replog_core::{ClusterConfig, Peer, RequestId};
use replog_node::{Node, NodeConfig};
use replog_storage::LogOptions;
use replog_subscriber::{Subscriber, SubscriberEvent, SubscriberItem, SubscriberOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const SECRET: &[u8] = b"cluster-secret";

fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("replog-e2e-{}-{}", tag, uuid_suffix()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn uuid_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

async fn start_node(tag: &str) -> (Node, PathBuf) {
    let dir = test_dir(tag);
    let mut config = NodeConfig::new("a", &dir, SECRET);
    config.election_timeout_ms = (50, 100);
    config.heartbeat_interval = Duration::from_millis(50);
    config.log_options = LogOptions {
        max_entries_per_segment: 32,
        max_bytes_per_segment: 1024 * 1024,
    };
    let node = Node::start(config).await.unwrap();

    // The single peer elects itself promptly.
    for _ in 0..100 {
        if node.raft().is_leader() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(node.raft().is_leader(), "single peer should elect itself");
    (node, dir)
}

fn client_for(node: &Node) -> ClusterClient {
    ClusterClient::new(
        vec![node.self_peer()],
        ClientOptions {
            request_timeout: Duration::from_secs(2),
            election_grace_delay: Duration::from_millis(50),
        },
    )
    .unwrap()
}

async fn reserve_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start a three-node cluster on reserved loopback ports
async fn start_cluster(tag: &str) -> (Vec<Node>, Vec<PathBuf>, ClusterConfig) {
    let ids = ["a", "b", "c"];
    let mut rpc_addrs = Vec::new();
    for _ in &ids {
        rpc_addrs.push(reserve_addr().await);
    }
    let peers = ClusterConfig::new(
        ids.iter()
            .zip(&rpc_addrs)
            .map(|(id, addr)| Peer::new(*id, &format!("tcp://{}", addr)).unwrap())
            .collect(),
    )
    .unwrap();

    let mut nodes = Vec::new();
    let mut dirs = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let dir = test_dir(&format!("{}-{}", tag, id));
        let mut config = NodeConfig::new(*id, &dir, SECRET);
        config.rpc_addr = rpc_addrs[i];
        config.peers = peers.clone();
        config.election_timeout_ms = (100, 200);
        config.heartbeat_interval = Duration::from_millis(50);
        nodes.push(Node::start(config).await.unwrap());
        dirs.push(dir);
    }
    (nodes, dirs, peers)
}

async fn wait_for_cluster_leader(nodes: &[Node]) -> usize {
    for _ in 0..400 {
        if let Some(pos) = nodes.iter().position(|n| n.raft().is_leader()) {
            return pos;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("cluster elected no leader");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_peer_append_and_read() {
    let (node, dir) = start_node("single").await;
    let client = client_for(&node);
    let cancel = CancelToken::new();

    let index = client
        .request_update(RequestId::generate(), b"a".to_vec(), &cancel)
        .await
        .unwrap();
    assert_eq!(index, 1);

    let info = client.request_log_info(true, &cancel).await.unwrap();
    assert!(info.is_leader);
    assert_eq!(info.commit_index, 1);
    assert_eq!(info.last_index, 1);
    assert_eq!(info.first_index, 1);

    let stream = client
        .request_entries(
            replog_core::EntriesRequest {
                from_index: 1,
                byte_budget: 0,
                count_limit: 0,
            },
            &cancel,
        )
        .await
        .unwrap();
    let items = stream.collect_remaining().await.unwrap();
    assert_eq!(items.len(), 1);
    match &items[0] {
        replog_client::EntryStreamItem::Entry(entry) => {
            assert_eq!(entry.index, 1);
            assert_eq!(entry.payload, b"a");
        }
        other => panic!("unexpected item: {:?}", other),
    }

    node.shutdown();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_request_id_is_idempotent() {
    let (node, dir) = start_node("dedup").await;
    let client = client_for(&node);
    let cancel = CancelToken::new();

    let rid = RequestId::generate();
    let first = client
        .request_update(rid, b"payload".to_vec(), &cancel)
        .await
        .unwrap();
    let second = client
        .request_update(rid, b"payload".to_vec(), &cancel)
        .await
        .unwrap();
    assert_eq!(first, second);

    let info = client.request_log_info(true, &cancel).await.unwrap();
    assert_eq!(info.last_index, first, "no second append happened");

    node.shutdown();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_failover_keeps_request_id_idempotent() {
    let (mut nodes, dirs, peers) = start_cluster("failover").await;
    let leader_pos = wait_for_cluster_leader(&nodes).await;

    let client = ClusterClient::new(
        peers.peers.clone(),
        ClientOptions {
            request_timeout: Duration::from_millis(500),
            election_grace_delay: Duration::from_millis(100),
        },
    )
    .unwrap();
    let cancel = CancelToken::new();

    let rid = RequestId::generate();
    let first = client
        .request_update(rid, b"failover".to_vec(), &cancel)
        .await
        .unwrap();

    // Every peer must have applied the entry before the leader dies,
    // so the survivors remember the request id.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while nodes.iter().any(|n| n.raft().commit_index() < first) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "followers never committed the update"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The acknowledgment dies with the leader. Retransmit the same
    // request id, as a client whose first attempt never got a reply
    // would: the client sees the dead peer, clears its leader opinion,
    // and keeps retrying until it finds the new leader.
    let dead = nodes.remove(leader_pos);
    dead.shutdown();
    drop(dead);

    let second = tokio::time::timeout(
        Duration::from_secs(30),
        client.request_update(rid, b"failover".to_vec(), &cancel),
    )
    .await
    .expect("no new leader emerged")
    .unwrap();
    assert_eq!(
        second, first,
        "the new leader must answer with the originally committed index"
    );

    // The retransmission appended nothing: exactly one committed entry
    // carries the request id.
    let mut stream = client
        .request_entries(
            replog_core::EntriesRequest {
                from_index: 1,
                byte_budget: 0,
                count_limit: 0,
            },
            &cancel,
        )
        .await
        .unwrap();
    let mut appearances = 0;
    while let Some(item) = stream.next().await.unwrap() {
        if let replog_client::EntryStreamItem::Entry(entry) = item {
            if entry.request_id == rid {
                appearances += 1;
                assert_eq!(entry.index, first);
            }
        }
    }
    assert_eq!(appearances, 1);

    for node in &nodes {
        node.shutdown();
    }
    for dir in dirs {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publisher_url_requires_secret() {
    let (node, dir) = start_node("secret").await;
    let client = client_for(&node);
    let cancel = CancelToken::new();

    let url = client
        .request_publisher_url(SECRET, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(url, node.publisher_url());

    let err = client
        .request_publisher_url(b"wrong", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, replog_client::ClientError::AuthFailure));

    node.shutdown();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscriber_catch_up_and_live_tail() {
    let (node, dir) = start_node("catchup").await;
    let client = client_for(&node);
    let cancel = CancelToken::new();

    for i in 0..100u32 {
        client
            .request_update(RequestId::generate(), format!("e{}", i + 1).into_bytes(), &cancel)
            .await
            .unwrap();
    }

    let mut options = SubscriberOptions::new(SECRET);
    options.heartbeat_interval = Duration::from_millis(50);
    options.delivery_capacity = 16;
    let mut subscriber = Subscriber::connect(vec![node.self_peer()], options).unwrap();

    // The late joiner recovers 1..=100 over RPC, in order.
    let mut expected = 1u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while expected <= 100 {
        let item = tokio::time::timeout_at(deadline, subscriber.recv())
            .await
            .expect("catch-up stalled")
            .expect("subscriber closed");
        match item {
            SubscriberItem::Entry(entry) => {
                assert_eq!(entry.index, expected, "entries must be dense and ordered");
                assert_eq!(entry.payload, format!("e{}", expected).into_bytes());
                expected += 1;
            }
            SubscriberItem::Chunk(_) => panic!("no snapshot expected"),
        }
    }
    assert_eq!(subscriber.last_log_index(), 100);

    // Stale fired when the gap was noticed, Fresh once it closed.
    let mut saw_stale = false;
    let mut saw_fresh = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(500), subscriber.next_event()).await
    {
        match event {
            SubscriberEvent::Stale { gap } => {
                assert!(gap > 0);
                saw_stale = true;
            }
            SubscriberEvent::Fresh => {
                saw_fresh = true;
                break;
            }
            SubscriberEvent::Timeout => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(saw_stale, "expected a stale event for the gap");
    assert!(saw_fresh, "expected fresh after recovery");

    // Live tail: a new update arrives over the broadcast channel.
    let index = subscriber.send(b"tail".to_vec()).await.unwrap();
    assert_eq!(index, 101);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let item = tokio::time::timeout_at(deadline, subscriber.recv())
            .await
            .expect("live tail stalled")
            .expect("subscriber closed");
        if let SubscriberItem::Entry(entry) = item {
            assert_eq!(entry.index, 101);
            assert_eq!(entry.payload, b"tail");
            break;
        }
    }
    assert_eq!(subscriber.last_update_log_index(), 101);

    subscriber.close();
    node.shutdown();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_secret_is_fatal_to_subscriber() {
    let (node, dir) = start_node("authfail").await;

    let mut options = SubscriberOptions::new(b"not-the-secret".to_vec());
    options.heartbeat_interval = Duration::from_millis(50);
    let mut subscriber = Subscriber::connect(vec![node.self_peer()], options).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(10), subscriber.next_event())
        .await
        .expect("no event")
        .expect("subscriber closed");
    assert!(matches!(event, SubscriberEvent::Fatal(_)));

    node.shutdown();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_loses_nothing() {
    let (node, dir) = start_node("backpressure").await;
    let client = client_for(&node);
    let cancel = CancelToken::new();

    let mut options = SubscriberOptions::new(SECRET);
    options.heartbeat_interval = Duration::from_millis(50);
    options.delivery_capacity = 4;
    let mut subscriber = Subscriber::connect(vec![node.self_peer()], options).unwrap();

    // Start the pump and let it go fresh before writing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, subscriber.next_event())
            .await
            .expect("never went fresh")
            .expect("subscriber closed");
        if event == SubscriberEvent::Fresh {
            break;
        }
    }

    // Produce 50 entries while the consumer is not reading; the tiny
    // delivery channel forces the fan-out to pause.
    for i in 0..50u32 {
        client
            .request_update(RequestId::generate(), format!("p{}", i + 1).into_bytes(), &cancel)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Drain slowly: every entry arrives exactly once, in order.
    let mut expected = 1u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while expected <= 50 {
        let item = tokio::time::timeout_at(deadline, subscriber.recv())
            .await
            .expect("delivery stalled under backpressure")
            .expect("subscriber closed");
        if let SubscriberItem::Entry(entry) = item {
            assert_eq!(entry.index, expected, "no loss or reordering");
            expected += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    assert_eq!(subscriber.last_log_index(), 50);

    subscriber.close();
    node.shutdown();
    let _ = std::fs::remove_dir_all(dir);
}
