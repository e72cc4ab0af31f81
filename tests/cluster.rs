//! Multi-node replication scenarios.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

use p2psync::config::LogConfig;
use p2psync::executor::MemoryStore;
use p2psync::network::{MemoryNetwork, NetworkClient, NetworkServer, PeerClient};
use p2psync::oplog::{Operation, OperationLog, PostRecord};
use p2psync::replication::{EngineState, PeerService, ReplicationConfig, ReplicationEngine};
use p2psync::state::PeerAddress;
use p2psync::Error;

struct TestNode {
    address: PeerAddress,
    engine: Arc<ReplicationEngine>,
    store: Arc<MemoryStore>,
    _dir: TempDir,
}

fn fast_config() -> ReplicationConfig {
    ReplicationConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(50),
        failure_threshold: 3,
        ..ReplicationConfig::default()
    }
}

fn build_node(address: PeerAddress, client: Arc<dyn PeerClient>) -> TestNode {
    let dir = tempdir().unwrap();
    let log = OperationLog::open(
        dir.path(),
        LogConfig {
            fsync: false,
            compression: false,
        },
    )
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = ReplicationEngine::new(
        address.clone(),
        fast_config(),
        Arc::new(log),
        store.clone(),
        client,
    );

    TestNode {
        address,
        engine,
        store,
        _dir: dir,
    }
}

fn memory_node(network: &MemoryNetwork, port: u16) -> TestNode {
    let address = PeerAddress::new("10.0.0.1", port);
    let node = build_node(address.clone(), network.client(&address));
    network.register(address, PeerService::new(node.engine.clone()));
    node
}

fn post(id: i64, title: &str) -> Operation {
    Operation::PostCreated(PostRecord {
        id,
        title: title.to_string(),
        content: String::new(),
        author_id: 1,
        anonymous: false,
        upvotes: 0,
        downvotes: 0,
        created_at: Utc::now(),
    })
}

/// Poll `condition` until it holds or five seconds pass
async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7001);
    let b = memory_node(&network, 7002);

    a.engine.start(&[]).await.unwrap();
    assert_eq!(a.engine.state(), EngineState::Active);
    assert_eq!(a.engine.watermark(), 0);

    a.engine.broadcast(post(1, "op1")).await.unwrap();
    assert_eq!(a.engine.watermark(), 1);

    b.engine.start(&[a.address.clone()]).await.unwrap();
    assert_eq!(b.engine.state(), EngineState::Active);
    assert_eq!(b.engine.watermark(), 1);
    assert_eq!(b.store.applied().await, 1);
    assert_eq!(b.store.post(1).await.unwrap().title, "op1");

    assert!(a.engine.peers().contains(&b.address));
    assert!(b.engine.peers().contains(&a.address));

    // Live traffic after the join is pushed directly
    a.engine.broadcast(post(2, "op2")).await.unwrap();
    eventually("b to apply op2", || b.engine.watermark() == 2).await;
    assert_eq!(b.store.applied().await, 2);

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_catch_up_failure_is_fatal() {
    let network = MemoryNetwork::new();
    let b = memory_node(&network, 7012);
    let ghost = PeerAddress::new("10.0.0.1", 7999);

    let result = b.engine.start(&[ghost]).await;
    assert!(matches!(result, Err(Error::CatchUpFailed(_))));
    assert_ne!(b.engine.state(), EngineState::Active);
    assert!(matches!(
        b.engine.broadcast(post(1, "nope")).await,
        Err(Error::NotActive(_))
    ));

    b.engine.stop().await;
}

#[tokio::test]
async fn test_bootstrap_peers_tried_in_order() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7021);
    let b = memory_node(&network, 7022);
    let ghost = PeerAddress::new("10.0.0.1", 7999);

    a.engine.start(&[]).await.unwrap();
    a.engine.broadcast(post(1, "from a")).await.unwrap();

    b.engine.start(&[ghost.clone(), a.address.clone()]).await.unwrap();
    assert_eq!(b.engine.watermark(), 1);
    assert!(!b.engine.peers().contains(&ghost));

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_in_flight_submit_applied_after_removal() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7031);
    let b = memory_node(&network, 7032);

    a.engine.start(&[]).await.unwrap();
    b.engine.start(&[a.address.clone()]).await.unwrap();

    // B can no longer reach A, but A still reaches B
    network.cut(&b.address, &a.address);
    eventually("b to drop a", || !b.engine.peers().contains(&a.address)).await;

    a.engine.broadcast(post(1, "late")).await.unwrap();
    eventually("b to apply the entry", || b.engine.watermark() == 1).await;
    assert_eq!(b.store.applied().await, 1);
    assert!(!b.engine.peers().contains(&a.address));

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_crashed_peer_removed_and_stays_removed() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7041);
    let b = memory_node(&network, 7042);
    let c = memory_node(&network, 7043);

    a.engine.start(&[]).await.unwrap();
    b.engine.start(&[a.address.clone()]).await.unwrap();
    c.engine.start(&[a.address.clone()]).await.unwrap();
    assert!(a.engine.peers().contains(&c.address));
    assert!(b.engine.peers().contains(&c.address));

    network.unregister(&c.address);
    c.engine.stop().await;

    eventually("a to drop c", || !a.engine.peers().contains(&c.address)).await;
    eventually("b to drop c", || !b.engine.peers().contains(&c.address)).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!a.engine.peers().contains(&c.address));
    assert!(!b.engine.peers().contains(&c.address));
    assert!(a.engine.peers().contains(&b.address));

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_third_node_introduces_itself_to_everyone() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7051);
    let b = memory_node(&network, 7052);
    let c = memory_node(&network, 7053);

    a.engine.start(&[]).await.unwrap();
    b.engine.start(&[a.address.clone()]).await.unwrap();
    c.engine.start(&[a.address.clone()]).await.unwrap();

    assert_eq!(c.engine.peers().len(), 2);
    assert!(b.engine.peers().contains(&c.address));

    // A broadcast from C reaches both others
    c.engine.broadcast(post(1, "from c")).await.unwrap();
    eventually("a to apply", || a.engine.watermark() == 1).await;
    eventually("b to apply", || b.engine.watermark() == 1).await;

    for node in [&a, &b, &c] {
        node.engine.stop().await;
    }
}

#[tokio::test]
async fn test_peer_updates_propagate_membership() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7061);
    let b = memory_node(&network, 7062);
    let c = memory_node(&network, 7063);

    a.engine.start(&[]).await.unwrap();
    b.engine.start(&[a.address.clone()]).await.unwrap();

    // C cannot introduce itself to B, so B only learns of C through A
    network.cut(&c.address, &b.address);
    c.engine.start(&[a.address.clone()]).await.unwrap();

    eventually("b to learn of c", || b.engine.peers().contains(&c.address)).await;

    for node in [&a, &b, &c] {
        node.engine.stop().await;
    }
}

#[tokio::test]
async fn test_heartbeat_triggers_resync() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7071);
    let b = memory_node(&network, 7072);

    a.engine.start(&[]).await.unwrap();
    b.engine.start(&[a.address.clone()]).await.unwrap();

    // Broadcasts from A are lost, B's probes of A still work
    network.cut(&a.address, &b.address);
    a.engine.broadcast(post(1, "missed")).await.unwrap();
    a.engine.broadcast(post(2, "missed too")).await.unwrap();

    eventually("b to resync", || b.engine.watermark() == 2).await;
    assert_eq!(b.store.applied().await, 2);

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_background_tasks() {
    let network = MemoryNetwork::new();
    let a = memory_node(&network, 7081);
    let b = memory_node(&network, 7082);

    a.engine.start(&[]).await.unwrap();
    b.engine.start(&[a.address.clone()]).await.unwrap();
    assert_eq!(b.engine.detector().watched(), vec![a.address.clone()]);

    tokio::time::timeout(Duration::from_secs(2), b.engine.stop())
        .await
        .expect("stop should finish promptly");
    assert_eq!(b.engine.state(), EngineState::Stopped);
    assert!(b.engine.detector().watched().is_empty());
    assert!(matches!(
        b.engine.broadcast(post(1, "after stop")).await,
        Err(Error::ShuttingDown)
    ));

    a.engine.stop().await;
}

#[tokio::test]
async fn test_tcp_loopback_replication() {
    let client = || -> Arc<dyn PeerClient> {
        Arc::new(NetworkClient::new(
            Duration::from_millis(500),
            Duration::from_secs(2),
        ))
    };

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address_a = PeerAddress::new("127.0.0.1", listener_a.local_addr().unwrap().port());
    let address_b = PeerAddress::new("127.0.0.1", listener_b.local_addr().unwrap().port());

    let a = build_node(address_a, client());
    let b = build_node(address_b, client());

    let server_a = NetworkServer::from_listener(listener_a, PeerService::new(a.engine.clone())).unwrap();
    let server_b = NetworkServer::from_listener(listener_b, PeerService::new(b.engine.clone())).unwrap();
    let shutdown_a = server_a.shutdown_token();
    let shutdown_b = server_b.shutdown_token();
    let task_a = tokio::spawn(server_a.run());
    let task_b = tokio::spawn(server_b.run());

    a.engine.start(&[]).await.unwrap();
    for i in 1..=3 {
        a.engine.broadcast(post(i, "over tcp")).await.unwrap();
    }

    b.engine.start(&[a.address.clone()]).await.unwrap();
    assert_eq!(b.engine.watermark(), 3);
    assert!(b.engine.peers().contains(&a.address));
    assert!(a.engine.peers().contains(&b.address));

    a.engine.broadcast(post(4, "pushed")).await.unwrap();
    eventually("b to apply pushed entry", || b.engine.watermark() == 4).await;
    assert_eq!(b.store.applied().await, 4);

    a.engine.stop().await;
    b.engine.stop().await;
    shutdown_a.cancel();
    shutdown_b.cancel();
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();
}
