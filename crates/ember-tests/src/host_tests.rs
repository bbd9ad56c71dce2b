//! Host lifecycle scenarios: startup, handshake, pruning, persistence,
//! and hostile wire input.

use crate::harness::{wait_until, TestNode};
use ember_network::{FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, SYNC_BYTES};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_solo_start() {
    let node = TestNode::start(0).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(node.host.is_running());
    assert_ne!(node.port(), 0);
    assert!(node.host.peers(false).await.is_empty());

    // With no peers the potential set is at most ourselves.
    let potential = node.host.potential_peers();
    assert!(potential.len() <= 1);
    if let Some(spec) = potential.first() {
        assert_eq!(spec.id, node.host.node_id());
    }

    node.stop().await;
}

#[tokio::test]
async fn test_two_host_handshake() {
    let a = TestNode::start(0).await;
    let b = TestNode::start(0).await;

    b.connect_to(&a).await;

    let connected = wait_until(Duration::from_secs(2), || {
        a.host.peer_count() == 1 && b.host.peer_count() == 1
    })
    .await;
    assert!(connected, "hosts failed to pair up");

    let a_peers = a.host.peers(false).await;
    let b_peers = b.host.peers(false).await;
    assert_eq!(a_peers.len(), 1);
    assert_eq!(b_peers.len(), 1);
    assert_eq!(a_peers[0].id, b.host.node_id());
    assert_eq!(b_peers[0].id, a.host.node_id());

    assert!(a.host.have_peer(b.host.node_id()));
    assert!(b.host.have_peer(a.host.node_id()));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_duplicate_connection_is_refused() {
    let a = TestNode::start(0).await;
    let b = TestNode::start(0).await;

    b.connect_to(&a).await;
    assert!(
        wait_until(Duration::from_secs(2), || a.host.peer_count() == 1).await,
        "first connection"
    );

    // A second dial from the same node id must not produce a second
    // session.
    b.connect_to(&a).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.host.peer_count(), 1);
    assert_eq!(b.host.peer_count(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_ping_roundtrip() {
    let a = TestNode::start(0).await;
    let b = TestNode::start(0).await;
    b.connect_to(&a).await;
    assert!(wait_until(Duration::from_secs(2), || a.host.peer_count() == 1).await);

    // peers(update_ping) pings everyone and waits for the pongs.
    let peers = a.host.peers(true).await;
    assert_eq!(peers.len(), 1);
    assert!(peers[0].last_ping.is_some());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_prune_to_ideal_keeps_earliest() {
    let hub = TestNode::start_with_ideal(0, 4).await;

    // Ten clients, each content with its single connection. Create them
    // all up front so the connect sequence itself is tight.
    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(TestNode::start_with_ideal(0, 1).await);
    }
    let mut order = Vec::new();
    for client in &clients {
        let before = hub.host.peer_count();
        client.connect_to(&hub).await;
        assert!(
            wait_until(Duration::from_secs(2), || {
                hub.host.peer_count() > before
            })
            .await,
            "client failed to connect"
        );
        order.push(client.host.node_id());
    }
    assert_eq!(hub.host.peer_count(), 10);

    // Maintenance prunes down to the ideal once the sessions age.
    assert!(
        wait_until(Duration::from_secs(10), || hub.host.peer_count() <= 4).await,
        "hub never pruned"
    );
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(hub.host.peer_count() <= 4);

    // Equal ratings: the earliest-connected four survive.
    let survivors: Vec<_> = hub
        .host
        .peers(false)
        .await
        .iter()
        .map(|p| p.id)
        .collect();
    for id in &survivors {
        assert!(order[..4].contains(id), "unexpected survivor");
    }

    for client in &clients {
        client.stop().await;
    }
    hub.stop().await;
}

#[tokio::test]
async fn test_save_restore_peers() {
    let hub = TestNode::start(0).await;
    let mut clients = Vec::new();
    for _ in 0..5 {
        let client = TestNode::start_with_ideal(0, 1).await;
        let before = hub.host.peer_count();
        client.connect_to(&hub).await;
        assert!(
            wait_until(Duration::from_secs(2), || {
                hub.host.peer_count() > before
            })
            .await
        );
        clients.push(client);
    }

    let blob = hub.host.save_peers();
    hub.stop().await;

    // A fresh host ingests the list and starts dialing the entries.
    let fresh = TestNode::start_with_ideal(0, 8).await;
    fresh.host.restore_peers(&blob).unwrap();

    let expected: Vec<_> = clients.iter().map(|c| c.host.node_id()).collect();
    let remembered = fresh.host.incoming_peers();
    assert_eq!(remembered.len(), 5);
    for (id, _, _) in &remembered {
        assert!(expected.contains(id));
    }

    // After the network goes idle every remembered peer has been tried.
    assert!(
        wait_until(Duration::from_secs(5), || {
            fresh
                .host
                .incoming_peers()
                .iter()
                .all(|(_, _, attempts)| *attempts >= 1)
        })
        .await,
        "restored peers never dialed"
    );
    assert!(
        wait_until(Duration::from_secs(5), || fresh.host.peer_count() == 5).await,
        "restored peers never connected"
    );

    for client in &clients {
        client.stop().await;
    }
    fresh.stop().await;
}

#[tokio::test]
async fn test_garbage_header_disconnects() {
    let node = TestNode::start(0).await;

    // Valid sync bytes but an oversize length: the session must drop us.
    let mut stream = TcpStream::connect(("127.0.0.1", node.port())).await.unwrap();
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[..4].copy_from_slice(&SYNC_BYTES);
    header[4..].copy_from_slice(&((MAX_FRAME_PAYLOAD as u32 + 1).to_be_bytes()));
    stream.write_all(&header).await.unwrap();

    let mut sink = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut sink)).await;
    assert!(closed.is_ok(), "session kept the socket open");
    assert_eq!(node.host.peer_count(), 0);

    // Bad magic likewise.
    let mut stream = TcpStream::connect(("127.0.0.1", node.port())).await.unwrap();
    stream.write_all(&[0u8; FRAME_HEADER_SIZE]).await.unwrap();
    let mut sink = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut sink)).await;
    assert!(closed.is_ok(), "session kept the socket open");
    assert_eq!(node.host.peer_count(), 0);

    node.stop().await;
}
