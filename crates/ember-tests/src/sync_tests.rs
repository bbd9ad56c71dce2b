//! End-to-end chain synchronization and gossip scenarios.

use crate::harness::{wait_until, TestNode};
use bytes::Bytes;
use ember_sync::{Block, BlockQueue, Chain, SyncMode, TxPool};
use std::time::Duration;

#[tokio::test]
async fn test_sync_hundred_blocks() {
    let a = TestNode::start(100).await;
    let b = TestNode::start(0).await;
    assert_eq!(a.chain.head_number(), 100);
    assert_eq!(b.chain.head_number(), 0);

    b.connect_to(&a).await;

    assert!(
        wait_until(Duration::from_secs(10), || b.chain.head_number() == 100).await,
        "b never caught up"
    );
    assert_eq!(b.chain.head_hash(), a.chain.head_hash());

    // Exactly one hundred bodies reached the queue, none duplicated,
    // each on A's canonical chain.
    let received = b.queue.received();
    assert_eq!(received.len(), 100);
    let mut dedup = received.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(dedup.len(), 100);
    for hash in &received {
        assert!(a.chain.contains(hash));
    }

    // The round is over; the coordinator settles back to Idle.
    assert!(
        wait_until(Duration::from_secs(2), || b.sync.mode() == SyncMode::Idle).await
    );
    assert!(b.sync.download().is_complete());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_sync_from_behind() {
    // B already has a prefix of the chain; only the difference moves.
    let a = TestNode::start(40).await;
    let b = TestNode::start(0).await;
    // Replay A's first 25 blocks into B.
    let mut prefix = Vec::new();
    let mut cursor = a.chain.head_hash();
    for _ in 0..40 {
        let body = a.chain.block_body(&cursor).unwrap();
        let block = Block::decode_body(&body).unwrap();
        prefix.push(body);
        cursor = block.parent;
    }
    prefix.reverse();
    for body in &prefix[..25] {
        b.queue.import(body.clone()).unwrap();
    }
    assert_eq!(b.chain.head_number(), 25);
    let already = b.queue.received().len();

    b.connect_to(&a).await;
    assert!(
        wait_until(Duration::from_secs(10), || b.chain.head_number() == 40).await,
        "b never caught up"
    );
    assert_eq!(b.chain.head_hash(), a.chain.head_hash());

    // Only the missing suffix was fetched.
    assert_eq!(b.queue.received().len() - already, 15);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_transaction_gossip() {
    let a = TestNode::start(0).await;
    let b = TestNode::start(0).await;
    b.connect_to(&a).await;
    assert!(wait_until(Duration::from_secs(2), || a.host.peer_count() == 1).await);

    a.pool.import(Bytes::from_static(b"signed-tx-payload"));

    assert!(
        wait_until(Duration::from_secs(3), || b.pool.len() == 1).await,
        "transaction never reached b"
    );

    // And it does not bounce back and forth.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(a.pool.len(), 1);
    assert_eq!(b.pool.len(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_new_block_propagates() {
    let a = TestNode::start(3).await;
    let b = TestNode::start(0).await;
    b.connect_to(&a).await;

    assert!(
        wait_until(Duration::from_secs(5), || b.chain.head_number() == 3).await,
        "initial sync failed"
    );

    // A mines a block; gossip carries it over without a new round.
    a.chain.extend_head("freshly mined".as_bytes().to_vec());

    assert!(
        wait_until(Duration::from_secs(3), || b.chain.head_number() == 4).await,
        "new block never propagated"
    );
    assert_eq!(b.chain.head_hash(), a.chain.head_hash());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_sync_spreads_over_peers() {
    // A chain longer than one lease: with two seeded peers the second
    // one picks up the range beyond the first peer's 256-block lease.
    let a = TestNode::start(300).await;
    let b = TestNode::start(0).await;
    b.connect_to(&a).await;
    assert!(
        wait_until(Duration::from_secs(15), || b.chain.head_number() == 300).await,
        "b never caught up"
    );

    let c = TestNode::start(0).await;
    c.connect_to(&a).await;
    c.connect_to(&b).await;
    assert!(
        wait_until(Duration::from_secs(2), || c.host.peer_count() == 2).await,
        "c failed to pair with both"
    );

    assert!(
        wait_until(Duration::from_secs(15), || c.chain.head_number() == 300).await,
        "c never caught up"
    );
    assert_eq!(c.chain.head_hash(), a.chain.head_hash());
    assert_eq!(c.queue.received().len(), 300);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}
