//! Test harness: in-process nodes wired with in-memory collaborators.

use alloy_primitives::U256;
use ember_network::{Host, HostConfig};
use ember_sync::{MemoryBlockQueue, MemoryChain, MemoryTxPool, SyncCapability};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared genesis payload so harness nodes agree on the chain root.
pub const TEST_GENESIS: &str = "ember-test-genesis";

/// Network id every harness node runs on.
pub const TEST_NETWORK: u64 = 99;

/// A complete in-process node: host, sync capability and collaborators.
pub struct TestNode {
    pub host: Arc<Host>,
    pub chain: Arc<MemoryChain>,
    pub pool: Arc<MemoryTxPool>,
    pub queue: Arc<MemoryBlockQueue>,
    pub sync: Arc<SyncCapability>,
}

impl TestNode {
    /// Start a node with `blocks` blocks on top of the shared genesis.
    pub async fn start(blocks: u64) -> TestNode {
        Self::start_with_ideal(blocks, 4).await
    }

    /// Start a node with a chosen ideal peer count.
    pub async fn start_with_ideal(blocks: u64, ideal: usize) -> TestNode {
        let chain = Arc::new(MemoryChain::new(TEST_GENESIS));
        for i in 0..blocks {
            chain.extend_head(format!("block {}", i).into_bytes());
        }
        let pool = Arc::new(MemoryTxPool::new());
        let queue = Arc::new(MemoryBlockQueue::new(chain.clone()));
        let sync = Arc::new(SyncCapability::new(
            U256::from(TEST_NETWORK),
            chain.clone(),
            pool.clone(),
            queue.clone(),
        ));

        let mut host = Host::new(HostConfig {
            listen_port: 0,
            public_ip: String::new(),
            upnp: false,
            local_networking: true,
            ideal_peer_count: ideal,
            client_version: "ember-test/0.1.0".to_string(),
        })
        .expect("host requires a network interface");
        host.register_capability(sync.clone());
        let host = Arc::new(host);
        host.start().await.expect("bind an ephemeral port");

        TestNode {
            host,
            chain,
            pool,
            queue,
            sync,
        }
    }

    /// The ephemeral port this node listens on.
    pub fn port(&self) -> u16 {
        self.host.listen_port()
    }

    /// Dial another harness node over loopback.
    pub async fn connect_to(&self, other: &TestNode) {
        self.host.connect("127.0.0.1", other.port()).await;
    }

    pub async fn stop(&self) {
        self.host.stop().await;
    }
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
