//! The chain-synchronization coordinator.
//!
//! Host-resident singleton driving the per-peer state machines: elects a
//! single hash-chain source, hands out body leases, gossips transactions
//! and fresh blocks, and drains the incoming queues on the host's
//! maintenance tick. Shared state is guarded per structure; the lock
//! order is mode, then a peer, then the download ledger.

use crate::chain::{content_hash, BlockQueue, Chain, TxPool};
use crate::download::{DownloadManager, NoteResult};
use crate::messages::{
    ChainMessage, Status, MAX_BODIES_SEND, MAX_HASHES_ASK, MAX_HASHES_SEND, PACKET_COUNT,
};
use crate::peer::{PeerState, SyncPeer, MAX_HASH_CHAIN};
use crate::{SyncError, SyncResult};
use alloy_primitives::{B256, U256};
use bytes::Bytes;
use dashmap::DashMap;
use ember_network::{
    Capability, NetworkResult, NodeId, PeerCapability, PeerLink,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name advertised in the Hello exchange.
pub const CAPABILITY_NAME: &str = "emb";

/// What the coordinator is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Nothing in flight.
    Idle,
    /// Collecting the hash chain from the elected source.
    Hashes,
    /// Fetching bodies for a chain we organized.
    Chain,
    /// Fetching bodies for a chain whose source is gone.
    ChainHelper,
    /// Reserved.
    State,
}

struct ModeState {
    mode: SyncMode,
    /// The elected hash-chain source, while one exists.
    source: Option<NodeId>,
}

/// The chain capability registered at the host.
pub struct SyncCapability {
    shared: Arc<SyncShared>,
}

struct SyncShared {
    network_id: U256,
    chain: Arc<dyn Chain>,
    tx_pool: Arc<dyn TxPool>,
    block_queue: Arc<dyn BlockQueue>,
    download: DownloadManager,
    mode: Mutex<ModeState>,
    peers: DashMap<NodeId, Arc<Mutex<SyncPeer>>>,
    /// Transactions received from peers, awaiting the pool.
    incoming_transactions: Mutex<Vec<Bytes>>,
    /// Gossiped bodies awaiting the block queue.
    incoming_blocks: Mutex<Vec<Bytes>>,
    /// Head hash last announced to peers.
    latest_block_sent: Mutex<Option<B256>>,
}

impl SyncCapability {
    pub fn new(
        network_id: U256,
        chain: Arc<dyn Chain>,
        tx_pool: Arc<dyn TxPool>,
        block_queue: Arc<dyn BlockQueue>,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                network_id,
                download: DownloadManager::new(block_queue.clone()),
                chain,
                tx_pool,
                block_queue,
                mode: Mutex::new(ModeState {
                    mode: SyncMode::Idle,
                    source: None,
                }),
                peers: DashMap::new(),
                incoming_transactions: Mutex::new(Vec::new()),
                incoming_blocks: Mutex::new(Vec::new()),
                latest_block_sent: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.shared.mode.lock().mode
    }

    /// Actively downloading a chain.
    pub fn is_syncing(&self) -> bool {
        matches!(self.mode(), SyncMode::Hashes | SyncMode::Chain | SyncMode::ChainHelper)
    }

    pub fn download(&self) -> &DownloadManager {
        &self.shared.download
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }
}

impl Capability for SyncCapability {
    fn name(&self) -> &str {
        CAPABILITY_NAME
    }

    fn packet_count(&self) -> u8 {
        PACKET_COUNT
    }

    fn on_starting(&self) {
        info!(network = %self.shared.network_id, "Chain sync starting");
    }

    fn on_stopping(&self) {
        info!("Chain sync stopping");
    }

    fn tick(&self) {
        self.shared.tick();
    }

    fn new_peer(&self, link: PeerLink) -> Box<dyn PeerCapability> {
        let id = link.node_id();
        let peer = Arc::new(Mutex::new(SyncPeer::new(link)));
        self.shared.peers.insert(id, peer.clone());
        Box::new(SyncPeerHandler {
            shared: self.shared.clone(),
            peer,
            id,
        })
    }
}

/// Session-side handler delegating into the shared coordinator.
struct SyncPeerHandler {
    shared: Arc<SyncShared>,
    peer: Arc<Mutex<SyncPeer>>,
    id: NodeId,
}

impl PeerCapability for SyncPeerHandler {
    fn on_connected(&mut self) -> NetworkResult<()> {
        self.peer
            .lock()
            .send_status(self.shared.chain.as_ref(), self.shared.network_id);
        Ok(())
    }

    fn on_packet(&mut self, opcode: u8, body: &[u8]) -> NetworkResult<()> {
        let message = ChainMessage::decode(opcode, body)?;
        self.shared.on_message(&self.peer, message)?;
        Ok(())
    }

    fn on_disconnected(&mut self) {
        self.shared.peer_departed(self.id, &self.peer);
    }
}

impl SyncShared {
    fn on_message(&self, peer: &Arc<Mutex<SyncPeer>>, message: ChainMessage) -> SyncResult<()> {
        match message {
            ChainMessage::Status(status) => self.on_status(peer, status),
            ChainMessage::GetBlockHashes { from, max } => {
                let count = (max as usize).min(MAX_HASHES_SEND);
                let hashes = self.chain.ancestors(&from, count);
                peer.lock().send(&ChainMessage::BlockHashes(hashes));
                Ok(())
            }
            ChainMessage::BlockHashes(hashes) => self.on_block_hashes(peer, hashes),
            ChainMessage::GetBlocks(hashes) => {
                let bodies: Vec<Bytes> = hashes
                    .iter()
                    .take(MAX_BODIES_SEND)
                    .filter_map(|h| self.chain.block_body(h))
                    .collect();
                peer.lock().send(&ChainMessage::Blocks(bodies));
                Ok(())
            }
            ChainMessage::Blocks(bodies) => self.on_blocks(peer, bodies),
            ChainMessage::Transactions(txs) => {
                let mut p = peer.lock();
                let mut incoming = self.incoming_transactions.lock();
                for tx in txs {
                    // The sender obviously has it; never echo it back.
                    p.txs_sent.insert(content_hash(&tx));
                    incoming.push(tx);
                }
                Ok(())
            }
            ChainMessage::NewBlock {
                block,
                total_difficulty,
            } => self.on_new_block(peer, block, total_difficulty),
            ChainMessage::NewBlockHashes(hashes) => self.on_new_block_hashes(peer, hashes),
        }
    }

    fn on_status(&self, peer: &Arc<Mutex<SyncPeer>>, status: Status) -> SyncResult<()> {
        if status.network_id != self.network_id {
            return Err(SyncError::WrongNetwork {
                ours: self.network_id.to_string(),
                theirs: status.network_id.to_string(),
            });
        }
        if status.genesis_hash != self.chain.genesis_hash() {
            return Err(SyncError::WrongGenesis);
        }

        {
            let mut p = peer.lock();
            if p.state != PeerState::New {
                return Err(SyncError::BadPacket("unexpected status".into()));
            }
            p.total_difficulty = status.total_difficulty;
            p.best_hash = status.best_hash;
            p.state = PeerState::GotStatus;
            info!(
                peer = %p.node_id(),
                td = %status.total_difficulty,
                version = status.protocol_version,
                "Peer status"
            );
        }

        self.consider_peer(peer);
        Ok(())
    }

    /// A peer just became available for work; put it to use under the
    /// current mode.
    fn consider_peer(&self, peer: &Arc<Mutex<SyncPeer>>) {
        let mut mode = self.mode.lock();
        match mode.mode {
            SyncMode::Idle => {
                let mut p = peer.lock();
                if p.state == PeerState::GotStatus
                    && p.total_difficulty > self.chain.total_difficulty()
                {
                    mode.mode = SyncMode::Hashes;
                    mode.source = Some(p.node_id());
                    p.start_hash_chain();
                }
            }
            SyncMode::Chain | SyncMode::ChainHelper => {
                let mut p = peer.lock();
                if p.state == PeerState::GotStatus {
                    p.continue_blocks(&self.download);
                }
            }
            _ => {}
        }
    }

    fn on_block_hashes(&self, peer: &Arc<Mutex<SyncPeer>>, hashes: Vec<B256>) -> SyncResult<()> {
        let mut mode = self.mode.lock();
        let mut p = peer.lock();
        if mode.mode != SyncMode::Hashes
            || mode.source != Some(p.node_id())
            || p.state != PeerState::AskingHashes
        {
            // Stale or unsolicited reply; harmless.
            return Ok(());
        }

        let mut complete = hashes.len() < MAX_HASHES_ASK as usize;
        for hash in &hashes {
            if self.chain.contains(hash) {
                complete = true;
                break;
            }
            p.hash_chain.push(*hash);
            if p.hash_chain.len() > MAX_HASH_CHAIN {
                warn!(peer = %p.node_id(), "Hash chain too long, abandoning source");
                p.hash_chain.clear();
                p.rate(-8);
                p.go_idle(&self.download);
                mode.mode = SyncMode::Idle;
                mode.source = None;
                return Ok(());
            }
        }

        if !complete {
            p.continue_hash_chain();
            return Ok(());
        }

        let mut collected: Vec<B256> = std::mem::take(&mut p.hash_chain);
        collected.reverse(); // earliest unknown block first
        collected.retain(|h| !self.chain.contains(h));
        info!(peer = %p.node_id(), blocks = collected.len(), "Hash chain collected");

        self.download.reset_to_chain(collected);
        mode.mode = SyncMode::Chain;
        p.asked_at = None;
        p.continue_blocks(&self.download);
        drop(p);

        // A new round: parked peers become eligible again.
        self.handout_leases(true);
        Ok(())
    }

    fn on_blocks(&self, peer: &Arc<Mutex<SyncPeer>>, bodies: Vec<Bytes>) -> SyncResult<()> {
        let mut p = peer.lock();
        if p.state != PeerState::AskingBlocks {
            // Unsolicited bodies are gossip; hand them to the queue.
            drop(p);
            self.incoming_blocks.lock().extend(bodies);
            return Ok(());
        }

        if bodies.is_empty() {
            debug!(peer = %p.node_id(), "Peer is out of blocks for this round");
            p.go_idle(&self.download);
            return Ok(());
        }

        let mut taken = 0i32;
        let mut bad = 0i32;
        let mut gossip = Vec::new();
        for body in &bodies {
            let hash = content_hash(body);
            p.blocks_known.insert(hash);
            match self.download.note_block(hash, body) {
                NoteResult::Taken => taken += 1,
                // Outside the fetch: still handed to the queue.
                NoteResult::NotNeeded => gossip.push(body.clone()),
                NoteResult::Bad => bad += 1,
            }
        }
        if taken > 0 {
            p.rate(taken);
        }
        if bad > 0 {
            p.rate(-8 * bad);
        }
        if !gossip.is_empty() {
            self.incoming_blocks.lock().extend(gossip);
        }

        if self.download.is_complete() {
            p.asked_at = None;
            drop(p);
            self.finish_round();
        } else {
            p.continue_blocks(&self.download);
        }
        Ok(())
    }

    fn on_new_block(
        &self,
        peer: &Arc<Mutex<SyncPeer>>,
        block: Bytes,
        total_difficulty: U256,
    ) -> SyncResult<()> {
        let hash = content_hash(&block);
        {
            let mut p = peer.lock();
            p.blocks_known.insert(hash);
            if total_difficulty > p.total_difficulty {
                p.total_difficulty = total_difficulty;
                p.best_hash = hash;
            }
        }
        if !self.block_queue.is_known(&hash) {
            self.incoming_blocks.lock().push(block);
        }
        Ok(())
    }

    fn on_new_block_hashes(
        &self,
        peer: &Arc<Mutex<SyncPeer>>,
        hashes: Vec<B256>,
    ) -> SyncResult<()> {
        let mut p = peer.lock();
        p.blocks_known.extend(hashes.iter().copied());
        let unknown: Vec<B256> = hashes
            .into_iter()
            .filter(|h| !self.chain.contains(h) && !self.block_queue.is_known(h))
            .take(MAX_BODIES_SEND)
            .collect();
        if !unknown.is_empty() {
            debug!(peer = %p.node_id(), count = unknown.len(), "Fetching announced blocks");
            p.send(&ChainMessage::GetBlocks(unknown));
        }
        Ok(())
    }

    fn peer_departed(&self, id: NodeId, peer: &Arc<Mutex<SyncPeer>>) {
        self.peers.remove(&id);
        self.download.peer_gone(id);
        {
            let mut mode = self.mode.lock();
            if mode.source == Some(id) {
                mode.source = None;
                match mode.mode {
                    // Mid-election: pick a new source on the next tick.
                    SyncMode::Hashes => mode.mode = SyncMode::Idle,
                    // Mid-download: keep draining the adopted chain.
                    SyncMode::Chain => mode.mode = SyncMode::ChainHelper,
                    _ => {}
                }
            }
        }
        peer.lock().state = PeerState::Disconnected;
        debug!(peer = %id, "Sync peer departed");
    }

    /// One maintenance pass, run from the host worker.
    fn tick(&self) {
        self.drain_incoming();
        self.check_timeouts();
        self.continue_sync();
        self.maintain_transactions();
        self.maintain_blocks();
    }

    fn drain_incoming(&self) {
        let txs: Vec<Bytes> = std::mem::take(&mut *self.incoming_transactions.lock());
        for tx in txs {
            self.tx_pool.import(tx);
        }

        let blocks: Vec<Bytes> = std::mem::take(&mut *self.incoming_blocks.lock());
        for body in blocks {
            if let Err(e) = self.block_queue.import(body) {
                debug!(error = %e, "Dropping gossiped block");
            }
        }
    }

    fn check_timeouts(&self) {
        let mut lost_source = None;
        for entry in self.peers.iter() {
            let mut p = entry.value().lock();
            if p.timed_out() {
                warn!(peer = %p.node_id(), state = ?p.state, "Request timed out");
                p.rate(-1);
                if p.state == PeerState::AskingHashes {
                    lost_source = Some(p.node_id());
                    p.hash_chain.clear();
                }
                p.go_idle(&self.download);
            }
        }

        if let Some(id) = lost_source {
            let mut mode = self.mode.lock();
            if mode.mode == SyncMode::Hashes && mode.source == Some(id) {
                mode.mode = SyncMode::Idle;
                mode.source = None;
            }
        }
    }

    fn continue_sync(&self) {
        let mode_now = self.mode.lock().mode;
        match mode_now {
            SyncMode::Idle => self.elect_source(),
            SyncMode::Chain | SyncMode::ChainHelper => {
                if self.download.is_complete() {
                    self.finish_round();
                } else {
                    self.handout_leases(false);
                    // Every fetcher bowed out while blocks are still
                    // needed: restart the round with the parked peers.
                    if !self.any_fetching() {
                        self.handout_leases(true);
                    }
                }
            }
            _ => {}
        }
    }

    fn any_fetching(&self) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.value().lock().state == PeerState::AskingBlocks)
    }

    /// Pick the peer claiming the highest total difficulty above ours and
    /// make it the hash-chain source.
    fn elect_source(&self) {
        let local_td = self.chain.total_difficulty();
        let mut best: Option<(U256, Arc<Mutex<SyncPeer>>)> = None;
        for entry in self.peers.iter() {
            let p = entry.value().lock();
            if matches!(p.state, PeerState::GotStatus | PeerState::Idle)
                && p.total_difficulty > local_td
                && best.as_ref().map_or(true, |(td, _)| p.total_difficulty > *td)
            {
                best = Some((p.total_difficulty, entry.value().clone()));
            }
        }

        let Some((_, peer)) = best else { return };
        let mut mode = self.mode.lock();
        if mode.mode != SyncMode::Idle {
            return;
        }
        let mut p = peer.lock();
        if !matches!(p.state, PeerState::GotStatus | PeerState::Idle)
            || p.total_difficulty <= local_td
        {
            return;
        }
        mode.mode = SyncMode::Hashes;
        mode.source = Some(p.node_id());
        p.start_hash_chain();
    }

    /// Put available peers to work on the current chain. Idle peers only
    /// rejoin when a new round starts.
    fn handout_leases(&self, include_idle: bool) {
        for entry in self.peers.iter() {
            let mut p = entry.value().lock();
            let eligible = p.state == PeerState::GotStatus
                || (include_idle && p.state == PeerState::Idle);
            if eligible {
                p.continue_blocks(&self.download);
            }
        }
    }

    /// The need set is empty: back to Idle, everyone re-eligible.
    fn finish_round(&self) {
        {
            let mut mode = self.mode.lock();
            if !matches!(mode.mode, SyncMode::Chain | SyncMode::ChainHelper) {
                return;
            }
            mode.mode = SyncMode::Idle;
            mode.source = None;
        }
        info!(head = %self.chain.head_hash(), "Chain download complete");

        for entry in self.peers.iter() {
            let mut p = entry.value().lock();
            if matches!(p.state, PeerState::AskingBlocks | PeerState::Idle) {
                p.state = PeerState::GotStatus;
                p.asked_at = None;
            }
        }
    }

    /// Send every peer the pool transactions it has not seen from us.
    fn maintain_transactions(&self) {
        let pending = self.tx_pool.pending();
        if pending.is_empty() {
            return;
        }

        for entry in self.peers.iter() {
            let mut p = entry.value().lock();
            if matches!(p.state, PeerState::New | PeerState::Disconnected) {
                continue;
            }
            let unsent: Vec<(B256, Bytes)> = pending
                .iter()
                .filter(|(hash, _)| !p.txs_sent.contains(hash))
                .cloned()
                .collect();
            if unsent.is_empty() {
                continue;
            }
            p.send(&ChainMessage::Transactions(
                unsent.iter().map(|(_, tx)| tx.clone()).collect(),
            ));
            p.txs_sent.extend(unsent.into_iter().map(|(hash, _)| hash));
        }
    }

    /// Announce a new head to every peer that has not seen it.
    fn maintain_blocks(&self) {
        let head = self.chain.head_hash();
        {
            let mut sent = self.latest_block_sent.lock();
            match *sent {
                // First pass records the current head without announcing.
                None => {
                    *sent = Some(head);
                    return;
                }
                Some(previous) if previous == head => return,
                _ => *sent = Some(head),
            }
        }

        let Some(body) = self.chain.block_body(&head) else {
            return;
        };
        let total_difficulty = self.chain.total_difficulty();
        let mut announced = 0;
        for entry in self.peers.iter() {
            let mut p = entry.value().lock();
            if matches!(p.state, PeerState::New | PeerState::Disconnected) {
                continue;
            }
            if p.blocks_known.insert(head) {
                p.send(&ChainMessage::NewBlock {
                    block: body.clone(),
                    total_difficulty,
                });
                announced += 1;
            }
        }
        if announced > 0 {
            debug!(head = %head, peers = announced, "Announced new head");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Block, MemoryBlockQueue, MemoryChain, MemoryTxPool};
    use crate::messages::CHAIN_PROTOCOL_VERSION;
    use ember_network::{DisconnectReason, Message, PacketSink, CAPABILITY_OFFSET};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    const BASE: u8 = CAPABILITY_OFFSET;

    /// Channel-backed sink standing in for a live session.
    #[derive(Default)]
    struct TestSink {
        sent: PlMutex<Vec<Bytes>>,
        open: AtomicBool,
        rating: AtomicI32,
        disconnect: PlMutex<Option<DisconnectReason>>,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            let sink = Self::default();
            sink.open.store(true, Ordering::Relaxed);
            Arc::new(sink)
        }

        /// Decode and drain everything queued so far.
        fn drain(&self) -> Vec<ChainMessage> {
            self.sent
                .lock()
                .drain(..)
                .map(|payload| match Message::decode(&payload).unwrap() {
                    Message::Capability { opcode, body } => {
                        ChainMessage::decode(opcode - BASE, &body).unwrap()
                    }
                    other => panic!("control packet from capability: {:?}", other),
                })
                .collect()
        }
    }

    impl PacketSink for TestSink {
        fn send_packet(&self, payload: Bytes) -> bool {
            self.sent.lock().push(payload);
            true
        }

        fn disconnect(&self, reason: DisconnectReason) {
            self.open.store(false, Ordering::Relaxed);
            *self.disconnect.lock() = Some(reason);
        }

        fn rate(&self, delta: i32) {
            self.rating.fetch_add(delta, Ordering::Relaxed);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Relaxed)
        }
    }

    struct Fixture {
        chain: Arc<MemoryChain>,
        pool: Arc<MemoryTxPool>,
        queue: Arc<MemoryBlockQueue>,
        cap: SyncCapability,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MemoryChain::new("genesis"));
        let pool = Arc::new(MemoryTxPool::new());
        let queue = Arc::new(MemoryBlockQueue::new(chain.clone()));
        let cap = SyncCapability::new(
            U256::from(42),
            chain.clone(),
            pool.clone(),
            queue.clone(),
        );
        Fixture {
            chain,
            pool,
            queue,
            cap,
        }
    }

    fn connect_peer(
        f: &Fixture,
        sink: &Arc<TestSink>,
    ) -> (NodeId, Box<dyn PeerCapability>) {
        let id = NodeId::random();
        let link = PeerLink::new(id, BASE, sink.clone() as Arc<dyn PacketSink>);
        let mut handler = f.cap.new_peer(link);
        handler.on_connected().unwrap();
        (id, handler)
    }

    /// Route a message through the wire layers into the handler, the way
    /// a session would.
    fn deliver(handler: &mut Box<dyn PeerCapability>, msg: &ChainMessage) -> NetworkResult<()> {
        let payload = msg.encode(BASE);
        match Message::decode(&payload).unwrap() {
            Message::Capability { opcode, body } => handler.on_packet(opcode - BASE, &body),
            other => panic!("not a capability packet: {:?}", other),
        }
    }

    fn remote_status(remote: &MemoryChain) -> ChainMessage {
        ChainMessage::Status(Status {
            protocol_version: CHAIN_PROTOCOL_VERSION,
            network_id: U256::from(42),
            total_difficulty: remote.total_difficulty(),
            best_hash: remote.head_hash(),
            genesis_hash: remote.genesis_hash(),
        })
    }

    #[test]
    fn test_status_exchange_elects_source() {
        let f = fixture();
        let remote = MemoryChain::new("genesis");
        for i in 0..3 {
            remote.extend_head(format!("r{}", i).into_bytes());
        }

        let sink = TestSink::new();
        let (_, mut handler) = connect_peer(&f, &sink);

        // Our own Status goes out first.
        let sent = sink.drain();
        assert!(matches!(sent.as_slice(), [ChainMessage::Status(_)]));
        assert_eq!(f.cap.mode(), SyncMode::Idle);

        deliver(&mut handler, &remote_status(&remote)).unwrap();
        assert_eq!(f.cap.mode(), SyncMode::Hashes);

        match sink.drain().as_slice() {
            [ChainMessage::GetBlockHashes { from, max }] => {
                assert_eq!(*from, remote.head_hash());
                assert_eq!(*max, MAX_HASHES_ASK);
            }
            other => panic!("expected GetBlockHashes, got {:?}", other),
        }
    }

    #[test]
    fn test_full_sync_round_against_scripted_peer() {
        let f = fixture();
        let remote = MemoryChain::new("genesis");
        for i in 0..30 {
            remote.extend_head(format!("block {}", i).into_bytes());
        }

        let sink = TestSink::new();
        let (_, mut handler) = connect_peer(&f, &sink);
        deliver(&mut handler, &remote_status(&remote)).unwrap();
        sink.drain();

        // Answer the hash request: ancestors of the remote head. The
        // walk reaches our genesis, so one exchange completes the chain.
        let ancestors = remote.ancestors(&remote.head_hash(), MAX_HASHES_ASK as usize);
        deliver(&mut handler, &ChainMessage::BlockHashes(ancestors)).unwrap();
        assert_eq!(f.cap.mode(), SyncMode::Chain);
        assert_eq!(f.cap.download().chain_len(), 30);

        // Serve the leased bodies.
        let asked = match sink.drain().as_slice() {
            [ChainMessage::GetBlocks(hashes)] => hashes.clone(),
            other => panic!("expected GetBlocks, got {:?}", other),
        };
        assert_eq!(asked.len(), 30);
        let bodies: Vec<Bytes> = asked
            .iter()
            .map(|h| remote.block_body(h).expect("remote serves its chain"))
            .collect();
        deliver(&mut handler, &ChainMessage::Blocks(bodies)).unwrap();

        assert_eq!(f.cap.mode(), SyncMode::Idle);
        assert!(f.cap.download().is_complete());
        assert_eq!(f.chain.head_number(), 30);
        assert_eq!(f.chain.head_hash(), remote.head_hash());

        // Exactly thirty bodies reached the queue, none duplicated.
        let received = f.queue.received();
        assert_eq!(received.len(), 30);
        let mut dedup = received.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 30);

        // A positive rating for the useful bodies.
        assert!(sink.rating.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_wrong_network_is_fatal() {
        let f = fixture();
        let sink = TestSink::new();
        let (_, mut handler) = connect_peer(&f, &sink);

        let status = ChainMessage::Status(Status {
            protocol_version: CHAIN_PROTOCOL_VERSION,
            network_id: U256::from(7),
            total_difficulty: U256::from(1),
            best_hash: B256::repeat_byte(1),
            genesis_hash: f.chain.genesis_hash(),
        });
        assert!(deliver(&mut handler, &status).is_err());
    }

    #[test]
    fn test_wrong_genesis_is_fatal() {
        let f = fixture();
        let sink = TestSink::new();
        let (_, mut handler) = connect_peer(&f, &sink);

        let status = ChainMessage::Status(Status {
            protocol_version: CHAIN_PROTOCOL_VERSION,
            network_id: U256::from(42),
            total_difficulty: U256::from(1),
            best_hash: B256::repeat_byte(1),
            genesis_hash: B256::repeat_byte(0xfe),
        });
        assert!(deliver(&mut handler, &status).is_err());
    }

    #[test]
    fn test_serves_hashes_and_bodies() {
        let f = fixture();
        for i in 0..5 {
            f.chain.extend_head(format!("b{}", i).into_bytes());
        }

        let sink = TestSink::new();
        let (_, mut handler) = connect_peer(&f, &sink);
        sink.drain();

        deliver(
            &mut handler,
            &ChainMessage::GetBlockHashes {
                from: f.chain.head_hash(),
                max: 100,
            },
        )
        .unwrap();
        let hashes = match sink.drain().as_slice() {
            [ChainMessage::BlockHashes(hashes)] => hashes.clone(),
            other => panic!("expected BlockHashes, got {:?}", other),
        };
        assert_eq!(hashes.len(), 5);

        deliver(&mut handler, &ChainMessage::GetBlocks(hashes.clone())).unwrap();
        match sink.drain().as_slice() {
            [ChainMessage::Blocks(bodies)] => assert_eq!(bodies.len(), 5),
            other => panic!("expected Blocks, got {:?}", other),
        }
    }

    #[test]
    fn test_transaction_gossip_never_repeats() {
        let f = fixture();
        let sink = TestSink::new();
        let remote = MemoryChain::new("genesis");
        let (_, mut handler) = connect_peer(&f, &sink);
        deliver(&mut handler, &remote_status(&remote)).unwrap();
        sink.drain();

        f.pool.import(Bytes::from_static(b"tx-1"));
        f.pool.import(Bytes::from_static(b"tx-2"));

        f.cap.tick();
        match sink.drain().as_slice() {
            [ChainMessage::Transactions(txs)] => assert_eq!(txs.len(), 2),
            other => panic!("expected Transactions, got {:?}", other),
        }

        // Nothing new: the memo suppresses a resend.
        f.cap.tick();
        assert!(sink.drain().is_empty());

        f.pool.import(Bytes::from_static(b"tx-3"));
        f.cap.tick();
        match sink.drain().as_slice() {
            [ChainMessage::Transactions(txs)] => {
                assert_eq!(txs.len(), 1);
                assert_eq!(txs[0], Bytes::from_static(b"tx-3"));
            }
            other => panic!("expected one new transaction, got {:?}", other),
        }
    }

    #[test]
    fn test_received_transactions_are_not_echoed() {
        let f = fixture();
        let sink = TestSink::new();
        let remote = MemoryChain::new("genesis");
        let (_, mut handler) = connect_peer(&f, &sink);
        deliver(&mut handler, &remote_status(&remote)).unwrap();
        sink.drain();

        deliver(
            &mut handler,
            &ChainMessage::Transactions(vec![Bytes::from_static(b"their-tx")]),
        )
        .unwrap();

        // The tick moves it into the pool, but the sender never gets it
        // back.
        f.cap.tick();
        assert_eq!(f.pool.len(), 1);
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_new_block_gossip_propagates_to_others() {
        let f = fixture();
        let remote = MemoryChain::new("genesis");

        let sink_a = TestSink::new();
        let sink_b = TestSink::new();
        let (_, mut a) = connect_peer(&f, &sink_a);
        let (_, mut b) = connect_peer(&f, &sink_b);
        deliver(&mut a, &remote_status(&remote)).unwrap();
        deliver(&mut b, &remote_status(&remote)).unwrap();

        // Settle the head memo before anything arrives.
        f.cap.tick();
        sink_a.drain();
        sink_b.drain();

        let block = Block {
            parent: f.chain.head_hash(),
            number: 1,
            payload: Bytes::from_static(b"mined elsewhere"),
        };
        deliver(
            &mut a,
            &ChainMessage::NewBlock {
                block: block.encoded(),
                total_difficulty: U256::from(1),
            },
        )
        .unwrap();

        f.cap.tick();
        assert_eq!(f.chain.head_number(), 1);

        // The sender already has it; the other peer hears about it.
        assert!(sink_a.drain().is_empty());
        match sink_b.drain().as_slice() {
            [ChainMessage::NewBlock { block: body, .. }] => {
                assert_eq!(*body, block.encoded())
            }
            other => panic!("expected NewBlock, got {:?}", other),
        }
    }

    #[test]
    fn test_departed_source_demotes_to_helper() {
        let f = fixture();
        let remote = MemoryChain::new("genesis");
        for i in 0..10 {
            remote.extend_head(format!("r{}", i).into_bytes());
        }

        let sink = TestSink::new();
        let (id, mut handler) = connect_peer(&f, &sink);
        deliver(&mut handler, &remote_status(&remote)).unwrap();
        let ancestors = remote.ancestors(&remote.head_hash(), MAX_HASHES_ASK as usize);
        deliver(&mut handler, &ChainMessage::BlockHashes(ancestors)).unwrap();
        assert_eq!(f.cap.mode(), SyncMode::Chain);

        handler.on_disconnected();
        assert_eq!(f.cap.mode(), SyncMode::ChainHelper);
        assert_eq!(f.cap.peer_count(), 0);

        // Its lease is back in the pool.
        assert!(f.cap.download().lease_of(id).is_empty());
        assert_eq!(f.cap.download().remaining(), 10);
    }

    #[test]
    fn test_unknown_packet_opcode_is_error() {
        let f = fixture();
        let sink = TestSink::new();
        let (_, mut handler) = connect_peer(&f, &sink);
        assert!(handler.on_packet(PACKET_COUNT, &[]).is_err());
    }
}
