//! Per-peer state of the chain sub-protocol.
//!
//! A peer advances `New → GotStatus → {Idle | AskingHashes | AskingBlocks}
//! → Disconnected`, driven purely by the packets it sends us and the
//! coordinator's timeouts. Exactly one peer at a time may be in
//! `AskingHashes`.

use crate::chain::Chain;
use crate::download::DownloadManager;
use crate::messages::{ChainMessage, Status, CHAIN_PROTOCOL_VERSION, MAX_HASHES_ASK};
use alloy_primitives::{B256, U256};
use ember_network::PeerLink;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long a peer may sit on a request before its lease is returned.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);

/// Upper bound on an accumulated hash chain; a peer claiming more than
/// this many unknown blocks is not worth following.
pub const MAX_HASH_CHAIN: usize = 262_144;

/// Protocol state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Connected, Status not yet received.
    New,
    /// Status checked out; available for work.
    GotStatus,
    /// Finished or failed its part of the round; idle until the next one.
    Idle,
    /// Elected source of the hash chain.
    AskingHashes,
    /// Fetching leased block bodies.
    AskingBlocks,
    /// Gone.
    Disconnected,
}

/// One peer of the chain capability.
pub struct SyncPeer {
    link: PeerLink,
    pub(crate) state: PeerState,
    /// Total difficulty the peer claimed in its Status.
    pub(crate) total_difficulty: U256,
    /// Best hash the peer claimed.
    pub(crate) best_hash: B256,
    /// Unknown hashes collected so far, newest first (AskingHashes only).
    pub(crate) hash_chain: Vec<B256>,
    /// When the outstanding request was sent.
    pub(crate) asked_at: Option<Instant>,
    /// Transaction hashes this peer already has.
    pub(crate) txs_sent: HashSet<B256>,
    /// Block hashes this peer already has.
    pub(crate) blocks_known: HashSet<B256>,
}

impl SyncPeer {
    pub fn new(link: PeerLink) -> Self {
        Self {
            link,
            state: PeerState::New,
            total_difficulty: U256::ZERO,
            best_hash: B256::ZERO,
            hash_chain: Vec::new(),
            asked_at: None,
            txs_sent: HashSet::new(),
            blocks_known: HashSet::new(),
        }
    }

    pub fn node_id(&self) -> ember_network::NodeId {
        self.link.node_id()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Queue a packet on the session.
    pub fn send(&self, message: &ChainMessage) {
        self.link.send(message.encode(self.link.base()));
    }

    pub fn rate(&self, delta: i32) {
        self.link.rate(delta);
    }

    /// Send our Status, opening the exchange.
    pub fn send_status(&self, chain: &dyn Chain, network_id: U256) {
        self.send(&ChainMessage::Status(Status {
            protocol_version: CHAIN_PROTOCOL_VERSION,
            network_id,
            total_difficulty: chain.total_difficulty(),
            best_hash: chain.head_hash(),
            genesis_hash: chain.genesis_hash(),
        }));
    }

    /// Become the elected hash-chain source and ask for the first batch.
    pub fn start_hash_chain(&mut self) {
        debug!(peer = %self.node_id(), best = %self.best_hash, "Elected hash-chain source");
        self.state = PeerState::AskingHashes;
        self.hash_chain.clear();
        self.hash_chain.push(self.best_hash);
        self.asked_at = Some(Instant::now());
        self.send(&ChainMessage::GetBlockHashes {
            from: self.best_hash,
            max: MAX_HASHES_ASK,
        });
    }

    /// Ask for the next hash batch, continuing from the oldest we hold.
    pub fn continue_hash_chain(&mut self) {
        let from = *self.hash_chain.last().expect("chain is seeded");
        self.asked_at = Some(Instant::now());
        self.send(&ChainMessage::GetBlockHashes {
            from,
            max: MAX_HASHES_ASK,
        });
    }

    /// Grab a lease and request its bodies. Returns false and parks the
    /// peer in `Idle` when nothing was left to lease.
    pub fn continue_blocks(&mut self, download: &DownloadManager) -> bool {
        // Return any leftover lease first so the pool stays whole.
        download.peer_gone(self.node_id());

        let lease = download.task_grabbed(self.node_id());
        if lease.is_empty() {
            trace!(peer = %self.node_id(), "Nothing to lease");
            self.state = PeerState::Idle;
            self.asked_at = None;
            return false;
        }

        debug!(peer = %self.node_id(), count = lease.len(), "Requesting leased bodies");
        self.state = PeerState::AskingBlocks;
        self.asked_at = Some(Instant::now());
        self.send(&ChainMessage::GetBlocks(lease));
        true
    }

    /// Park the peer for the rest of the round, returning its lease.
    pub fn go_idle(&mut self, download: &DownloadManager) {
        download.peer_gone(self.node_id());
        self.state = PeerState::Idle;
        self.asked_at = None;
    }

    /// An outstanding request has been waiting too long.
    pub fn timed_out(&self) -> bool {
        matches!(self.state, PeerState::AskingHashes | PeerState::AskingBlocks)
            && self
                .asked_at
                .map_or(false, |at| at.elapsed() > RESPONSE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_states_are_distinct() {
        // The full walk the coordinator performs.
        let order = [
            PeerState::New,
            PeerState::GotStatus,
            PeerState::AskingHashes,
            PeerState::AskingBlocks,
            PeerState::Idle,
            PeerState::Disconnected,
        ];
        for (i, a) in order.iter().enumerate() {
            for b in &order[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
