//! The shared progress ledger for one in-flight chain fetch.
//!
//! Holds the ordered chain of wanted hashes, the subset still needed, and
//! disjoint per-peer leases. All operations are atomic under one internal
//! lock; the invariants of the lease algebra hold at every exit:
//! leases are pairwise disjoint, every leased index is still needed, and
//! an index leaves the need set only when its body was decoded and handed
//! to the block queue.

use crate::chain::BlockQueue;
use alloy_primitives::B256;
use bytes::Bytes;
use ember_network::NodeId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Most hashes leased to one peer per request.
pub const MAX_BLOCKS_ASK: usize = 256;

/// Outcome of feeding a fetched body to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteResult {
    /// Needed, decoded, handed to the block queue.
    Taken,
    /// Not part of the chain under fetch, or already fetched.
    NotNeeded,
    /// Claimed to answer a needed hash but unusable.
    Bad,
}

#[derive(Default)]
struct DownloadState {
    /// The chain under fetch, earliest unknown block first.
    hashes: Vec<B256>,
    index: HashMap<B256, usize>,
    /// Indices not yet fetched.
    need: BTreeSet<usize>,
    /// Union of all leases.
    leased: BTreeSet<usize>,
    leases: HashMap<NodeId, BTreeSet<usize>>,
}

/// Download progress ledger.
pub struct DownloadManager {
    queue: Arc<dyn BlockQueue>,
    state: Mutex<DownloadState>,
}

impl DownloadManager {
    pub fn new(queue: Arc<dyn BlockQueue>) -> Self {
        Self {
            queue,
            state: Mutex::new(DownloadState::default()),
        }
    }

    /// Adopt an ordered hash chain as the fetch target; clears all leases.
    pub fn reset_to_chain(&self, hashes: Vec<B256>) {
        let mut state = self.state.lock();
        state.index = hashes
            .iter()
            .enumerate()
            .map(|(i, h)| (*h, i))
            .collect();
        state.need = (0..hashes.len()).collect();
        state.leased.clear();
        state.leases.clear();
        debug!(blocks = hashes.len(), "Chain adopted for download");
        state.hashes = hashes;
    }

    /// Lease a contiguous sub-range to `peer`: starts at the lowest
    /// un-leased needed index, at most [`MAX_BLOCKS_ASK`] long. Empty when
    /// nothing is left to lease.
    pub fn task_grabbed(&self, peer: NodeId) -> Vec<B256> {
        let mut state = self.state.lock();

        let Some(&start) = state.need.iter().find(|i| !state.leased.contains(*i)) else {
            return Vec::new();
        };

        let mut indices = Vec::with_capacity(MAX_BLOCKS_ASK);
        let mut next = start;
        while indices.len() < MAX_BLOCKS_ASK
            && state.need.contains(&next)
            && !state.leased.contains(&next)
        {
            indices.push(next);
            next += 1;
        }

        let hashes: Vec<B256> = indices.iter().map(|&i| state.hashes[i]).collect();
        for &i in &indices {
            state.leased.insert(i);
        }
        state
            .leases
            .entry(peer)
            .or_default()
            .extend(indices.iter().copied());

        debug!(peer = %peer, from = start, count = hashes.len(), "Leased block range");
        hashes
    }

    /// A body arrived for `hash`. Needed hashes are decoded here; the
    /// decoded-and-queued ones retire from need and from whichever lease
    /// held them.
    pub fn note_block(&self, hash: B256, body: &Bytes) -> NoteResult {
        let mut state = self.state.lock();
        let Some(&index) = state.index.get(&hash) else {
            return NoteResult::NotNeeded;
        };
        if !state.need.contains(&index) {
            return NoteResult::NotNeeded;
        }

        if let Err(e) = self.queue.import(body.clone()) {
            warn!(hash = %hash, error = %e, "Dropping unusable block");
            return NoteResult::Bad;
        }

        state.need.remove(&index);
        state.leased.remove(&index);
        for lease in state.leases.values_mut() {
            lease.remove(&index);
        }
        state.leases.retain(|_, lease| !lease.is_empty());
        NoteResult::Taken
    }

    /// Return a peer's lease to the pool.
    pub fn peer_gone(&self, peer: NodeId) {
        let mut state = self.state.lock();
        if let Some(lease) = state.leases.remove(&peer) {
            debug!(peer = %peer, returned = lease.len(), "Lease returned");
            for index in lease {
                state.leased.remove(&index);
            }
        }
    }

    /// True exactly when nothing is needed any more.
    pub fn is_complete(&self) -> bool {
        self.state.lock().need.is_empty()
    }

    /// Number of hashes still needed.
    pub fn remaining(&self) -> usize {
        self.state.lock().need.len()
    }

    /// Number of hashes in the chain under fetch.
    pub fn chain_len(&self) -> usize {
        self.state.lock().hashes.len()
    }

    /// Current lease of a peer, for inspection.
    pub fn lease_of(&self, peer: NodeId) -> Vec<B256> {
        let state = self.state.lock();
        state
            .leases
            .get(&peer)
            .map(|lease| lease.iter().map(|&i| state.hashes[i]).collect())
            .unwrap_or_default()
    }

    /// Check the lease algebra. Panics on violation; test hook.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let state = self.state.lock();
        let mut seen = BTreeSet::new();
        for lease in state.leases.values() {
            for index in lease {
                assert!(state.need.contains(index), "leased index not needed");
                assert!(seen.insert(*index), "overlapping leases");
            }
        }
        assert_eq!(seen, state.leased, "lease union out of sync");
    }
}
