//! # ember-sync
//!
//! Chain synchronization for the ember blockchain client.
//!
//! This crate provides:
//! - The chain sub-protocol (Status, hash-chain acquisition, body fetch,
//!   transaction and block gossip)
//! - The download manager partitioning a hash range across peers
//! - The per-peer protocol state machine
//! - The host-resident sync coordinator
//! - Collaborator interfaces (`Chain`, `TxPool`, `BlockQueue`) with
//!   in-memory implementations

mod chain;
mod download;
mod error;
mod messages;
mod peer;
mod sync;

pub use chain::{
    content_hash, Block, BlockQueue, Chain, ImportResult, MemoryBlockQueue, MemoryChain,
    MemoryTxPool, TxPool,
};
pub use download::{DownloadManager, NoteResult, MAX_BLOCKS_ASK};
pub use error::{SyncError, SyncResult};
pub use messages::{
    ChainMessage, Status, CHAIN_PROTOCOL_VERSION, MAX_BODIES_SEND, MAX_HASHES_ASK,
    MAX_HASHES_SEND, PACKET_COUNT,
};
pub use peer::{PeerState, SyncPeer, MAX_HASH_CHAIN, RESPONSE_TIMEOUT};
pub use sync::{SyncCapability, SyncMode, CAPABILITY_NAME};
