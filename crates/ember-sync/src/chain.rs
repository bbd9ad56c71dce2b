//! Collaborator interfaces: the block database, the transaction pool and
//! the pending-block queue, specified at their boundary.
//!
//! The sync capability only ever talks to these traits. The in-memory
//! implementations below back the binary and the tests; a real client
//! substitutes its own.

use crate::{SyncError, SyncResult};
use alloy_primitives::{B256, U256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 content hash used to name blocks and transactions.
pub fn content_hash(data: &[u8]) -> B256 {
    let digest = Blake2b256::digest(data);
    B256::from_slice(&digest)
}

/// A block body: parent link, height and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Block {
    pub parent: B256,
    pub number: u64,
    pub payload: Bytes,
}

impl Block {
    pub fn genesis(payload: impl Into<Bytes>) -> Self {
        Self {
            parent: B256::ZERO,
            number: 0,
            payload: payload.into(),
        }
    }

    /// RLP-encoded body, the form that travels in Blocks/NewBlock packets.
    pub fn encoded(&self) -> Bytes {
        let mut out = Vec::new();
        self.encode(&mut out);
        Bytes::from(out)
    }

    /// Decode a body received from the wire.
    pub fn decode_body(data: &[u8]) -> SyncResult<Self> {
        let mut buf = data;
        let block = Block::decode(&mut buf).map_err(|_| SyncError::BadBlock)?;
        if !buf.is_empty() {
            return Err(SyncError::BadBlock);
        }
        Ok(block)
    }

    /// Content hash of the encoded body.
    pub fn hash(&self) -> B256 {
        content_hash(&self.encoded())
    }
}

/// Result of handing a block to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportResult {
    /// Accepted; `new_head` when it extended the best chain.
    Imported { new_head: bool },
    /// Already in the database.
    AlreadyKnown,
    /// Parent unknown; try again once it arrives.
    UnknownParent,
}

/// The block database.
pub trait Chain: Send + Sync {
    fn genesis_hash(&self) -> B256;
    fn head_hash(&self) -> B256;
    fn total_difficulty(&self) -> U256;
    fn contains(&self, hash: &B256) -> bool;
    /// Encoded body of a known block.
    fn block_body(&self, hash: &B256) -> Option<Bytes>;
    /// Hashes of the ancestors of `from`, newest first, at most `max`.
    /// Empty when `from` is unknown.
    fn ancestors(&self, from: &B256, max: usize) -> Vec<B256>;
    fn import(&self, block: &Block) -> SyncResult<ImportResult>;
}

/// The transaction pool.
pub trait TxPool: Send + Sync {
    /// Add a validated transaction payload.
    fn import(&self, tx: Bytes);
    fn contains(&self, hash: &B256) -> bool;
    /// Current pool contents, keyed by content hash.
    fn pending(&self) -> Vec<(B256, Bytes)>;
}

/// The pending-block queue: takes bodies in arrival order and feeds the
/// chain, holding back children until their parent lands.
pub trait BlockQueue: Send + Sync {
    fn import(&self, body: Bytes) -> SyncResult<()>;
    /// Known to the queue or the chain behind it.
    fn is_known(&self, hash: &B256) -> bool;
}

struct ChainEntry {
    block: Block,
    total_difficulty: U256,
}

struct ChainInner {
    blocks: HashMap<B256, ChainEntry>,
    genesis: B256,
    head: B256,
}

/// In-memory chain with a one-difficulty-per-block model.
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    pub fn new(genesis_payload: impl Into<Bytes>) -> Self {
        let genesis = Block::genesis(genesis_payload);
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(
            hash,
            ChainEntry {
                block: genesis,
                total_difficulty: U256::ZERO,
            },
        );
        Self {
            inner: RwLock::new(ChainInner {
                blocks,
                genesis: hash,
                head: hash,
            }),
        }
    }

    /// Append a block on the current head. Test and demo helper.
    pub fn extend_head(&self, payload: impl Into<Bytes>) -> Block {
        let block = {
            let inner = self.inner.read();
            let head = &inner.blocks[&inner.head];
            Block {
                parent: inner.head,
                number: head.block.number + 1,
                payload: payload.into(),
            }
        };
        self.import(&block).expect("extending the head is valid");
        block
    }

    pub fn head_number(&self) -> u64 {
        let inner = self.inner.read();
        inner.blocks[&inner.head].block.number
    }
}

impl Chain for MemoryChain {
    fn genesis_hash(&self) -> B256 {
        self.inner.read().genesis
    }

    fn head_hash(&self) -> B256 {
        self.inner.read().head
    }

    fn total_difficulty(&self) -> U256 {
        let inner = self.inner.read();
        inner.blocks[&inner.head].total_difficulty
    }

    fn contains(&self, hash: &B256) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }

    fn block_body(&self, hash: &B256) -> Option<Bytes> {
        self.inner
            .read()
            .blocks
            .get(hash)
            .map(|e| e.block.encoded())
    }

    fn ancestors(&self, from: &B256, max: usize) -> Vec<B256> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut cursor = match inner.blocks.get(from) {
            Some(entry) => entry.block.parent,
            None => return out,
        };
        while out.len() < max {
            let Some(entry) = inner.blocks.get(&cursor) else {
                break;
            };
            out.push(cursor);
            if entry.block.number == 0 {
                break;
            }
            cursor = entry.block.parent;
        }
        out
    }

    fn import(&self, block: &Block) -> SyncResult<ImportResult> {
        let hash = block.hash();
        let mut inner = self.inner.write();
        if inner.blocks.contains_key(&hash) {
            return Ok(ImportResult::AlreadyKnown);
        }
        let Some(parent) = inner.blocks.get(&block.parent) else {
            return Ok(ImportResult::UnknownParent);
        };
        if block.number != parent.block.number + 1 {
            return Err(SyncError::Rejected(format!(
                "number {} does not follow parent {}",
                block.number, parent.block.number
            )));
        }

        let total_difficulty = parent.total_difficulty + U256::from(1);
        let head_td = inner.blocks[&inner.head].total_difficulty;
        let new_head = total_difficulty > head_td;
        inner.blocks.insert(
            hash,
            ChainEntry {
                block: block.clone(),
                total_difficulty,
            },
        );
        if new_head {
            inner.head = hash;
        }
        Ok(ImportResult::Imported { new_head })
    }
}

/// In-memory transaction pool.
#[derive(Default)]
pub struct MemoryTxPool {
    txs: RwLock<Vec<(B256, Bytes)>>,
}

impl MemoryTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.txs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.read().is_empty()
    }
}

impl TxPool for MemoryTxPool {
    fn import(&self, tx: Bytes) {
        let hash = content_hash(&tx);
        let mut txs = self.txs.write();
        if !txs.iter().any(|(h, _)| *h == hash) {
            txs.push((hash, tx));
        }
    }

    fn contains(&self, hash: &B256) -> bool {
        self.txs.read().iter().any(|(h, _)| h == hash)
    }

    fn pending(&self) -> Vec<(B256, Bytes)> {
        self.txs.read().clone()
    }
}

/// In-memory pending-block queue feeding a chain, with parent buffering.
pub struct MemoryBlockQueue {
    chain: Arc<dyn Chain>,
    /// Bodies accepted so far, in arrival order. Test ledger.
    received: Mutex<Vec<B256>>,
    /// Children waiting for a parent, keyed by the missing parent hash.
    waiting: Mutex<HashMap<B256, Vec<Block>>>,
}

impl MemoryBlockQueue {
    pub fn new(chain: Arc<dyn Chain>) -> Self {
        Self {
            chain,
            received: Mutex::new(Vec::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Hashes of every distinct body accepted, in arrival order.
    pub fn received(&self) -> Vec<B256> {
        self.received.lock().clone()
    }

    /// Import everything whose parent just became available.
    fn drain_waiting(&self, imported: B256) {
        let mut ready = vec![imported];
        while let Some(parent) = ready.pop() {
            let children = self.waiting.lock().remove(&parent);
            for child in children.into_iter().flatten() {
                if let Ok(ImportResult::Imported { .. }) = self.chain.import(&child) {
                    ready.push(child.hash());
                }
            }
        }
    }
}

impl BlockQueue for MemoryBlockQueue {
    fn import(&self, body: Bytes) -> SyncResult<()> {
        let block = Block::decode_body(&body)?;
        let hash = block.hash();

        if self.is_known(&hash) {
            return Ok(());
        }
        self.received.lock().push(hash);

        match self.chain.import(&block)? {
            ImportResult::Imported { .. } => {
                self.drain_waiting(hash);
                Ok(())
            }
            ImportResult::AlreadyKnown => Ok(()),
            ImportResult::UnknownParent => {
                self.waiting
                    .lock()
                    .entry(block.parent)
                    .or_default()
                    .push(block);
                Ok(())
            }
        }
    }

    fn is_known(&self, hash: &B256) -> bool {
        if self.chain.contains(hash) {
            return true;
        }
        self.waiting
            .lock()
            .values()
            .any(|blocks| blocks.iter().any(|b| b.hash() == *hash))
    }
}
