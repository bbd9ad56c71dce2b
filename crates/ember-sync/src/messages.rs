//! Chain sub-protocol packets.
//!
//! Opcodes are relative to the capability's negotiated base; encoding
//! against a base produces a complete frame payload (an RLP list led by
//! the absolute opcode), the same shape as the p2p control packets.

use crate::{SyncError, SyncResult};
use alloy_primitives::{B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};
use bytes::Bytes;

/// Relative opcodes of the chain sub-protocol.
pub const STATUS_PACKET: u8 = 0x00;
pub const NEW_BLOCK_HASHES_PACKET: u8 = 0x01;
pub const TRANSACTIONS_PACKET: u8 = 0x02;
pub const GET_BLOCK_HASHES_PACKET: u8 = 0x03;
pub const BLOCK_HASHES_PACKET: u8 = 0x04;
pub const GET_BLOCKS_PACKET: u8 = 0x05;
pub const BLOCKS_PACKET: u8 = 0x06;
pub const NEW_BLOCK_PACKET: u8 = 0x07;

/// Number of opcodes the protocol occupies.
pub const PACKET_COUNT: u8 = 8;

/// Chain sub-protocol version carried in Status.
pub const CHAIN_PROTOCOL_VERSION: u8 = 1;

/// Hashes requested per GetBlockHashes.
pub const MAX_HASHES_ASK: u32 = 512;

/// Server-side cap on a BlockHashes reply.
pub const MAX_HASHES_SEND: usize = 2048;

/// Server-side cap on a Blocks reply.
pub const MAX_BODIES_SEND: usize = 256;

/// Status packet contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub protocol_version: u8,
    pub network_id: U256,
    /// Total difficulty the peer claims for its best chain.
    pub total_difficulty: U256,
    /// Hash of the peer's best block.
    pub best_hash: B256,
    pub genesis_hash: B256,
}

/// A decoded chain packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainMessage {
    Status(Status),
    /// Announcement of block hashes the peer believes we lack.
    NewBlockHashes(Vec<B256>),
    /// Raw transaction payloads.
    Transactions(Vec<Bytes>),
    /// Request for up to `max` ancestors of `from`, newest first.
    GetBlockHashes { from: B256, max: u32 },
    BlockHashes(Vec<B256>),
    GetBlocks(Vec<B256>),
    /// Raw block bodies answering a GetBlocks.
    Blocks(Vec<Bytes>),
    /// A freshly propagated block and the sender's claimed total
    /// difficulty including it.
    NewBlock { block: Bytes, total_difficulty: U256 },
}

fn finish_packet(body: Vec<u8>) -> Bytes {
    let mut out = Vec::with_capacity(body.len() + 4);
    Header {
        list: true,
        payload_length: body.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&body);
    Bytes::from(out)
}

impl ChainMessage {
    /// Opcode relative to the capability base.
    pub fn opcode(&self) -> u8 {
        match self {
            ChainMessage::Status(_) => STATUS_PACKET,
            ChainMessage::NewBlockHashes(_) => NEW_BLOCK_HASHES_PACKET,
            ChainMessage::Transactions(_) => TRANSACTIONS_PACKET,
            ChainMessage::GetBlockHashes { .. } => GET_BLOCK_HASHES_PACKET,
            ChainMessage::BlockHashes(_) => BLOCK_HASHES_PACKET,
            ChainMessage::GetBlocks(_) => GET_BLOCKS_PACKET,
            ChainMessage::Blocks(_) => BLOCKS_PACKET,
            ChainMessage::NewBlock { .. } => NEW_BLOCK_PACKET,
        }
    }

    /// Encode to a frame payload with the capability's absolute base.
    pub fn encode(&self, base: u8) -> Bytes {
        let mut body = Vec::new();
        (base + self.opcode()).encode(&mut body);
        match self {
            ChainMessage::Status(s) => {
                s.protocol_version.encode(&mut body);
                s.network_id.encode(&mut body);
                s.total_difficulty.encode(&mut body);
                s.best_hash.encode(&mut body);
                s.genesis_hash.encode(&mut body);
            }
            ChainMessage::NewBlockHashes(hashes)
            | ChainMessage::BlockHashes(hashes)
            | ChainMessage::GetBlocks(hashes) => {
                for hash in hashes {
                    hash.encode(&mut body);
                }
            }
            ChainMessage::Transactions(payloads) | ChainMessage::Blocks(payloads) => {
                for payload in payloads {
                    payload.encode(&mut body);
                }
            }
            ChainMessage::GetBlockHashes { from, max } => {
                from.encode(&mut body);
                max.encode(&mut body);
            }
            ChainMessage::NewBlock {
                block,
                total_difficulty,
            } => {
                block.encode(&mut body);
                total_difficulty.encode(&mut body);
            }
        }
        finish_packet(body)
    }

    /// Decode the trailing items of a capability packet.
    pub fn decode(opcode: u8, mut body: &[u8]) -> SyncResult<Self> {
        let buf = &mut body;
        let message = match opcode {
            STATUS_PACKET => ChainMessage::Status(Status {
                protocol_version: u8::decode(buf)?,
                network_id: U256::decode(buf)?,
                total_difficulty: U256::decode(buf)?,
                best_hash: B256::decode(buf)?,
                genesis_hash: B256::decode(buf)?,
            }),
            NEW_BLOCK_HASHES_PACKET => ChainMessage::NewBlockHashes(decode_hashes(buf)?),
            TRANSACTIONS_PACKET => ChainMessage::Transactions(decode_payloads(buf)?),
            GET_BLOCK_HASHES_PACKET => ChainMessage::GetBlockHashes {
                from: B256::decode(buf)?,
                max: u32::decode(buf)?,
            },
            BLOCK_HASHES_PACKET => ChainMessage::BlockHashes(decode_hashes(buf)?),
            GET_BLOCKS_PACKET => ChainMessage::GetBlocks(decode_hashes(buf)?),
            BLOCKS_PACKET => ChainMessage::Blocks(decode_payloads(buf)?),
            NEW_BLOCK_PACKET => ChainMessage::NewBlock {
                block: Bytes::decode(buf)?,
                total_difficulty: U256::decode(buf)?,
            },
            other => {
                return Err(SyncError::BadPacket(format!(
                    "unknown chain packet 0x{:02x}",
                    other
                )))
            }
        };
        if !buf.is_empty() {
            return Err(SyncError::BadPacket("trailing packet bytes".into()));
        }
        Ok(message)
    }
}

fn decode_hashes(buf: &mut &[u8]) -> SyncResult<Vec<B256>> {
    let mut hashes = Vec::new();
    while !buf.is_empty() {
        hashes.push(B256::decode(buf)?);
    }
    Ok(hashes)
}

fn decode_payloads(buf: &mut &[u8]) -> SyncResult<Vec<Bytes>> {
    let mut payloads = Vec::new();
    while !buf.is_empty() {
        payloads.push(Bytes::decode(buf)?);
    }
    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_network::{Message, CAPABILITY_OFFSET};

    /// Encode against the base, route through the p2p packet decoder the
    /// way a session would, then decode the capability body.
    fn roundtrip(msg: ChainMessage) -> ChainMessage {
        let payload = msg.encode(CAPABILITY_OFFSET);
        match Message::decode(&payload).unwrap() {
            Message::Capability { opcode, body } => {
                ChainMessage::decode(opcode - CAPABILITY_OFFSET, &body).unwrap()
            }
            other => panic!("not a capability packet: {:?}", other),
        }
    }

    #[test]
    fn test_status_roundtrip() {
        let msg = ChainMessage::Status(Status {
            protocol_version: CHAIN_PROTOCOL_VERSION,
            network_id: U256::from(7),
            total_difficulty: U256::from(123456u64),
            best_hash: B256::repeat_byte(0xab),
            genesis_hash: B256::repeat_byte(0x01),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_hash_list_roundtrips() {
        let hashes = vec![B256::repeat_byte(1), B256::repeat_byte(2)];
        for msg in [
            ChainMessage::NewBlockHashes(hashes.clone()),
            ChainMessage::BlockHashes(hashes.clone()),
            ChainMessage::GetBlocks(hashes.clone()),
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_empty_hash_list() {
        let msg = ChainMessage::BlockHashes(Vec::new());
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_get_block_hashes_roundtrip() {
        let msg = ChainMessage::GetBlockHashes {
            from: B256::repeat_byte(0x33),
            max: 512,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_payload_roundtrips() {
        let payloads = vec![Bytes::from_static(b"tx-1"), Bytes::from_static(b"tx-two")];
        for msg in [
            ChainMessage::Transactions(payloads.clone()),
            ChainMessage::Blocks(payloads.clone()),
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_new_block_roundtrip() {
        let msg = ChainMessage::NewBlock {
            block: Bytes::from_static(b"block body"),
            total_difficulty: U256::from(99),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert!(matches!(
            ChainMessage::decode(PACKET_COUNT, &[]),
            Err(SyncError::BadPacket(_))
        ));
    }
}
