//! Sync error types.

use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network-level failure.
    #[error("Network error: {0}")]
    Network(#[from] ember_network::NetworkError),

    /// Peer sent something that violates the chain sub-protocol.
    #[error("Bad packet: {0}")]
    BadPacket(String),

    /// Peer belongs to a different network.
    #[error("Wrong network: ours {ours}, theirs {theirs}")]
    WrongNetwork { ours: String, theirs: String },

    /// Peer disagrees about the genesis block.
    #[error("Wrong genesis")]
    WrongGenesis,

    /// RLP decoding failed.
    #[error("RLP error: {0}")]
    Rlp(#[from] alloy_rlp::Error),

    /// A block body could not be decoded.
    #[error("Undecodable block")]
    BadBlock,

    /// The chain refused a block.
    #[error("Chain rejected block: {0}")]
    Rejected(String),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl From<SyncError> for ember_network::NetworkError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Network(inner) => inner,
            SyncError::Rlp(inner) => ember_network::NetworkError::Rlp(inner),
            other => ember_network::NetworkError::BadProtocol(other.to_string()),
        }
    }
}
