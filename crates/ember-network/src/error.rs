//! Network error types.

use crate::message::DisconnectReason;
use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// No usable network interface could be enumerated.
    #[error("No networking available on this host")]
    NoNetworking,

    /// No UPnP gateway answered; the host proceeds without a mapping.
    #[error("No UPnP device found: {0}")]
    NoUpnpDevice(String),

    /// Frame sync bytes did not match.
    #[error("Bad frame magic: {}", hex::encode(.0))]
    BadMagic([u8; 4]),

    /// Frame payload exceeds the allowed size.
    #[error("Frame too large: {size} bytes, max {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer violated the wire protocol.
    #[error("Bad protocol: {0}")]
    BadProtocol(String),

    /// A second session arrived for an already-connected node id.
    #[error("Duplicate peer")]
    DuplicatePeer,

    /// The remote asked us to disconnect.
    #[error("Disconnected by peer: {0}")]
    DisconnectRequested(DisconnectReason),

    /// We refused the session for the given reason.
    #[error("Session refused: {0}")]
    Refused(DisconnectReason),

    /// Handshake did not complete.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// RLP decoding failed.
    #[error("RLP error: {0}")]
    Rlp(#[from] alloy_rlp::Error),

    /// Socket-level error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// Map a connection-fatal error onto the disconnect reason we report
    /// to the remote before closing.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            NetworkError::BadMagic(_) => DisconnectReason::BadProtocol,
            NetworkError::FrameTooLarge { .. } => DisconnectReason::BadProtocol,
            NetworkError::BadProtocol(_) => DisconnectReason::BadProtocol,
            NetworkError::Rlp(_) => DisconnectReason::BadProtocol,
            NetworkError::DuplicatePeer => DisconnectReason::DuplicatePeer,
            NetworkError::Refused(reason) => *reason,
            NetworkError::Io(_) => DisconnectReason::TcpError,
            _ => DisconnectReason::DisconnectRequested,
        }
    }
}
