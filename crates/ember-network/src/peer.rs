//! Peer identity and addressing types.

use alloy_primitives::B512;
use alloy_rlp::{RlpDecodableWrapper, RlpEncodableWrapper};
use rand::RngCore;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// 512-bit node identifier, chosen uniformly at random at process start.
///
/// Used only for peer de-duplication and gossip; it is not authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct NodeId(pub B512);

impl NodeId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(B512::from(bytes))
    }

    /// The all-zero identifier, rejected in handshakes.
    pub fn zero() -> Self {
        NodeId(B512::ZERO)
    }

    /// True if this is the all-zero identifier.
    pub fn is_zero(&self) -> bool {
        self.0 == B512::ZERO
    }

    /// Short hex form for logs.
    pub fn abridged(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.abridged())
    }
}

/// An IPv4 address and TCP port.
///
/// Port `0` means "listen port unknown" and disqualifies the endpoint from
/// being gossiped or reconnected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// An endpoint that cannot be dialed or gossiped.
    pub fn unspecified() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.address.is_unspecified()
    }

    /// Usable for gossip and reconnection.
    pub fn is_routable(&self) -> bool {
        !self.address.is_unspecified() && self.port != 0
    }

    /// True for addresses that only make sense on the local network.
    pub fn is_private(&self) -> bool {
        self.address.is_private() || self.address.is_loopback() || self.address.is_link_local()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }

    /// Extract the IPv4 endpoint of a socket address, if it is one.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A remembered-but-not-connected peer: where to reach it and how many
/// times we have tried.
#[derive(Debug, Clone)]
pub struct IncomingPeer {
    pub endpoint: Endpoint,
    pub attempts: u32,
}

impl IncomingPeer {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            attempts: 0,
        }
    }
}

/// Snapshot of a live session, as returned by `Host::peers`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote node identifier.
    pub id: NodeId,
    /// Client-version string from the Hello packet.
    pub client_version: String,
    /// Remote endpoint of the socket.
    pub endpoint: Endpoint,
    /// Listen port the peer advertised (may differ from the socket port).
    pub listen_port: u16,
    /// Last measured ping round-trip, if any.
    pub last_ping: Option<Duration>,
    /// Session rating as maintained by capabilities.
    pub rating: i32,
}
