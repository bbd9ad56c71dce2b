//! # ember-network
//!
//! P2P networking layer for the ember blockchain client.
//!
//! This crate provides:
//! - Sync-prefixed, length-prefixed wire framing
//! - The p2p control protocol (Hello, Disconnect, Ping/Pong, peer gossip)
//! - TCP session management with per-session capability dispatch
//! - The host: accept/dial lifecycle, bounded peer set, peer persistence
//! - Local address discovery and best-effort UPnP port mapping

mod capability;
mod codec;
pub mod discovery;
mod error;
mod host;
mod message;
pub mod nat;
mod peer;
mod session;

pub use capability::{Capability, PacketSink, PeerCapability, PeerLink};
pub use codec::{
    read_frame_header, seal, FrameCodec, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, SYNC_BYTES,
};
pub use discovery::HostAddresses;
pub use error::{NetworkError, NetworkResult};
pub use host::{Host, HostConfig, P2P_PROTOCOL_VERSION};
pub use message::{
    DisconnectReason, Hello, Message, PeerSpec, CAPABILITY_OFFSET,
};
pub use peer::{Endpoint, IncomingPeer, NodeId, PeerInfo};
pub use session::SessionHandle;
