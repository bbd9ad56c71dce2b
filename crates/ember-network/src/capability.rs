//! Capability registry and per-session handlers.
//!
//! A capability is a named sub-protocol multiplexed over a session. The
//! host owns one [`Capability`] instance per registered protocol; every
//! session that advertises the same name in its Hello gets a
//! [`PeerCapability`] handler from it. Handlers are plain state machines
//! driven by the packets of their opcode window — they never block.

use crate::message::DisconnectReason;
use crate::peer::NodeId;
use crate::session::SessionHandle;
use crate::NetworkResult;
use bytes::Bytes;
use std::sync::Arc;

/// A host-registered sub-protocol.
pub trait Capability: Send + Sync {
    /// Protocol name advertised in the Hello packet.
    fn name(&self) -> &str;

    /// Number of packet opcodes this protocol occupies.
    fn packet_count(&self) -> u8;

    /// Called when the host starts.
    fn on_starting(&self) {}

    /// Called when the host stops.
    fn on_stopping(&self) {}

    /// Called from the host's maintenance worker.
    fn tick(&self) {}

    /// Create the per-session handler for a freshly negotiated peer.
    fn new_peer(&self, link: PeerLink) -> Box<dyn PeerCapability>;
}

/// Per-session protocol handler, driven by received packets.
pub trait PeerCapability: Send {
    /// The session completed its Hello exchange.
    fn on_connected(&mut self) -> NetworkResult<()> {
        Ok(())
    }

    /// A packet for this capability arrived. `opcode` is relative to the
    /// capability's negotiated base. An error disconnects the session.
    fn on_packet(&mut self, opcode: u8, body: &[u8]) -> NetworkResult<()>;

    /// The session is gone. Always called exactly once.
    fn on_disconnected(&mut self) {}
}

/// The writer seam between a capability and its session. Implemented by
/// [`SessionHandle`]; capability tests substitute a channel-backed sink to
/// drive their state machines without a socket.
pub trait PacketSink: Send + Sync {
    /// Queue a frame payload. Returns false once the connection is gone.
    fn send_packet(&self, payload: Bytes) -> bool;

    /// Ask the connection to close with the given reason.
    fn disconnect(&self, reason: DisconnectReason);

    /// Adjust the connection's rating.
    fn rate(&self, delta: i32);

    fn is_open(&self) -> bool;
}

impl PacketSink for SessionHandle {
    fn send_packet(&self, payload: Bytes) -> bool {
        self.send_payload(payload)
    }

    fn disconnect(&self, reason: DisconnectReason) {
        SessionHandle::disconnect(self, reason);
    }

    fn rate(&self, delta: i32) {
        SessionHandle::rate(self, delta);
    }

    fn is_open(&self) -> bool {
        SessionHandle::is_open(self)
    }
}

/// A capability's handle onto one session: identity, opcode base, and a
/// serialized writer. Cheap to clone.
#[derive(Clone)]
pub struct PeerLink {
    node_id: NodeId,
    base: u8,
    sink: Arc<dyn PacketSink>,
}

impl PeerLink {
    pub fn new(node_id: NodeId, base: u8, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            node_id,
            base,
            sink,
        }
    }

    /// Remote node id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// First absolute opcode of this capability's window.
    pub fn base(&self) -> u8 {
        self.base
    }

    /// Queue a packet payload on the session. Returns false once the
    /// session is closed.
    pub fn send(&self, payload: Bytes) -> bool {
        self.sink.send_packet(payload)
    }

    /// Ask the session to disconnect.
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.sink.disconnect(reason);
    }

    /// Adjust the session rating.
    pub fn rate(&self, delta: i32) {
        self.sink.rate(delta);
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }
}

/// A negotiated handler and its opcode window.
pub(crate) struct PeerCapabilityEntry {
    pub base: u8,
    pub count: u8,
    pub handler: Box<dyn PeerCapability>,
}

impl PeerCapabilityEntry {
    pub fn covers(&self, opcode: u8) -> bool {
        opcode >= self.base && opcode < self.base + self.count
    }
}
