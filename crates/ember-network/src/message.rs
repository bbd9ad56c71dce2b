//! P2P control packets.
//!
//! Every payload is an RLP list whose first element is the packet opcode.
//! Opcodes `0x00..=0x0f` are reserved for the control protocol below;
//! everything from [`CAPABILITY_OFFSET`] up belongs to the capabilities
//! negotiated in the Hello exchange and is surfaced undecoded as
//! [`Message::Capability`].

use crate::peer::{Endpoint, NodeId};
use crate::{NetworkError, NetworkResult};
use alloy_rlp::{Decodable, Encodable, Header};
use bytes::{BufMut, Bytes};
use std::fmt;
use std::net::Ipv4Addr;

/// First opcode available to negotiated capabilities.
pub const CAPABILITY_OFFSET: u8 = 0x10;

const HELLO_PACKET: u8 = 0x00;
const DISCONNECT_PACKET: u8 = 0x01;
const PING_PACKET: u8 = 0x02;
const PONG_PACKET: u8 = 0x03;
const GET_PEERS_PACKET: u8 = 0x04;
const PEERS_PACKET: u8 = 0x05;

/// Reason code carried in a Disconnect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    DisconnectRequested = 0,
    TcpError = 1,
    BadProtocol = 2,
    UselessPeer = 3,
    TooManyPeers = 4,
    DuplicatePeer = 5,
    IncompatibleProtocol = 6,
    NullIdentity = 7,
    ClientQuit = 8,
    UnexpectedIdentity = 9,
    LocalIdentity = 10,
    PingTimeout = 11,
}

impl DisconnectReason {
    pub fn from_code(code: u8) -> Option<Self> {
        use DisconnectReason::*;
        Some(match code {
            0 => DisconnectRequested,
            1 => TcpError,
            2 => BadProtocol,
            3 => UselessPeer,
            4 => TooManyPeers,
            5 => DuplicatePeer,
            6 => IncompatibleProtocol,
            7 => NullIdentity,
            8 => ClientQuit,
            9 => UnexpectedIdentity,
            10 => LocalIdentity,
            11 => PingTimeout,
            _ => return None,
        })
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::TcpError => "TCP error",
            DisconnectReason::BadProtocol => "bad protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::DuplicatePeer => "duplicate peer",
            DisconnectReason::IncompatibleProtocol => "incompatible protocol",
            DisconnectReason::NullIdentity => "null identity",
            DisconnectReason::ClientQuit => "client quit",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::LocalIdentity => "local identity",
            DisconnectReason::PingTimeout => "ping timeout",
        };
        f.write_str(s)
    }
}

/// Hello packet contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// P2P protocol version.
    pub protocol_version: u8,
    /// Client-version string, e.g. `ember/0.1.0`.
    pub client_version: String,
    /// Names of the capabilities this node speaks.
    pub capabilities: Vec<String>,
    /// Port the node accepts connections on; 0 when not listening.
    pub listen_port: u16,
    /// The node's identifier.
    pub node_id: NodeId,
}

/// A gossiped or persisted peer address: `[ipv4, port, node id]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSpec {
    pub endpoint: Endpoint,
    pub id: NodeId,
}

impl PeerSpec {
    pub fn new(endpoint: Endpoint, id: NodeId) -> Self {
        Self { endpoint, id }
    }

    fn payload_length(&self) -> usize {
        self.endpoint.address.octets().length()
            + self.endpoint.port.length()
            + self.id.length()
    }
}

impl Encodable for PeerSpec {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.payload_length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.endpoint.address.octets().encode(out);
        self.endpoint.port.encode(out);
        self.id.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length
            + Header {
                list: true,
                payload_length,
            }
            .length()
    }
}

impl Decodable for PeerSpec {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < header.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let mut body = &buf[..header.payload_length];
        *buf = &buf[header.payload_length..];

        let octets = <[u8; 4]>::decode(&mut body)?;
        let port = u16::decode(&mut body)?;
        let id = NodeId::decode(&mut body)?;
        if !body.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }

        Ok(Self {
            endpoint: Endpoint::new(Ipv4Addr::from(octets), port),
            id,
        })
    }
}

/// A decoded p2p packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Disconnect(DisconnectReason),
    Ping,
    Pong,
    GetPeers,
    Peers(Vec<PeerSpec>),
    /// A capability packet: absolute opcode plus the undecoded trailing
    /// items of the packet list.
    Capability { opcode: u8, body: Bytes },
}

/// Wrap already-encoded list items into a framed packet payload.
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

impl Message {
    /// Encode to a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut body = Vec::new();
        match self {
            Message::Hello(h) => {
                HELLO_PACKET.encode(&mut body);
                h.protocol_version.encode(&mut body);
                h.client_version.encode(&mut body);
                h.capabilities.encode(&mut body);
                h.listen_port.encode(&mut body);
                h.node_id.encode(&mut body);
            }
            Message::Disconnect(reason) => {
                DISCONNECT_PACKET.encode(&mut body);
                (*reason as u8).encode(&mut body);
            }
            Message::Ping => PING_PACKET.encode(&mut body),
            Message::Pong => PONG_PACKET.encode(&mut body),
            Message::GetPeers => GET_PEERS_PACKET.encode(&mut body),
            Message::Peers(specs) => {
                PEERS_PACKET.encode(&mut body);
                for spec in specs {
                    spec.encode(&mut body);
                }
            }
            Message::Capability { opcode, body: raw } => {
                opcode.encode(&mut body);
                body.extend_from_slice(raw);
            }
        }
        finish_packet(body)
    }

    /// Decode a frame payload.
    pub fn decode(payload: &[u8]) -> NetworkResult<Message> {
        let mut buf = payload;
        let header = Header::decode(&mut buf)?;
        if !header.list {
            return Err(NetworkError::BadProtocol("packet is not a list".into()));
        }
        if buf.len() != header.payload_length {
            return Err(NetworkError::BadProtocol(
                "packet length does not match list header".into(),
            ));
        }

        let mut body = buf;
        let opcode = u8::decode(&mut body)?;
        let message = match opcode {
            HELLO_PACKET => {
                let hello = Hello {
                    protocol_version: u8::decode(&mut body)?,
                    client_version: String::decode(&mut body)?,
                    capabilities: Vec::<String>::decode(&mut body)?,
                    listen_port: u16::decode(&mut body)?,
                    node_id: NodeId::decode(&mut body)?,
                };
                Message::Hello(hello)
            }
            DISCONNECT_PACKET => {
                // An empty reason defaults to "requested".
                let reason = if body.is_empty() {
                    DisconnectReason::DisconnectRequested
                } else {
                    let code = u8::decode(&mut body)?;
                    DisconnectReason::from_code(code)
                        .unwrap_or(DisconnectReason::DisconnectRequested)
                };
                Message::Disconnect(reason)
            }
            PING_PACKET => Message::Ping,
            PONG_PACKET => Message::Pong,
            GET_PEERS_PACKET => Message::GetPeers,
            PEERS_PACKET => {
                let mut specs = Vec::new();
                while !body.is_empty() {
                    specs.push(PeerSpec::decode(&mut body)?);
                }
                Message::Peers(specs)
            }
            op if op >= CAPABILITY_OFFSET => Message::Capability {
                opcode: op,
                body: Bytes::copy_from_slice(body),
            },
            op => {
                return Err(NetworkError::BadProtocol(format!(
                    "unknown p2p packet 0x{:02x}",
                    op
                )))
            }
        };

        if !matches!(
            message,
            Message::Capability { .. } | Message::Peers(_) | Message::Disconnect(_)
        ) && !body.is_empty()
        {
            return Err(NetworkError::BadProtocol(
                "trailing bytes after packet fields".into(),
            ));
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        Message::decode(&msg.encode()).unwrap()
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Message::Hello(Hello {
            protocol_version: 2,
            client_version: "ember/0.1.0".to_string(),
            capabilities: vec!["eth".to_string()],
            listen_port: 30303,
            node_id: NodeId::random(),
        });
        assert_eq!(roundtrip(hello.clone()), hello);
    }

    #[test]
    fn test_simple_packets_roundtrip() {
        for msg in [Message::Ping, Message::Pong, Message::GetPeers] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let msg = Message::Disconnect(DisconnectReason::TooManyPeers);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_peers_roundtrip() {
        let specs = vec![
            PeerSpec::new(
                Endpoint::new(Ipv4Addr::new(93, 184, 216, 34), 30303),
                NodeId::random(),
            ),
            PeerSpec::new(
                Endpoint::new(Ipv4Addr::new(10, 0, 0, 7), 30304),
                NodeId::random(),
            ),
        ];
        let msg = Message::Peers(specs.clone());
        match roundtrip(msg) {
            Message::Peers(decoded) => assert_eq!(decoded, specs),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_capability_passthrough() {
        let msg = Message::Capability {
            opcode: CAPABILITY_OFFSET + 3,
            body: Bytes::from_static(&[0x82, 0xab, 0xcd]),
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_unknown_control_opcode_rejected() {
        let msg = Message::Capability {
            opcode: 0x0e,
            body: Bytes::new(),
        };
        // 0x0e is inside the reserved control range but not a known packet.
        assert!(matches!(
            Message::decode(&msg.encode()),
            Err(NetworkError::BadProtocol(_))
        ));
    }

    #[test]
    fn test_non_list_payload_rejected() {
        let mut buf = Vec::new();
        "not a packet".to_string().encode(&mut buf);
        assert!(matches!(
            Message::decode(&buf),
            Err(NetworkError::BadProtocol(_))
        ));
    }

    #[test]
    fn test_disconnect_reason_codes() {
        for code in 0u8..=11 {
            let reason = DisconnectReason::from_code(code).unwrap();
            assert_eq!(reason as u8, code);
        }
        assert!(DisconnectReason::from_code(12).is_none());
    }
}
