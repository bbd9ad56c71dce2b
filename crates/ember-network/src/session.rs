//! One TCP session: Hello exchange, frame loop, packet dispatch.
//!
//! Each session runs as its own task and owns its socket. The host only
//! keeps a weak handle; the session drops itself when the socket closes.

use crate::capability::PeerCapabilityEntry;
use crate::codec::FrameCodec;
use crate::host::Host;
use crate::message::{DisconnectReason, Hello, Message};
use crate::peer::{Endpoint, NodeId, PeerInfo};
use crate::{NetworkError, NetworkResult};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

/// How long the Hello exchange may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Inactivity before we probe the peer.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Inactivity after which the session gives up.
const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive check cadence.
const KEEPALIVE_CHECK: Duration = Duration::from_secs(2);

/// Writer-side commands queued on a session.
pub(crate) enum Outgoing {
    Packet(Bytes),
    Disconnect(DisconnectReason),
}

/// Shared state of a live session. Owned by the session task; everything
/// else holds `Weak` or clones of the writer queue.
pub struct SessionHandle {
    endpoint: Endpoint,
    node_id: Mutex<Option<NodeId>>,
    client_version: Mutex<String>,
    listen_port: AtomicU16,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    ping_sent: Mutex<Option<Instant>>,
    last_ping: Mutex<Option<Duration>>,
    rating: AtomicI32,
    open: AtomicBool,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl SessionHandle {
    fn new(endpoint: Endpoint, tx: mpsc::UnboundedSender<Outgoing>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            node_id: Mutex::new(None),
            client_version: Mutex::new(String::new()),
            listen_port: AtomicU16::new(0),
            connected_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            ping_sent: Mutex::new(None),
            last_ping: Mutex::new(None),
            rating: AtomicI32::new(0),
            open: AtomicBool::new(true),
            tx,
        })
    }

    /// Remote socket endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Node id, known once the Hello exchange completed.
    pub fn node_id(&self) -> Option<NodeId> {
        *self.node_id.lock()
    }

    /// Listen port the peer advertised; 0 when unknown.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn rating(&self) -> i32 {
        self.rating.load(Ordering::Relaxed)
    }

    pub fn rate(&self, delta: i32) {
        self.rating.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Queue a frame payload for the writer. False once closed.
    pub fn send_payload(&self, payload: Bytes) -> bool {
        self.is_open() && self.tx.send(Outgoing::Packet(payload)).is_ok()
    }

    /// Queue a control message.
    pub fn send_message(&self, message: &Message) -> bool {
        self.send_payload(message.encode())
    }

    /// Request an orderly disconnect. Idempotent; the session counts as
    /// dead from this point on.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outgoing::Disconnect(reason));
        }
    }

    /// Send a Ping and note the send time for round-trip measurement.
    pub fn ping(&self) {
        *self.ping_sent.lock() = Some(Instant::now());
        self.send_message(&Message::Ping);
    }

    /// Snapshot for `Host::peers`.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.node_id().unwrap_or_else(NodeId::zero),
            client_version: self.client_version.lock().clone(),
            endpoint: self.endpoint,
            listen_port: self.listen_port(),
            last_ping: *self.last_ping.lock(),
            rating: self.rating(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn note_pong(&self) {
        if let Some(sent) = self.ping_sent.lock().take() {
            *self.last_ping.lock() = Some(sent.elapsed());
        }
    }

    fn note_hello(&self, hello: &Hello) {
        *self.node_id.lock() = Some(hello.node_id);
        *self.client_version.lock() = hello.client_version.clone();
        self.listen_port
            .store(hello.listen_port, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn test_set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(endpoint: Endpoint, age: Duration, rating: i32) -> Arc<Self> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            endpoint,
            node_id: Mutex::new(None),
            client_version: Mutex::new(String::new()),
            listen_port: AtomicU16::new(0),
            connected_at: Instant::now() - age,
            last_activity: Mutex::new(Instant::now()),
            ping_sent: Mutex::new(None),
            last_ping: Mutex::new(None),
            rating: AtomicI32::new(rating),
            open: AtomicBool::new(true),
            tx,
        })
    }
}

/// Run a session to completion. `stream` is a freshly accepted or freshly
/// connected socket.
pub(crate) async fn run(host: Arc<Host>, stream: TcpStream, dialed: bool) {
    let endpoint = stream
        .peer_addr()
        .ok()
        .and_then(Endpoint::from_socket_addr)
        .unwrap_or_else(Endpoint::unspecified);

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle::new(endpoint, tx);
    let mut framed = Framed::new(stream, FrameCodec::new());

    debug!(peer = %endpoint, dialed, "Session starting");

    match handshake(&host, &handle, &mut framed).await {
        Ok(handlers) => {
            frame_loop(&host, &handle, framed, rx, handlers).await;
        }
        Err(e) => {
            debug!(peer = %endpoint, error = %e, "Handshake failed");
            if !matches!(e, NetworkError::DisconnectRequested(_)) {
                let goodbye = Message::Disconnect(e.disconnect_reason());
                let _ = framed.send(goodbye.encode()).await;
            }
        }
    }

    handle.open.store(false, Ordering::SeqCst);
    if let Some(id) = handle.node_id() {
        host.unregister_peer(id, &handle);
    }
    debug!(peer = %endpoint, "Session closed");
}

/// Exchange Hello packets and negotiate capabilities.
async fn handshake(
    host: &Arc<Host>,
    handle: &Arc<SessionHandle>,
    framed: &mut Framed<TcpStream, FrameCodec>,
) -> NetworkResult<Vec<PeerCapabilityEntry>> {
    framed.send(host.hello().encode()).await?;

    let hello = loop {
        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| NetworkError::HandshakeFailed("hello timeout".into()))?
            .ok_or_else(|| NetworkError::HandshakeFailed("closed before hello".into()))??;

        match Message::decode(&frame)? {
            Message::Hello(hello) => break hello,
            Message::Disconnect(reason) => {
                return Err(NetworkError::DisconnectRequested(reason));
            }
            other => {
                return Err(NetworkError::BadProtocol(format!(
                    "expected hello, got {:?}",
                    other
                )))
            }
        }
    };

    handle.note_hello(&hello);

    // Registration checks identity and duplicates, and builds the
    // per-session capability handlers with their opcode windows.
    let mut handlers = host.register_peer(handle, &hello)?;
    for index in 0..handlers.len() {
        if let Err(e) = handlers[index].handler.on_connected() {
            for entry in &mut handlers {
                entry.handler.on_disconnected();
            }
            return Err(e);
        }
    }

    debug!(
        peer = %hello.node_id,
        client = %hello.client_version,
        caps = hello.capabilities.len(),
        "Handshake complete"
    );
    Ok(handlers)
}

/// The post-handshake frame loop: single reader, single writer.
async fn frame_loop(
    host: &Arc<Host>,
    handle: &Arc<SessionHandle>,
    framed: Framed<TcpStream, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut handlers: Vec<PeerCapabilityEntry>,
) {
    let (mut sink, mut stream) = framed.split();
    let mut keepalive = tokio::time::interval(KEEPALIVE_CHECK);

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(payload)) => {
                        handle.touch();
                        match handle_packet(host, handle, &mut handlers, &payload) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                warn!(peer = %handle.endpoint(), error = %e, "Packet error");
                                let reason = e.disconnect_reason();
                                let _ = sink.send(Message::Disconnect(reason).encode()).await;
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(peer = %handle.endpoint(), error = %e, "Receive error");
                        let _ = sink
                            .send(Message::Disconnect(e.disconnect_reason()).encode())
                            .await;
                        break;
                    }
                    None => {
                        debug!(peer = %handle.endpoint(), "Connection closed by peer");
                        break;
                    }
                }
            }

            outgoing = rx.recv() => {
                match outgoing {
                    Some(Outgoing::Packet(payload)) => {
                        if sink.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Some(Outgoing::Disconnect(reason)) => {
                        debug!(peer = %handle.endpoint(), %reason, "Disconnecting");
                        let _ = sink.send(Message::Disconnect(reason).encode()).await;
                        break;
                    }
                    None => break,
                }
            }

            _ = keepalive.tick() => {
                let idle = handle.idle_for();
                if idle > PING_TIMEOUT {
                    debug!(peer = %handle.endpoint(), "Ping timeout");
                    let _ = sink
                        .send(Message::Disconnect(DisconnectReason::PingTimeout).encode())
                        .await;
                    break;
                }
                if idle > PING_INTERVAL {
                    handle.ping();
                }
            }
        }
    }

    handle.open.store(false, Ordering::SeqCst);
    for entry in &mut handlers {
        entry.handler.on_disconnected();
    }
}

/// Dispatch one decoded frame. `Ok(false)` ends the session cleanly.
fn handle_packet(
    host: &Arc<Host>,
    handle: &Arc<SessionHandle>,
    handlers: &mut [PeerCapabilityEntry],
    payload: &[u8],
) -> NetworkResult<bool> {
    match Message::decode(payload)? {
        Message::Hello(_) => {
            return Err(NetworkError::BadProtocol("unexpected second hello".into()))
        }
        Message::Disconnect(reason) => {
            debug!(peer = %handle.endpoint(), %reason, "Peer disconnected us");
            return Ok(false);
        }
        Message::Ping => {
            handle.send_message(&Message::Pong);
        }
        Message::Pong => handle.note_pong(),
        Message::GetPeers => {
            let specs = host.potential_peers();
            trace!(peer = %handle.endpoint(), count = specs.len(), "Answering GetPeers");
            handle.send_message(&Message::Peers(specs));
        }
        Message::Peers(specs) => {
            host.note_peers(&specs);
        }
        Message::Capability { opcode, body } => {
            let Some(entry) = handlers.iter_mut().find(|h| h.covers(opcode)) else {
                return Err(NetworkError::BadProtocol(format!(
                    "packet 0x{:02x} outside negotiated capabilities",
                    opcode
                )));
            };
            entry.handler.on_packet(opcode - entry.base, &body)?;
        }
    }
    Ok(true)
}
