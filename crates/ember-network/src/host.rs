//! The P2P host: accept/dial lifecycle, peer set, gossip, maintenance.

use crate::capability::{Capability, PacketSink, PeerCapabilityEntry, PeerLink};
use crate::discovery::HostAddresses;
use crate::message::{DisconnectReason, Hello, Message, PeerSpec, CAPABILITY_OFFSET};
use crate::nat::{self, NatMapping};
use crate::peer::{Endpoint, IncomingPeer, NodeId, PeerInfo};
use crate::session::{self, SessionHandle};
use crate::{NetworkError, NetworkResult};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// P2P protocol version spoken in the Hello exchange.
pub const P2P_PROTOCOL_VERSION: u8 = 2;

/// Maintenance worker cadence.
const WORKER_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum gap between GetPeers broadcasts.
const PEERS_REQUEST_INTERVAL: Duration = Duration::from_secs(10);

/// Give up dialing a remembered peer after this many attempts.
const MAX_DIAL_ATTEMPTS: u32 = 3;

/// Starting "old enough to kick" threshold for pruning, in milliseconds.
const PRUNE_AGE_START_MS: u64 = 15_000;

/// Pruning age floor, in milliseconds.
const PRUNE_AGE_FLOOR_MS: u64 = 100;

/// Shutdown drain cap: 100 ms polls.
const SHUTDOWN_DRAIN_ROUNDS: u32 = 50;

/// Network preferences, as handed in by the operator.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Port to listen on; 0 for ephemeral.
    pub listen_port: u16,
    /// Operator-declared public IP; empty means "figure it out".
    pub public_ip: String,
    /// Attempt a UPnP mapping on startup.
    pub upnp: bool,
    /// Gossip and accept private-network addresses.
    pub local_networking: bool,
    /// Target live-peer count; the host keeps peers in [ideal, 2·ideal].
    pub ideal_peer_count: usize,
    /// Client-version string advertised in the Hello.
    pub client_version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_port: 30303,
            public_ip: String::new(),
            upnp: true,
            local_networking: false,
            ideal_peer_count: 5,
            client_version: format!("ember/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Tables guarded together: the peer map, the remembered incoming peers,
/// and the queue of ids eligible to dial.
#[derive(Default)]
struct PeerTables {
    peers: HashMap<NodeId, Weak<SessionHandle>>,
    incoming: HashMap<NodeId, IncomingPeer>,
    free: Vec<NodeId>,
    last_peers_request: Option<Instant>,
}

impl PeerTables {
    /// Drop entries whose sessions are gone.
    fn collect_dead(&mut self) {
        self.peers.retain(|_, weak| weak.upgrade().is_some());
    }

    fn live_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.peers
            .values()
            .filter_map(Weak::upgrade)
            .filter(|s| s.is_open())
            .collect()
    }
}

/// The P2P host.
pub struct Host {
    config: HostConfig,
    node_id: NodeId,
    addresses: HostAddresses,
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
    tables: Mutex<PeerTables>,
    listen_port: AtomicU16,
    public: Mutex<Option<Endpoint>>,
    nat: Mutex<Option<NatMapping>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Create a host. Enumerates local interfaces; fails with
    /// `NoNetworking` when none exist.
    pub fn new(config: HostConfig) -> NetworkResult<Self> {
        let addresses = HostAddresses::discover()?;
        let node_id = NodeId::random();
        info!(id = %node_id, "Host id");

        Ok(Self {
            config,
            node_id,
            addresses,
            capabilities: BTreeMap::new(),
            tables: Mutex::new(PeerTables::default()),
            listen_port: AtomicU16::new(0),
            public: Mutex::new(None),
            nat: Mutex::new(None),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register a capability. Must happen before `start`.
    pub fn register_capability(&mut self, cap: Arc<dyn Capability>) {
        self.capabilities.insert(cap.name().to_string(), cap);
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The port actually bound, once started.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    /// The public endpoint, if one could be determined.
    pub fn public_endpoint(&self) -> Option<Endpoint> {
        *self.public.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Our Hello packet.
    pub(crate) fn hello(&self) -> Message {
        Message::Hello(Hello {
            protocol_version: P2P_PROTOCOL_VERSION,
            client_version: self.config.client_version.clone(),
            capabilities: self.capabilities.keys().cloned().collect(),
            listen_port: self.listen_port(),
            node_id: self.node_id,
        })
    }

    /// Start listening, determine the public endpoint, begin maintenance.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Bind the configured port; fall back once to an ephemeral one.
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.listen_port))
            .await
        {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    port = self.config.listen_port,
                    error = %e,
                    "Listen port unavailable, retrying on an ephemeral port"
                );
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?
            }
        };
        let bound = listener.local_addr()?.port();
        self.listen_port.store(bound, Ordering::Relaxed);
        info!(port = bound, "Listening");

        self.determine_public().await;

        for cap in self.capabilities.values() {
            cap.on_starting();
        }

        let accept_host = Arc::clone(self);
        let accept = tokio::spawn(async move { accept_host.accept_loop(listener).await });
        let worker_host = Arc::clone(self);
        let worker = tokio::spawn(async move { worker_host.worker().await });
        let mut tasks = self.tasks.lock();
        tasks.push(accept);
        tasks.push(worker);

        Ok(())
    }

    /// Orderly shutdown: stop capabilities, cancel the acceptor, drain
    /// sessions with ClientQuit, release the NAT mapping.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for cap in self.capabilities.values() {
            cap.on_stopping();
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        for round in 0..SHUTDOWN_DRAIN_ROUNDS {
            let remaining: Vec<_> = {
                let tables = self.tables.lock();
                tables.peers.values().filter_map(Weak::upgrade).collect()
            };
            if remaining.is_empty() {
                break;
            }
            for session in &remaining {
                session.disconnect(DisconnectReason::ClientQuit);
            }
            if round + 1 == SHUTDOWN_DRAIN_ROUNDS {
                warn!(count = remaining.len(), "Sessions still alive after drain");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.tables.lock().peers.clear();

        let mapping = self.nat.lock().take();
        if let Some(mapping) = mapping {
            nat::unmap_port(mapping).await;
        }
        info!("Host stopped");
    }

    /// UPnP, operator override, then the first discovered peer address.
    async fn determine_public(&self) {
        let listen_port = self.listen_port();
        let declared: Option<Ipv4Addr> = match self.config.public_ip.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                if !self.config.public_ip.is_empty() {
                    warn!(ip = %self.config.public_ip, "Ignoring unparseable public IP");
                }
                None
            }
        };

        if self.config.upnp {
            if let Some(&local) = self.addresses.peer_addresses.first() {
                match nat::map_port(local, listen_port).await {
                    Ok(mapping) => {
                        let port = mapping.external_port;
                        let public = if mapping.external_unspecified() && declared.is_none() {
                            // Router does not know its WAN address and the
                            // operator declared none: never gossiped.
                            None
                        } else {
                            Some(Endpoint::new(
                                declared.unwrap_or(mapping.external_ip),
                                port,
                            ))
                        };
                        *self.public.lock() = public;
                        *self.nat.lock() = Some(mapping);
                        return;
                    }
                    Err(e) => debug!(error = %e, "UPnP unavailable"),
                }
            }
        }

        let address = declared.or_else(|| self.addresses.peer_addresses.first().copied());
        *self.public.lock() = address.map(|ip| Endpoint::new(ip, listen_port));
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(from = %addr, "Accepted connection");
                    let host = Arc::clone(&self);
                    tokio::spawn(session::run(host, stream, false));
                }
                Err(e) => {
                    if !self.is_running() {
                        break;
                    }
                    // Transient accept failures re-arm the acceptor.
                    warn!(error = %e, "Accept error");
                }
            }
        }
    }

    /// Periodic maintenance: grow towards the ideal peer count, prune
    /// beyond twice the ideal, tick the capabilities.
    async fn worker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(WORKER_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !self.is_running() {
                break;
            }
            self.grow_peers();
            self.prune_peers();
            for cap in self.capabilities.values() {
                cap.tick();
            }
        }
    }

    /// Dial remembered peers while below the ideal count; with none left,
    /// ask the network for more at most once per ten seconds.
    fn grow_peers(self: &Arc<Self>) {
        loop {
            let dial = {
                let mut tables = self.tables.lock();
                tables.collect_dead();
                if tables.live_sessions().len() >= self.config.ideal_peer_count {
                    return;
                }

                if tables.free.is_empty() {
                    let due = tables
                        .last_peers_request
                        .map_or(true, |t| t.elapsed() > PEERS_REQUEST_INTERVAL);
                    if due {
                        let sessions = tables.live_sessions();
                        for session in sessions {
                            session.send_message(&Message::GetPeers);
                        }
                        tables.last_peers_request = Some(Instant::now());
                    }
                    return;
                }

                // Uniformly random pick from the free queue.
                let index = rand::thread_rng().gen_range(0..tables.free.len());
                let id = tables.free.swap_remove(index);
                let already_connected = tables
                    .peers
                    .get(&id)
                    .and_then(Weak::upgrade)
                    .map_or(false, |s| s.is_open());
                match tables.incoming.get_mut(&id) {
                    Some(entry) => {
                        entry.attempts += 1;
                        (!already_connected).then_some(entry.endpoint)
                    }
                    None => None,
                }
            };

            if let Some(endpoint) = dial {
                self.dial(endpoint);
            }
        }
    }

    /// Evict the worst peers once the live count exceeds twice the ideal,
    /// halving the "old enough to kick" age from 15 s down to 100 ms.
    /// Stops early at any threshold where too few sessions pass the age
    /// bar, so a burst of young connections survives until it ages.
    fn prune_peers(&self) {
        let ideal = self.config.ideal_peer_count;
        if self.peer_count() <= ideal * 2 {
            self.tables.lock().collect_dead();
            return;
        }

        let mut old_ms = PRUNE_AGE_START_MS;
        while old_ms > PRUNE_AGE_FLOOR_MS {
            loop {
                let live = self.tables.lock().live_sessions();
                if live.len() <= ideal {
                    break;
                }
                let now = Instant::now();
                let aged: Vec<_> = live
                    .into_iter()
                    .filter(|s| now.duration_since(s.connected_at()) > Duration::from_millis(old_ms))
                    .collect();
                if aged.len() <= ideal {
                    break;
                }

                // Lowest rating goes first; among equals the newest dies.
                let worst = aged
                    .into_iter()
                    .min_by(|a, b| {
                        a.rating()
                            .cmp(&b.rating())
                            .then(b.connected_at().cmp(&a.connected_at()))
                    })
                    .expect("aged set is non-empty");
                debug!(peer = %worst.endpoint(), rating = worst.rating(), "Evicting peer");
                worst.disconnect(DisconnectReason::TooManyPeers);
            }
            old_ms /= 2;
        }

        self.tables.lock().collect_dead();
    }

    /// Number of live sessions.
    pub fn peer_count(&self) -> usize {
        self.tables.lock().live_sessions().len()
    }

    /// Dial an endpoint. Failures re-queue remembered peers that have not
    /// exhausted their attempts.
    fn dial(self: &Arc<Self>, endpoint: Endpoint) {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            debug!(to = %endpoint, "Dialing");
            match TcpStream::connect(endpoint.to_socket_addr()).await {
                Ok(stream) => session::run(host, stream, true).await,
                Err(e) => {
                    debug!(to = %endpoint, error = %e, "Connection refused");
                    host.dial_failed(endpoint);
                }
            }
        });
    }

    fn dial_failed(&self, endpoint: Endpoint) {
        let mut tables = self.tables.lock();
        let requeue: Vec<NodeId> = tables
            .incoming
            .iter()
            .filter(|(_, peer)| peer.endpoint == endpoint && peer.attempts < MAX_DIAL_ATTEMPTS)
            .map(|(id, _)| *id)
            .collect();
        for id in requeue {
            if !tables.free.contains(&id) {
                tables.free.push(id);
            }
        }
    }

    /// Resolve and dial `address:port`. DNS first, then a literal parse.
    pub async fn connect(self: &Arc<Self>, address: &str, port: u16) {
        let resolved = match tokio::net::lookup_host((address, port)).await {
            Ok(mut addrs) => addrs.find_map(|a| match a {
                SocketAddr::V4(v4) => Some(Endpoint::new(*v4.ip(), v4.port())),
                SocketAddr::V6(_) => None,
            }),
            Err(_) => None,
        };
        let endpoint = resolved.or_else(|| {
            address
                .parse::<IpAddr>()
                .ok()
                .and_then(|ip| match ip {
                    IpAddr::V4(v4) => Some(Endpoint::new(v4, port)),
                    IpAddr::V6(_) => None,
                })
        });

        match endpoint {
            Some(ep) => self.dial(ep),
            None => warn!(address, port, "Bad host"),
        }
    }

    /// Register a session after its Hello. Rejects our own identity,
    /// all-zero ids, protocol mismatches, and duplicate node ids; on
    /// success returns the negotiated capability handlers.
    pub(crate) fn register_peer(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        hello: &Hello,
    ) -> NetworkResult<Vec<PeerCapabilityEntry>> {
        if hello.protocol_version != P2P_PROTOCOL_VERSION {
            return Err(NetworkError::Refused(DisconnectReason::IncompatibleProtocol));
        }
        if hello.node_id.is_zero() {
            return Err(NetworkError::Refused(DisconnectReason::NullIdentity));
        }
        if hello.node_id == self.node_id {
            return Err(NetworkError::Refused(DisconnectReason::LocalIdentity));
        }

        {
            let mut tables = self.tables.lock();
            tables.collect_dead();
            let duplicate = tables
                .peers
                .get(&hello.node_id)
                .and_then(Weak::upgrade)
                .map_or(false, |existing| existing.is_open());
            if duplicate {
                // The established session wins; the newer one is refused.
                return Err(NetworkError::DuplicatePeer);
            }
            tables.peers.insert(hello.node_id, Arc::downgrade(handle));
        }

        let mut handlers = Vec::new();
        let mut base = CAPABILITY_OFFSET;
        for (name, cap) in &self.capabilities {
            if hello.capabilities.iter().any(|c| c == name) {
                let link = PeerLink::new(hello.node_id, base, Arc::clone(handle) as Arc<dyn PacketSink>);
                handlers.push(PeerCapabilityEntry {
                    base,
                    count: cap.packet_count(),
                    handler: cap.new_peer(link),
                });
                base += cap.packet_count();
            }
        }

        info!(
            peer = %hello.node_id,
            client = %hello.client_version,
            caps = handlers.len(),
            "Registered peer"
        );
        Ok(handlers)
    }

    /// Forget a session, but only if the registry still points at it.
    pub(crate) fn unregister_peer(&self, id: NodeId, handle: &Arc<SessionHandle>) {
        let mut tables = self.tables.lock();
        if let Some(weak) = tables.peers.get(&id) {
            let same = weak
                .upgrade()
                .map_or(true, |current| Arc::ptr_eq(&current, handle));
            if same {
                tables.peers.remove(&id);
            }
        }
    }

    /// Record gossiped peer addresses for later dialing.
    pub(crate) fn note_peers(&self, specs: &[PeerSpec]) {
        let mut tables = self.tables.lock();
        for spec in specs {
            if spec.id == self.node_id || !spec.endpoint.is_routable() {
                continue;
            }
            if spec.endpoint.is_private() && !self.config.local_networking {
                continue;
            }
            if tables.incoming.contains_key(&spec.id) {
                continue;
            }
            debug!(peer = %spec.id, endpoint = %spec.endpoint, "Learned peer");
            tables.incoming.insert(spec.id, IncomingPeer::new(spec.endpoint));
            tables.free.push(spec.id);
        }
    }

    /// The peers worth gossiping right now: ourselves (when public), plus
    /// every live session with a non-zero listen port on an acceptable
    /// network. Falls back to remembered endpoints when the live one is
    /// unusable.
    pub fn potential_peers(&self) -> Vec<PeerSpec> {
        let mut out = Vec::new();
        if let Some(public) = self.public_endpoint() {
            if public.is_routable() {
                out.push(PeerSpec::new(public, self.node_id));
            }
        }

        let tables = self.tables.lock();
        for (id, weak) in &tables.peers {
            let Some(session) = weak.upgrade().filter(|s| s.is_open()) else {
                continue;
            };
            let listen_port = session.listen_port();
            let mut endpoint = Endpoint::new(session.endpoint().address, listen_port);
            let mut usable = listen_port != 0
                && (!endpoint.is_private() || self.config.local_networking);
            if !usable {
                if let Some(remembered) = tables.incoming.get(id) {
                    endpoint = remembered.endpoint;
                    usable = listen_port != 0
                        && (!endpoint.is_private() || self.config.local_networking);
                }
            }
            if usable && endpoint.port != 0 {
                out.push(PeerSpec::new(endpoint, *id));
            }
        }
        out
    }

    /// Snapshot of live sessions. With `update_ping`, pings them all first
    /// and gives the pongs 200 ms to fly back.
    pub async fn peers(&self, update_ping: bool) -> Vec<PeerInfo> {
        if update_ping {
            self.ping_all();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.tables
            .lock()
            .live_sessions()
            .iter()
            .map(|s| s.info())
            .collect()
    }

    /// Ping every live session.
    pub fn ping_all(&self) {
        for session in self.tables.lock().live_sessions() {
            session.ping();
        }
    }

    /// Whether a live session exists for `id`. Dead entries are collected
    /// on the way.
    pub fn have_peer(&self, id: NodeId) -> bool {
        let mut tables = self.tables.lock();
        tables.collect_dead();
        tables
            .peers
            .get(&id)
            .and_then(Weak::upgrade)
            .map_or(false, |s| s.is_open())
    }

    /// Serialize the live peer set as an RLP list of
    /// `[ipv4, port, node id]` triples.
    pub fn save_peers(&self) -> Bytes {
        let tables = self.tables.lock();
        let specs: Vec<PeerSpec> = tables
            .peers
            .iter()
            .filter_map(|(id, weak)| {
                let session = weak.upgrade().filter(|s| s.is_open())?;
                let port = session.listen_port();
                if port == 0 {
                    return None;
                }
                Some(PeerSpec::new(
                    Endpoint::new(session.endpoint().address, port),
                    *id,
                ))
            })
            .collect();
        Bytes::from(alloy_rlp::encode(&specs))
    }

    /// Ingest a previously saved peer list. Unknown node ids become
    /// dial candidates.
    pub fn restore_peers(&self, data: &[u8]) -> NetworkResult<()> {
        use alloy_rlp::Decodable;
        let specs = Vec::<PeerSpec>::decode(&mut &data[..])?;
        info!(count = specs.len(), "Restoring peers");
        self.note_peers(&specs);
        Ok(())
    }

    /// Attempt counts of remembered peers, keyed by node id.
    pub fn incoming_peers(&self) -> Vec<(NodeId, Endpoint, u32)> {
        self.tables
            .lock()
            .incoming
            .iter()
            .map(|(id, p)| (*id, p.endpoint, p.attempts))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_host(ideal: usize) -> Arc<Host> {
        let config = HostConfig {
            listen_port: 0,
            upnp: false,
            local_networking: true,
            ideal_peer_count: ideal,
            ..HostConfig::default()
        };
        Arc::new(Host {
            config,
            node_id: NodeId::random(),
            addresses: HostAddresses::from_addresses(vec![Ipv4Addr::new(127, 0, 0, 1)]),
            capabilities: BTreeMap::new(),
            tables: Mutex::new(PeerTables::default()),
            listen_port: AtomicU16::new(0),
            public: Mutex::new(None),
            nat: Mutex::new(None),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn insert_session(
        host: &Arc<Host>,
        age: Duration,
        rating: i32,
    ) -> (NodeId, Arc<SessionHandle>) {
        let id = NodeId::random();
        let endpoint = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 40000);
        let session = SessionHandle::new_for_test(endpoint, age, rating);
        host.tables
            .lock()
            .peers
            .insert(id, Arc::downgrade(&session));
        (id, session)
    }

    #[test]
    fn test_prune_keeps_earliest_connected() {
        let host = test_host(4);

        // Ten sessions, identical ratings, ages 20 s down to 2 s; the
        // four oldest must survive.
        let mut sessions = Vec::new();
        for i in 0..10u64 {
            let age = Duration::from_secs(20 - 2 * i);
            sessions.push(insert_session(&host, age, 0));
        }

        host.prune_peers();

        let alive: Vec<_> = sessions
            .iter()
            .filter(|(_, s)| s.is_open())
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(alive.len(), 4);
        let expected: Vec<_> = sessions[..4].iter().map(|(id, _)| *id).collect();
        assert_eq!(alive, expected);
    }

    #[test]
    fn test_prune_spares_young_sessions() {
        let host = test_host(2);

        // All sessions younger than the age floor: nothing may die even
        // though the count exceeds twice the ideal.
        let sessions: Vec<_> = (0..6)
            .map(|_| insert_session(&host, Duration::from_millis(10), 0))
            .collect();

        host.prune_peers();
        assert!(sessions.iter().all(|(_, s)| s.is_open()));
    }

    #[test]
    fn test_prune_prefers_low_rating() {
        let host = test_host(1);

        let (_, good) = insert_session(&host, Duration::from_secs(30), 50);
        let (_, bad) = insert_session(&host, Duration::from_secs(40), -5);
        let (_, worse) = insert_session(&host, Duration::from_secs(20), -5);

        host.prune_peers();

        // Three live, ideal one: pruning kicks the low-rated sessions and
        // the well-rated one survives.
        assert!(good.is_open());
        assert!(!bad.is_open());
        assert!(!worse.is_open());
    }

    #[test]
    fn test_have_peer_collects_dead_entries() {
        let host = test_host(4);
        let (id, session) = insert_session(&host, Duration::from_secs(1), 0);

        assert!(host.have_peer(id));
        drop(session);
        assert!(!host.have_peer(id));
        assert!(host.tables.lock().peers.is_empty());
    }

    #[test]
    fn test_note_peers_filters() {
        let host = test_host(4);
        let own = host.node_id();

        let good = PeerSpec::new(
            Endpoint::new(Ipv4Addr::new(127, 0, 0, 2), 30303),
            NodeId::random(),
        );
        let port_zero = PeerSpec::new(
            Endpoint::new(Ipv4Addr::new(127, 0, 0, 3), 0),
            NodeId::random(),
        );
        let ourselves = PeerSpec::new(Endpoint::new(Ipv4Addr::new(127, 0, 0, 4), 30303), own);

        host.note_peers(&[good, port_zero, ourselves]);

        let incoming = host.incoming_peers();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].0, good.id);
        assert_eq!(host.tables.lock().free.len(), 1);
    }

    #[test]
    fn test_note_peers_rejects_private_without_local_mode() {
        let mut host = test_host(4);
        Arc::get_mut(&mut host).unwrap().config.local_networking = false;

        let private = PeerSpec::new(
            Endpoint::new(Ipv4Addr::new(192, 168, 0, 9), 30303),
            NodeId::random(),
        );
        host.note_peers(&[private]);
        assert!(host.incoming_peers().is_empty());
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let host = test_host(4);
        let mut saved_ids = Vec::new();
        let mut keep = Vec::new();
        for _ in 0..5 {
            let (id, session) = insert_session(&host, Duration::from_secs(1), 0);
            session.test_set_listen_port(30303);
            saved_ids.push(id);
            keep.push(session);
        }

        let blob = host.save_peers();

        let other = test_host(4);
        other.restore_peers(&blob).unwrap();
        let restored: Vec<_> = other.incoming_peers().iter().map(|(id, _, _)| *id).collect();
        for id in &saved_ids {
            assert!(restored.contains(id));
        }
    }
}
