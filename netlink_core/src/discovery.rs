//! LAN peer discovery over UDP beacons.
//!
//! Every instance runs a listener and a reaper, and optionally a beacon
//! sender. Beacons are JSON [`Beacon`] objects sent to a multicast group,
//! the broadcast address, and any static unicast targets. Peers that stop
//! beaconing are evicted after [`PEER_TIMEOUT`].

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Beacon;
use crate::error::DiscoveryError;
use crate::transfer::TRANSFER_PORT;

pub const DISCOVERY_PORT: u16 = 5007;
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);
pub const MULTICAST_TTL: u32 = 2;
pub const BEACON_INTERVAL: Duration = Duration::from_secs(1);
/// Must exceed [`BEACON_INTERVAL`] so one lost beacon is tolerated
pub const PEER_TIMEOUT: Duration = Duration::from_secs(4);

const MAX_DATAGRAM: usize = 2048;

/// Invoked when a peer joins or leaves, never on a plain heartbeat.
pub type PeerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Name announced to peers; also used to drop our own beacons
    pub name: String,
    /// Transfer port announced in beacons
    pub transfer_port: u16,
    /// UDP port beacons are sent to and received on
    pub discovery_port: u16,
    /// Send beacons at all (the listener always runs)
    pub announce: bool,
    pub multicast: bool,
    pub broadcast: bool,
    /// Extra unicast destinations for beacons
    pub static_targets: Vec<SocketAddr>,
    pub beacon_interval: Duration,
    pub peer_timeout: Duration,
    /// Address to announce; detected when `None`
    pub local_ip: Option<Ipv4Addr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            transfer_port: TRANSFER_PORT,
            discovery_port: DISCOVERY_PORT,
            announce: true,
            multicast: true,
            broadcast: true,
            static_targets: Vec::new(),
            beacon_interval: BEACON_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
            local_ip: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn new(name: impl Into<String>, transfer_port: u16) -> Self {
        Self {
            name: name.into(),
            transfer_port,
            ..Self::default()
        }
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }

    /// Skip multicast entirely, for networks that drop it.
    pub fn broadcast_only(mut self) -> Self {
        self.multicast = false;
        self.broadcast = true;
        self
    }

    pub fn with_multicast(mut self, enabled: bool) -> Self {
        self.multicast = enabled;
        self
    }

    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    pub fn with_static_target(mut self, target: SocketAddr) -> Self {
        self.static_targets.push(target);
        self
    }

    pub fn with_beacon_interval(mut self, interval: Duration) -> Self {
        self.beacon_interval = interval;
        self
    }

    /// Eviction timeout. See [`effective_peer_timeout`](Self::effective_peer_timeout).
    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// Timeout the reaper actually uses.
    ///
    /// It must outlast one missed beacon, so anything not above the beacon
    /// interval is raised to twice the interval.
    pub fn effective_peer_timeout(&self) -> Duration {
        if self.peer_timeout > self.beacon_interval {
            self.peer_timeout
        } else {
            self.beacon_interval * 2
        }
    }

    pub fn with_local_ip(mut self, ip: Ipv4Addr) -> Self {
        self.local_ip = Some(ip);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub ip: String,
    pub port: u16,
    pub last_seen: Instant,
}

/// Peers keyed by name. Readers always get copies.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<String, PeerInfo>>,
}

impl PeerTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerInfo>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or refresh a peer. Returns `true` if the name was new.
    pub fn upsert(&self, name: &str, ip: String, port: u16, now: Instant) -> bool {
        let info = PeerInfo {
            ip,
            port,
            last_seen: now,
        };
        self.lock().insert(name.to_string(), info).is_none()
    }

    /// Drop peers not seen for more than `timeout`. Returns the removed names.
    pub fn reap(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut peers = self.lock();
        let stale: Vec<String> = peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            peers.remove(name);
        }
        stale
    }

    pub fn snapshot(&self) -> HashMap<String, PeerInfo> {
        self.lock().clone()
    }

    pub fn get(&self, name: &str) -> Option<PeerInfo> {
        self.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Decode one datagram. Anything that is not a beacon is an error.
pub fn parse_beacon(datagram: &[u8]) -> Result<Beacon, DiscoveryError> {
    Ok(serde_json::from_slice(datagram)?)
}

pub struct DiscoveryService {
    config: DiscoveryConfig,
    local_ip: Ipv4Addr,
    peers: Arc<PeerTable>,
    on_change: Option<PeerCallback>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    listen_port: Option<u16>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        let local_ip = config.local_ip.unwrap_or_else(detect_local_ip);
        Self {
            config,
            local_ip,
            peers: Arc::new(PeerTable::default()),
            on_change: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            listen_port: None,
        }
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Port the listener is bound to, once started.
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    /// Spawn the listener, the reaper and (if announcing) the beacon loop.
    ///
    /// Socket failures are logged; whatever could be set up keeps running.
    pub async fn start(&mut self) {
        if self.is_running() {
            return;
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        match bind_listener(self.config.discovery_port, self.local_ip) {
            Ok(socket) => {
                self.listen_port = socket.local_addr().ok().map(|a| a.port());
                self.tasks.push(tokio::spawn(listen_loop(
                    socket,
                    self.config.name.clone(),
                    self.peers.clone(),
                    self.on_change.clone(),
                    self.shutdown.clone(),
                )));
            }
            Err(e) => warn!(
                "Discovery listener could not bind port {}: {}",
                self.config.discovery_port, e
            ),
        }

        let peer_timeout = self.config.effective_peer_timeout();
        if peer_timeout != self.config.peer_timeout {
            warn!(
                "Peer timeout {:?} does not exceed beacon interval {:?}, using {:?}",
                self.config.peer_timeout, self.config.beacon_interval, peer_timeout
            );
        }
        self.tasks.push(tokio::spawn(reap_loop(
            self.peers.clone(),
            self.config.beacon_interval,
            peer_timeout,
            self.on_change.clone(),
            self.shutdown.clone(),
        )));

        if self.config.announce {
            match BeaconSender::new(&self.config, self.local_ip) {
                Ok(sender) => self.tasks.push(tokio::spawn(beacon_loop(
                    sender,
                    self.config.clone(),
                    self.local_ip,
                    self.shutdown.clone(),
                ))),
                Err(e) => warn!("Beacon socket unavailable, not announcing: {}", e),
            }
        }

        info!(
            "Discovery started as '{}' ({}:{}), listening on {:?}",
            self.config.name, self.local_ip, self.config.transfer_port, self.listen_port
        );
    }

    /// Stop all loops and wait for them. Their sockets are closed on exit.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Discovery task ended abnormally: {}", e);
            }
        }
        self.listen_port = None;
        info!("Discovery stopped");
    }

    /// Copy of the current peer table.
    pub fn peers(&self) -> HashMap<String, PeerInfo> {
        self.peers.snapshot()
    }

    /// `ip:port` of a named peer's transfer server.
    pub fn peer_addr(&self, name: &str) -> Option<SocketAddr> {
        let peer = self.peers.get(name)?;
        let ip: IpAddr = peer.ip.parse().ok()?;
        Some(SocketAddr::new(ip, peer.port))
    }

    /// Send one beacon right away, e.g. for a manual refresh.
    pub async fn send_beacon_once(&self) -> Result<(), DiscoveryError> {
        let mut sender = BeaconSender::new(&self.config, self.local_ip)?;
        let payload = encode_beacon(&self.config, self.local_ip)?;
        sender.send(&payload).await;
        Ok(())
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn detect_local_ip() -> Ipv4Addr {
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => ip,
        Ok(other) => {
            debug!("Ignoring non-IPv4 local address {}", other);
            Ipv4Addr::UNSPECIFIED
        }
        Err(e) => {
            warn!("Could not determine local IP: {}", e);
            Ipv4Addr::UNSPECIFIED
        }
    }
}

fn encode_beacon(config: &DiscoveryConfig, local_ip: Ipv4Addr) -> Result<Vec<u8>, DiscoveryError> {
    let beacon = Beacon::new(&config.name, &local_ip.to_string(), config.transfer_port);
    Ok(serde_json::to_vec(&beacon)?)
}

fn bind_listener(port: u16, local_ip: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "macos")]
    socket.set_reuse_port(true)?;

    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;

    // Loopback or unknown addresses join on the default interface
    let interface = if local_ip.is_loopback() {
        Ipv4Addr::UNSPECIFIED
    } else {
        local_ip
    };
    if let Err(e) = socket.join_multicast_v4(&MULTICAST_GROUP, &interface) {
        warn!(
            "Could not join multicast group {} on {}: {}, relying on broadcast",
            MULTICAST_GROUP, interface, e
        );
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Outgoing beacon socket plus the destinations still considered usable.
struct BeaconSender {
    socket: UdpSocket,
    multicast: Option<SocketAddr>,
    broadcast: Option<SocketAddr>,
    targets: Vec<SocketAddr>,
}

impl BeaconSender {
    fn new(config: &DiscoveryConfig, local_ip: Ipv4Addr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        let mut multicast: Option<SocketAddr> = config
            .multicast
            .then(|| SocketAddrV4::new(MULTICAST_GROUP, config.discovery_port).into());
        if multicast.is_some() {
            if let Err(e) = socket.set_multicast_ttl_v4(MULTICAST_TTL) {
                warn!("Multicast TTL not settable, disabling multicast: {}", e);
                multicast = None;
            } else if !local_ip.is_unspecified() && !local_ip.is_loopback() {
                // Best effort: pin the outgoing interface
                let _ = socket.set_multicast_if_v4(&local_ip);
            }
        }

        let mut broadcast: Option<SocketAddr> = config
            .broadcast
            .then(|| SocketAddrV4::new(Ipv4Addr::BROADCAST, config.discovery_port).into());
        if broadcast.is_some() {
            if let Err(e) = socket.set_broadcast(true) {
                warn!("SO_BROADCAST not settable, disabling broadcast: {}", e);
                broadcast = None;
            }
        }

        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket: UdpSocket::from_std(socket.into())?,
            multicast,
            broadcast,
            targets: config.static_targets.clone(),
        })
    }

    /// Send `payload` everywhere. A failing multicast or broadcast
    /// destination is disabled for the rest of this sender's life.
    async fn send(&mut self, payload: &[u8]) {
        if let Some(group) = self.multicast {
            if let Err(e) = self.socket.send_to(payload, group).await {
                warn!("Multicast beacon failed, switching to broadcast only: {}", e);
                self.multicast = None;
            }
        }

        if let Some(addr) = self.broadcast {
            if let Err(e) = self.socket.send_to(payload, addr).await {
                warn!("Broadcast beacon failed, disabling broadcast: {}", e);
                self.broadcast = None;
            }
        }

        for target in &self.targets {
            if let Err(e) = self.socket.send_to(payload, target).await {
                debug!("Beacon to {} failed: {}", target, e);
            }
        }
    }
}

async fn beacon_loop(
    mut sender: BeaconSender,
    config: DiscoveryConfig,
    local_ip: Ipv4Addr,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.beacon_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match encode_beacon(&config, local_ip) {
            Ok(payload) => sender.send(&payload).await,
            Err(e) => warn!("Could not encode beacon: {}", e),
        }
    }
    debug!("Beacon loop stopped");
}

async fn listen_loop(
    socket: UdpSocket,
    own_name: String,
    peers: Arc<PeerTable>,
    on_change: Option<PeerCallback>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, source) = match received {
            Ok(r) => r,
            // ICMP port unreachable from an earlier send, reported on Windows
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!("Discovery listener error, stopping: {}", e);
                break;
            }
        };

        let beacon = match parse_beacon(&buf[..len]) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", source, e);
                continue;
            }
        };
        if beacon.name == own_name {
            continue;
        }

        let ip = match beacon.ip.parse::<Ipv4Addr>() {
            Ok(ip) if !ip.is_unspecified() => beacon.ip,
            _ => source.ip().to_string(),
        };
        let joined = peers.upsert(&beacon.name, ip, beacon.port, Instant::now());
        if joined {
            info!("Peer joined: {} ({}:{})", beacon.name, source.ip(), beacon.port);
            if let Some(callback) = &on_change {
                callback();
            }
        }
    }
    debug!("Discovery listener stopped");
}

async fn reap_loop(
    peers: Arc<PeerTable>,
    interval: Duration,
    timeout: Duration,
    on_change: Option<PeerCallback>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let removed = peers.reap(Instant::now(), timeout);
        if removed.is_empty() {
            continue;
        }
        info!("Peers left: {}", removed.join(", "));
        if let Some(callback) = &on_change {
            callback();
        }
    }
}
