//! UDP peer discovery.
//!
//! A listening node answers every `PEERSYNC_DISCOVER` datagram with its
//! primary IPv4 address and replication port. A discovery round
//! broadcasts the token and registers every distinct answer as an
//! untrusted peer.

use crate::config::NetworkConfig;
use crate::error::SyncResult;
use crate::log::SyncLog;
use crate::peers::PeerRegistry;
use peersync_protocol::{DiscoveryAnnouncement, NewPeer, Peer, DISCOVERY_REQUEST};
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_DATAGRAM: usize = 512;

/// Returns this host's primary IPv4 address, or loopback if none is routable.
///
/// Connecting a UDP socket sends nothing; it only selects the outbound
/// interface.
pub fn local_ipv4() -> Ipv4Addr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .ok();
    match routed.map(|addr| addr.ip()) {
        Some(IpAddr::V4(ip)) if !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

/// Result of one discovery round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Well-formed answers received (including duplicates and our own).
    pub responses: usize,
    /// Peers registered for the first time.
    pub registered: Vec<Peer>,
}

/// Runs discovery rounds and the discovery listener.
#[derive(Clone)]
pub struct DiscoveryService {
    net: NetworkConfig,
    registry: PeerRegistry,
    log: SyncLog,
}

impl DiscoveryService {
    /// Creates the service.
    pub fn new(net: NetworkConfig, registry: PeerRegistry, log: SyncLog) -> Self {
        Self { net, registry, log }
    }

    /// Binds the discovery port and answers requests with `tcp_port`.
    pub fn spawn_listener(&self, tcp_port: u16) -> SyncResult<DiscoveryListener> {
        let socket = UdpSocket::bind(SocketAddr::new(self.net.bind_ip, self.net.discovery_port))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        let announcement = DiscoveryAnnouncement::new(local_ipv4(), tcp_port);
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let log = self.log.clone();
        let handle = thread::Builder::new()
            .name("peersync-discovery-listener".into())
            .spawn(move || answer_requests(&socket, &announcement, &flag, &log))?;

        self.log
            .info(format_args!("Discovery listener on UDP {local_addr}"));
        Ok(DiscoveryListener {
            shutdown,
            handle: Some(handle),
            local_addr,
        })
    }

    /// Broadcasts a request and registers every answer received within the
    /// discovery window. Answers carrying this node's own address are ignored.
    pub fn discover(&self, local_tcp_port: u16) -> SyncResult<DiscoveryReport> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.send_to(DISCOVERY_REQUEST.as_bytes(), self.net.broadcast_target)?;
        self.log.info(format_args!(
            "Discovery: request sent to {}",
            self.net.broadcast_target
        ));

        let own = DiscoveryAnnouncement::new(local_ipv4(), local_tcp_port);
        let deadline = Instant::now() + self.net.discovery_window;
        let mut seen = HashSet::new();
        let mut report = DiscoveryReport::default();
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(remaining))?;

            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(e.into()),
            };
            let announcement = match DiscoveryAnnouncement::parse(&buf[..len]) {
                Ok(a) => a,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "ignoring discovery datagram");
                    continue;
                }
            };
            report.responses += 1;
            if announcement == own || !seen.insert(announcement) {
                continue;
            }

            let peer = NewPeer::discovered(IpAddr::V4(announcement.ip), announcement.tcp_port);
            if let Some(peer) = self.registry.register(peer)? {
                self.log.info(format_args!("Discovery: new peer {peer}"));
                report.registered.push(peer);
            }
        }

        self.log.info(format_args!(
            "Discovery finished: {} responses, {} new peers",
            report.responses,
            report.registered.len()
        ));
        Ok(report)
    }
}

fn answer_requests(
    socket: &UdpSocket,
    announcement: &DiscoveryAnnouncement,
    shutdown: &AtomicBool,
    log: &SyncLog,
) {
    let reply = announcement.encode();
    let mut buf = [0u8; MAX_DATAGRAM];

    while !shutdown.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if !DiscoveryAnnouncement::is_request(&buf[..len]) {
                    continue;
                }
                tracing::debug!(%from, "answering discovery request");
                if let Err(e) = socket.send_to(&reply, from) {
                    log.warn(format_args!("Discovery reply to {from} failed: {e}"));
                }
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log.warn(format_args!("Discovery listener error: {e}"));
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    tracing::debug!("discovery listener stopped");
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Handle to a running discovery listener.
pub struct DiscoveryListener {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl DiscoveryListener {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the listener and waits for its thread.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        // wake the receive early
        let wake = SocketAddr::new(loopback_for(self.local_addr.ip()), self.local_addr.port());
        if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
            let _ = socket.send_to(b"", wake);
        }
        if handle.join().is_err() {
            tracing::error!("discovery listener thread panicked");
        }
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn loopback_for(ip: IpAddr) -> IpAddr {
    if ip.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLocalStore;

    fn service(broadcast: SocketAddr) -> (DiscoveryService, PeerRegistry) {
        let registry = PeerRegistry::new(Arc::new(MemoryLocalStore::new()));
        let net = NetworkConfig::new()
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_discovery_port(0)
            .with_broadcast_target(broadcast)
            .with_discovery_window(Duration::from_millis(400));
        let service = DiscoveryService::new(net, registry.clone(), SyncLog::disabled());
        (service, registry)
    }

    #[test]
    fn round_registers_listener_once() {
        let (responder, _) = service(SocketAddr::from(([127, 0, 0, 1], 9)));
        let mut listener = responder.spawn_listener(9150).unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listener.local_addr().port());

        let (client, registry) = service(target);
        let first = client.discover(9151).unwrap();
        assert_eq!(first.responses, 1);
        assert_eq!(first.registered.len(), 1);
        assert_eq!(first.registered[0].port, 9150);
        assert!(!first.registered[0].is_trusted);

        let second = client.discover(9151).unwrap();
        assert_eq!(second.responses, 1);
        assert!(second.registered.is_empty());
        assert_eq!(registry.all().unwrap().len(), 1);

        listener.stop();
    }

    #[test]
    fn own_announcement_is_ignored() {
        let (node, registry) = service(SocketAddr::from(([127, 0, 0, 1], 9)));
        let mut listener = node.spawn_listener(9160).unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listener.local_addr().port());
        let node = DiscoveryService::new(
            NetworkConfig::new()
                .with_broadcast_target(target)
                .with_discovery_window(Duration::from_millis(300)),
            registry.clone(),
            SyncLog::disabled(),
        );

        let report = node.discover(9160).unwrap();
        assert_eq!(report.responses, 1);
        assert!(report.registered.is_empty());
        assert!(registry.all().unwrap().is_empty());
        listener.stop();
    }

    #[test]
    fn silent_network_ends_at_window() {
        let (client, _) = service(SocketAddr::from(([127, 0, 0, 1], 9)));
        let started = Instant::now();
        let report = client.discover(9170).unwrap();
        assert_eq!(report, DiscoveryReport::default());
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn listener_stops_promptly() {
        let (node, _) = service(SocketAddr::from(([127, 0, 0, 1], 9)));
        let mut listener = node.spawn_listener(9180).unwrap();
        let started = Instant::now();
        listener.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
