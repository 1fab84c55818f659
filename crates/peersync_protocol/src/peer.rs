//! Known remote installations.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Reachability of a peer as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Last exchange succeeded.
    Online,
    /// Last exchange failed.
    Offline,
    /// An exchange is in progress.
    Syncing,
    /// Never contacted.
    Unknown,
}

impl PeerStatus {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Online => "Online",
            PeerStatus::Offline => "Offline",
            PeerStatus::Syncing => "Syncing",
            PeerStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(PeerStatus::Online),
            "offline" => Ok(PeerStatus::Offline),
            "syncing" => Ok(PeerStatus::Syncing),
            "unknown" => Ok(PeerStatus::Unknown),
            _ => Err(ProtocolError::unknown("peer status", s)),
        }
    }
}

/// A remote installation reachable for direct replication.
///
/// The `(ip_address, port)` pair is unique across the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Registry id.
    pub id: u64,
    /// Address of the peer's replication listener.
    pub ip_address: IpAddr,
    /// TCP port of the peer's replication listener.
    pub port: u16,
    /// Start time (Unix millis) of the last successful exchange.
    pub last_sync_time: Option<u64>,
    /// Whether scheduled cycles may exchange with this peer.
    pub is_trusted: bool,
    /// Last observed reachability.
    pub status: PeerStatus,
}

impl Peer {
    /// Socket address of the peer's replication listener.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }

    /// Returns true if this peer lives at the given endpoint.
    pub fn matches(&self, ip_address: IpAddr, port: u16) -> bool {
        self.ip_address == ip_address && self.port == port
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip_address, self.port)
    }
}

/// A peer before the registry assigns it an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewPeer {
    /// Listener address.
    pub ip_address: IpAddr,
    /// Listener port.
    pub port: u16,
    /// Initial trust.
    pub is_trusted: bool,
}

impl NewPeer {
    /// Creates a new peer description.
    pub fn new(ip_address: IpAddr, port: u16, is_trusted: bool) -> Self {
        Self {
            ip_address,
            port,
            is_trusted,
        }
    }

    /// Creates an untrusted peer, as discovery does on first contact.
    pub fn discovered(ip_address: IpAddr, port: u16) -> Self {
        Self::new(ip_address, port, false)
    }

    /// Materializes the peer with its assigned id.
    pub fn into_peer(self, id: u64) -> Peer {
        Peer {
            id,
            ip_address: self.ip_address,
            port: self.port,
            last_sync_time: None,
            is_trusted: self.is_trusted,
            status: PeerStatus::Unknown,
        }
    }
}
