//! UDP discovery payloads.
//!
//! A request is the bare token; a response is `TOKEN:<ipv4>:<tcpPort>`.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Token sent to the broadcast address to ask nodes to announce themselves.
pub const DISCOVERY_REQUEST: &str = "PEERSYNC_DISCOVER";

/// A node's answer to a discovery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryAnnouncement {
    /// Address of the announcing node.
    pub ip: Ipv4Addr,
    /// Port of the node's replication listener.
    pub tcp_port: u16,
}

impl DiscoveryAnnouncement {
    /// Creates an announcement.
    pub fn new(ip: Ipv4Addr, tcp_port: u16) -> Self {
        Self { ip, tcp_port }
    }

    /// Returns true if `payload` is a discovery request.
    pub fn is_request(payload: &[u8]) -> bool {
        trim_payload(payload) == DISCOVERY_REQUEST.as_bytes()
    }

    /// Encodes the announcement as a datagram payload.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parses a datagram payload.
    pub fn parse(payload: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(trim_payload(payload))
            .map_err(|_| ProtocolError::MalformedDiscovery("payload is not UTF-8".into()))?;

        let mut parts = text.splitn(3, ':');
        let token = parts.next().unwrap_or_default();
        if token != DISCOVERY_REQUEST {
            return Err(ProtocolError::MalformedDiscovery(format!(
                "unexpected token in {text:?}"
            )));
        }

        let ip = parts
            .next()
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .ok_or_else(|| ProtocolError::MalformedDiscovery(format!("bad address in {text:?}")))?;

        let tcp_port = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|port| *port != 0)
            .ok_or_else(|| ProtocolError::MalformedDiscovery(format!("bad port in {text:?}")))?;

        Ok(Self { ip, tcp_port })
    }

    /// Socket address of the announced replication listener.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.tcp_port)
    }
}

impl fmt::Display for DiscoveryAnnouncement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", DISCOVERY_REQUEST, self.ip, self.tcp_port)
    }
}

fn trim_payload(payload: &[u8]) -> &[u8] {
    let end = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
        .map_or(0, |i| i + 1);
    &payload[..end]
}
