//! Peer-to-peer replication over TCP.
//!
//! One exchange is one connection carrying one [`ExchangeRequest`] and one
//! [`ExchangeResponse`]. The client side lives in [`client`], the server
//! side in [`listener`].

mod client;
mod frame;
mod listener;

pub use client::{ExchangeSummary, PeerExchanger};
pub use frame::{read_message, write_message};
pub use listener::{ExchangeHandler, PeerListener};

use crate::error::{SyncError, SyncResult};
use peersync_protocol::{ExchangeRequest, ExchangeResponse, PeerMessage};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Carries one exchange to a peer.
pub trait PeerTransport: Send + Sync {
    /// Sends `request` to `addr` and returns the peer's response.
    fn exchange(&self, addr: SocketAddr, request: ExchangeRequest) -> SyncResult<ExchangeResponse>;
}

/// [`PeerTransport`] over a fresh TCP connection per exchange.
#[derive(Debug, Clone)]
pub struct TcpPeerTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpPeerTransport {
    /// Creates a transport with the given bounds.
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

impl PeerTransport for TcpPeerTransport {
    fn exchange(&self, addr: SocketAddr, request: ExchangeRequest) -> SyncResult<ExchangeResponse> {
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| SyncError::transport_retryable(format!("connect to {addr}: {e}")))?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        stream.set_nodelay(true)?;

        write_message(&mut stream, &PeerMessage::ExchangeRequest(request))?;
        match read_message(&mut stream)? {
            PeerMessage::ExchangeResponse(response) => Ok(response),
            PeerMessage::Rejected { reason } => Err(SyncError::transport_fatal(format!(
                "{addr} rejected the exchange: {reason}"
            ))),
            other => Err(SyncError::transport_fatal(format!(
                "unexpected {} from {addr}",
                other.kind()
            ))),
        }
    }
}
