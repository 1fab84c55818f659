//! Server side of peer exchanges.

use super::{read_message, write_message};
use crate::apply::ChangeApplier;
use crate::changelog::ChangelogTracker;
use crate::config::SharedConfig;
use crate::discovery::loopback_for;
use crate::error::{SyncError, SyncResult};
use crate::log::{now_millis, SyncLog};
use crate::peers::PeerRegistry;
use crate::scheduler::join_until;
use parking_lot::Mutex;
use peersync_protocol::{ExchangeResponse, PeerMessage, PROTOCOL_VERSION};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Serves one inbound exchange.
#[derive(Clone)]
pub struct ExchangeHandler {
    config: SharedConfig,
    tracker: ChangelogTracker,
    applier: ChangeApplier,
    registry: PeerRegistry,
    io_timeout: Duration,
    log: SyncLog,
}

impl ExchangeHandler {
    /// Creates a handler.
    pub fn new(
        config: SharedConfig,
        tracker: ChangelogTracker,
        applier: ChangeApplier,
        registry: PeerRegistry,
        io_timeout: Duration,
        log: SyncLog,
    ) -> Self {
        Self {
            config,
            tracker,
            applier,
            registry,
            io_timeout,
            log,
        }
    }

    /// Reads a request, applies it, and answers with local changes newer
    /// than the requester's watermark.
    pub fn handle(&self, mut stream: TcpStream) -> SyncResult<()> {
        let started = now_millis();
        let remote = stream.peer_addr()?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;

        let request = match read_message(&mut stream)? {
            PeerMessage::ExchangeRequest(request) => request,
            other => {
                let reason = format!("expected exchange request, got {}", other.kind());
                return self.reject(&mut stream, reason);
            }
        };
        if request.protocol_version != PROTOCOL_VERSION {
            return self.reject(
                &mut stream,
                format!("unsupported protocol version {}", request.protocol_version),
            );
        }
        let strategy = match self.config.read().strategy() {
            Ok(strategy) => strategy,
            Err(e) => return self.reject(&mut stream, e.to_string()),
        };

        let received = request.changes.len();
        let outcome = self.applier.apply_changes(request.changes, strategy)?;
        let outgoing = self.tracker.outgoing_since(request.since)?;
        let sent = outgoing.len();
        write_message(
            &mut stream,
            &PeerMessage::ExchangeResponse(ExchangeResponse::new(outcome.applied, outgoing)),
        )?;

        self.log.info(format_args!(
            "Served exchange for {remote}: received {received} (applied {}), sent {sent}",
            outcome.applied
        ));

        if let Some(port) = request.listen_port {
            if let Some(peer) = self.registry.find(remote.ip(), port)? {
                self.registry.record_sync(peer.id, started)?;
            }
        }
        Ok(())
    }

    fn reject(&self, stream: &mut TcpStream, reason: String) -> SyncResult<()> {
        let _ = write_message(stream, &PeerMessage::Rejected { reason: reason.clone() });
        Err(SyncError::transport_fatal(reason))
    }
}

type Connections = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Handle to a running TCP exchange listener.
pub struct PeerListener {
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    connections: Connections,
    local_addr: SocketAddr,
    join_deadline: Duration,
}

impl PeerListener {
    /// Binds `addr` and serves every accepted connection on its own thread.
    pub fn spawn(
        addr: SocketAddr,
        handler: ExchangeHandler,
        join_deadline: Duration,
    ) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections: Connections = Arc::default();

        let flag = Arc::clone(&shutdown);
        let tracked = Arc::clone(&connections);
        let accept_handle = thread::Builder::new()
            .name("peersync-tcp-listener".into())
            .spawn(move || accept_loop(&listener, &handler, &flag, &tracked))?;

        tracing::info!(%local_addr, "tcp listener started");
        Ok(Self {
            shutdown,
            accept_handle: Some(accept_handle),
            connections,
            local_addr,
            join_deadline,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, then waits for in-flight connections up to the join deadline.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let Some(handle) = self.accept_handle.take() else {
            return;
        };

        // unblock accept()
        let wake = SocketAddr::new(loopback_for(self.local_addr.ip()), self.local_addr.port());
        let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(500));
        if handle.join().is_err() {
            tracing::error!("tcp listener thread panicked");
        }

        let until = Instant::now() + self.join_deadline;
        let pending: Vec<_> = self.connections.lock().drain(..).collect();
        for connection in pending {
            if !join_until(connection, until) {
                tracing::warn!("connection handler still running after stop");
            }
        }
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: &TcpListener,
    handler: &ExchangeHandler,
    shutdown: &AtomicBool,
    connections: &Connections,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                handler.log.warn(format_args!("Accept failed: {e}"));
                continue;
            }
        };

        let conn_handler = handler.clone();
        let spawned = thread::Builder::new()
            .name("peersync-tcp-conn".into())
            .spawn(move || {
                let remote = stream.peer_addr().ok();
                if let Err(e) = conn_handler.handle(stream) {
                    match remote {
                        Some(remote) => conn_handler
                            .log
                            .warn(format_args!("Exchange with {remote} failed: {e}")),
                        None => conn_handler.log.warn(format_args!("Exchange failed: {e}")),
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                let mut tracked = connections.lock();
                tracked.retain(|h| !h.is_finished());
                tracked.push(handle);
            }
            Err(e) => handler
                .log
                .error(format_args!("Cannot spawn connection handler: {e}")),
        }
    }
    tracing::debug!("tcp listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::WriteGate;
    use crate::config::SyncConfiguration;
    use crate::store::{LocalStore, MemoryLocalStore};
    use crate::transport::{PeerTransport, TcpPeerTransport};
    use parking_lot::RwLock;
    use peersync_protocol::{
        ExchangeRequest, NewChangelogEntry, NewPeer, PeerStatus, Record, ReplicatedChange,
        TransportFlags,
    };
    use std::net::{IpAddr, Ipv4Addr};

    fn serve(store: Arc<MemoryLocalStore>) -> PeerListener {
        let handler = ExchangeHandler::new(
            Arc::new(RwLock::new(SyncConfiguration::default())),
            ChangelogTracker::new(store.clone()),
            ChangeApplier::new(store.clone(), WriteGate::default()),
            PeerRegistry::new(store),
            Duration::from_secs(2),
            SyncLog::disabled(),
        );
        PeerListener::spawn(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            handler,
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn transport() -> TcpPeerTransport {
        TcpPeerTransport::new(Duration::from_secs(1), Duration::from_secs(2))
    }

    #[test]
    fn exchange_applies_and_answers() {
        let store = Arc::new(MemoryLocalStore::new());
        store
            .insert_tracked("plans", Record::new(1, 100).with_column("title", "server"))
            .unwrap();
        let mut listener = serve(store.clone());

        let incoming = ReplicatedChange::new(
            NewChangelogEntry::insert("users", 5, 150).into_entry(1),
            Some(Record::new(5, 150).with_column("name", "client")),
        );
        let request = ExchangeRequest::new(None, None, vec![incoming], TransportFlags::default());
        let response = transport().exchange(listener.local_addr(), request).unwrap();

        assert_eq!(response.applied, 1);
        assert_eq!(response.changes.len(), 1);
        assert_eq!(response.changes[0].entry.table_name, "plans");
        assert!(store.get_local_row("users", 5).unwrap().is_some());
        listener.stop();
    }

    #[test]
    fn known_caller_is_touched() {
        let store = Arc::new(MemoryLocalStore::new());
        let caller = store
            .add_peer(NewPeer::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9301, true))
            .unwrap()
            .unwrap();
        let mut listener = serve(store.clone());

        let request = ExchangeRequest::new(Some(9301), None, Vec::new(), TransportFlags::default());
        transport().exchange(listener.local_addr(), request).unwrap();
        listener.stop();

        let caller = store
            .all_peers()
            .unwrap()
            .into_iter()
            .find(|p| p.id == caller.id)
            .unwrap();
        assert_eq!(caller.status, PeerStatus::Online);
        assert!(caller.last_sync_time.is_some());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut listener = serve(Arc::new(MemoryLocalStore::new()));
        let mut request = ExchangeRequest::new(None, None, Vec::new(), TransportFlags::default());
        request.protocol_version = PROTOCOL_VERSION + 1;

        let err = transport().exchange(listener.local_addr(), request).unwrap_err();
        assert!(!err.is_retryable());
        listener.stop();
    }

    #[test]
    fn garbage_closes_only_that_connection() {
        use std::io::Write;

        let mut listener = serve(Arc::new(MemoryLocalStore::new()));
        let mut raw = TcpStream::connect(listener.local_addr()).unwrap();
        raw.write_all(&[0, 0, 0, 3, 0xFF, 0xFF, 0xFF]).unwrap();
        drop(raw);

        let request = ExchangeRequest::new(None, None, Vec::new(), TransportFlags::default());
        assert!(transport().exchange(listener.local_addr(), request).is_ok());
        listener.stop();
    }

    #[test]
    fn stop_releases_the_port() {
        let mut listener = serve(Arc::new(MemoryLocalStore::new()));
        let addr = listener.local_addr();
        listener.stop();
        assert!(TcpListener::bind(addr).is_ok());
    }
}
