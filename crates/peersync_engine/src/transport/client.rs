//! Client side of a peer exchange.

use super::PeerTransport;
use crate::apply::{ApplyOutcome, ChangeApplier};
use crate::changelog::ChangelogTracker;
use crate::error::SyncResult;
use peersync_protocol::{ConflictStrategy, ExchangeRequest, Peer, TransportFlags};
use std::sync::Arc;

/// Counts from one completed exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeSummary {
    /// Changes sent to the peer.
    pub sent: usize,
    /// Of those, how many the peer applied.
    pub applied_remotely: u32,
    /// What happened to the changes the peer sent back.
    pub received: ApplyOutcome,
}

/// Runs exchanges with individual peers.
#[derive(Clone)]
pub struct PeerExchanger {
    transport: Arc<dyn PeerTransport>,
    tracker: ChangelogTracker,
    applier: ChangeApplier,
}

impl PeerExchanger {
    /// Creates an exchanger.
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        tracker: ChangelogTracker,
        applier: ChangeApplier,
    ) -> Self {
        Self {
            transport,
            tracker,
            applier,
        }
    }

    /// Sends every local change newer than the peer's watermark and applies
    /// the peer's changes in return.
    pub fn exchange_with(
        &self,
        peer: &Peer,
        listen_port: Option<u16>,
        strategy: ConflictStrategy,
        flags: TransportFlags,
    ) -> SyncResult<ExchangeSummary> {
        let outgoing = self.tracker.outgoing_since(peer.last_sync_time)?;
        let sent = outgoing.len();
        let request = ExchangeRequest::new(listen_port, peer.last_sync_time, outgoing, flags);

        tracing::debug!(peer = %peer, sent, "sending exchange request");
        let response = self.transport.exchange(peer.socket_addr(), request)?;
        let received = self.applier.apply_changes(response.changes, strategy)?;

        Ok(ExchangeSummary {
            sent,
            applied_remotely: response.applied,
            received,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::WriteGate;
    use crate::error::SyncError;
    use crate::store::{LocalStore, MemoryLocalStore};
    use parking_lot::Mutex;
    use peersync_protocol::{
        ExchangeResponse, NewChangelogEntry, NewPeer, Record, ReplicatedChange,
    };
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    /// Records requests and answers with a canned response.
    #[derive(Default)]
    struct MockTransport {
        requests: Mutex<Vec<(SocketAddr, ExchangeRequest)>>,
        response: Mutex<Option<ExchangeResponse>>,
    }

    impl PeerTransport for MockTransport {
        fn exchange(
            &self,
            addr: SocketAddr,
            request: ExchangeRequest,
        ) -> SyncResult<ExchangeResponse> {
            let applied = request.changes.len() as u32;
            self.requests.lock().push((addr, request));
            match self.response.lock().take() {
                Some(mut response) => {
                    response.applied = applied;
                    Ok(response)
                }
                None => Err(SyncError::transport_retryable("connection refused")),
            }
        }
    }

    fn peer(last_sync_time: Option<u64>) -> Peer {
        let mut peer = NewPeer::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 8080, true).into_peer(1);
        peer.last_sync_time = last_sync_time;
        peer
    }

    fn setup(transport: Arc<MockTransport>) -> (Arc<MemoryLocalStore>, PeerExchanger) {
        let store = Arc::new(MemoryLocalStore::new());
        let exchanger = PeerExchanger::new(
            transport,
            ChangelogTracker::new(store.clone()),
            ChangeApplier::new(store.clone(), WriteGate::default()),
        );
        (store, exchanger)
    }

    #[test]
    fn sends_changes_newer_than_watermark() {
        let transport = Arc::new(MockTransport::default());
        *transport.response.lock() = Some(ExchangeResponse::new(0, Vec::new()));
        let (store, exchanger) = setup(transport.clone());
        store.insert_tracked("users", Record::new(1, 100)).unwrap();
        store.insert_tracked("users", Record::new(2, 300)).unwrap();

        let summary = exchanger
            .exchange_with(&peer(Some(200)), Some(8081), ConflictStrategy::LastWriteWins, TransportFlags::default())
            .unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.applied_remotely, 1);

        let requests = transport.requests.lock();
        let (addr, request) = &requests[0];
        assert_eq!(addr.port(), 8080);
        assert_eq!(request.since, Some(200));
        assert_eq!(request.listen_port, Some(8081));
        assert_eq!(request.changes[0].entry.record_id, 2);
    }

    #[test]
    fn applies_peer_changes() {
        let transport = Arc::new(MockTransport::default());
        let change = ReplicatedChange::new(
            NewChangelogEntry::insert("plans", 4, 50).into_entry(1),
            Some(Record::new(4, 50).with_column("title", "From peer")),
        );
        *transport.response.lock() = Some(ExchangeResponse::new(0, vec![change]));
        let (store, exchanger) = setup(transport);

        let summary = exchanger
            .exchange_with(&peer(None), None, ConflictStrategy::LastWriteWins, TransportFlags::default())
            .unwrap();
        assert_eq!(summary.received.applied, 1);
        assert!(store.get_local_row("plans", 4).unwrap().is_some());
    }

    #[test]
    fn transport_failure_is_returned() {
        let (_, exchanger) = setup(Arc::new(MockTransport::default()));
        let err = exchanger
            .exchange_with(&peer(None), None, ConflictStrategy::LastWriteWins, TransportFlags::default())
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
