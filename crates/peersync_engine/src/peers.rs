//! Known peers and their trust/online state.

use crate::error::SyncResult;
use crate::store::LocalStore;
use peersync_protocol::{NewPeer, Peer, PeerStatus};
use std::net::IpAddr;
use std::sync::Arc;

/// CRUD over the peer table.
#[derive(Clone)]
pub struct PeerRegistry {
    store: Arc<dyn LocalStore>,
}

impl PeerRegistry {
    /// Creates a registry over a store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Every known peer.
    pub fn all(&self) -> SyncResult<Vec<Peer>> {
        self.store.all_peers()
    }

    /// Peers the client role exchanges with.
    pub fn trusted(&self) -> SyncResult<Vec<Peer>> {
        Ok(self
            .store
            .all_peers()?
            .into_iter()
            .filter(|p| p.is_trusted)
            .collect())
    }

    /// Looks a peer up by endpoint.
    pub fn find(&self, ip: IpAddr, port: u16) -> SyncResult<Option<Peer>> {
        Ok(self
            .store
            .all_peers()?
            .into_iter()
            .find(|p| p.matches(ip, port)))
    }

    /// Registers a peer. Returns `None` when the endpoint is already known.
    pub fn register(&self, peer: NewPeer) -> SyncResult<Option<Peer>> {
        self.store.add_peer(peer)
    }

    /// Removes a peer.
    pub fn remove(&self, id: u64) -> SyncResult<bool> {
        self.store.delete_peer(id)
    }

    /// Changes whether a peer is exchanged with.
    pub fn set_trusted(&self, id: u64, trusted: bool) -> SyncResult<bool> {
        self.modify(id, |p| p.is_trusted = trusted)
    }

    /// Updates a peer's status.
    pub fn set_status(&self, id: u64, status: PeerStatus) -> SyncResult<bool> {
        self.modify(id, |p| p.status = status)
    }

    /// Records a successful exchange that began at `started_at`.
    pub fn record_sync(&self, id: u64, started_at: u64) -> SyncResult<bool> {
        self.modify(id, |p| {
            p.status = PeerStatus::Online;
            p.last_sync_time = Some(started_at);
        })
    }

    fn modify(&self, id: u64, change: impl FnOnce(&mut Peer)) -> SyncResult<bool> {
        let Some(mut peer) = self.store.all_peers()?.into_iter().find(|p| p.id == id) else {
            return Ok(false);
        };
        change(&mut peer);
        self.store.update_peer(&peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLocalStore;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn trust_and_status() {
        let registry = PeerRegistry::new(Arc::new(MemoryLocalStore::new()));
        let a = registry.register(NewPeer::discovered(ip(2), 8080)).unwrap().unwrap();
        let b = registry.register(NewPeer::new(ip(3), 8080, true)).unwrap().unwrap();
        assert_eq!(a.status, PeerStatus::Unknown);

        assert_eq!(registry.trusted().unwrap(), vec![b.clone()]);
        assert!(registry.set_trusted(a.id, true).unwrap());
        assert_eq!(registry.trusted().unwrap().len(), 2);

        assert!(registry.record_sync(b.id, 1234).unwrap());
        let b = registry.find(ip(3), 8080).unwrap().unwrap();
        assert_eq!(b.status, PeerStatus::Online);
        assert_eq!(b.last_sync_time, Some(1234));

        assert!(registry.set_status(b.id, PeerStatus::Offline).unwrap());
        assert!(!registry.set_status(99, PeerStatus::Offline).unwrap());
    }

    #[test]
    fn duplicate_endpoint_is_not_registered_twice() {
        let registry = PeerRegistry::new(Arc::new(MemoryLocalStore::new()));
        assert!(registry.register(NewPeer::discovered(ip(2), 8080)).unwrap().is_some());
        assert!(registry.register(NewPeer::discovered(ip(2), 8080)).unwrap().is_none());
        assert_eq!(registry.all().unwrap().len(), 1);
    }
}
