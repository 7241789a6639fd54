//! Peer registry
//!
//! Concurrent map of handshaked peers keyed by their 20-byte identifier.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::state::{Peer, PeerStats};

/// Peers known to a transfer
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<[u8; 20], Arc<Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` under `peer_id` unless an entry already exists.
    ///
    /// Returns the registered peer and whether this call inserted it. A
    /// concurrent duplicate never replaces the first entry.
    pub fn insert_or_get(&self, peer_id: [u8; 20], peer: Arc<Peer>) -> (Arc<Peer>, bool) {
        match self.peers.entry(peer_id) {
            Entry::Occupied(entry) => {
                debug!("Peer {} already registered", hex::encode(peer_id));
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                debug!("Registered peer {} at {}", hex::encode(peer_id), peer.addr);
                entry.insert(peer.clone());
                (peer, true)
            }
        }
    }

    pub fn get(&self, peer_id: &[u8; 20]) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, peer_id: &[u8; 20]) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Remove the entry only if it still refers to `peer`
    pub fn remove_if_same(&self, peer_id: &[u8; 20], peer: &Arc<Peer>) -> bool {
        let removed = self
            .peers
            .remove_if(peer_id, |_, registered| Arc::ptr_eq(registered, peer))
            .is_some();
        if removed {
            debug!("Unregistered peer {}", hex::encode(peer_id));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<[u8; 20]> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of peers with a completed handshake
    pub fn active_count(&self) -> usize {
        self.peers.iter().filter(|entry| entry.value().is_active()).count()
    }

    pub fn stats(&self) -> Vec<PeerStats> {
        self.peers.iter().map(|entry| entry.value().stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(port: u16) -> Arc<Peer> {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        Arc::new(Peer::inbound(addr))
    }

    #[test]
    fn test_insert_or_get_keeps_first() {
        let registry = PeerRegistry::new();
        let first = peer(1000);
        let second = peer(2000);

        let (registered, inserted) = registry.insert_or_get([1u8; 20], first.clone());
        assert!(inserted);
        assert!(Arc::ptr_eq(&registered, &first));

        let (registered, inserted) = registry.insert_or_get([1u8; 20], second);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&registered, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_if_same() {
        let registry = PeerRegistry::new();
        let first = peer(1000);
        registry.insert_or_get([2u8; 20], first.clone());

        assert!(!registry.remove_if_same(&[2u8; 20], &peer(1000)));
        assert!(registry.contains(&[2u8; 20]));
        assert!(registry.remove_if_same(&[2u8; 20], &first));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(PeerRegistry::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.insert_or_get([7u8; 20], peer(3000 + i)).1)
            })
            .collect();

        let inserted = handles.into_iter().map(|h| h.join().unwrap()).filter(|&i| i).count();
        assert_eq!(inserted, 1);
        assert_eq!(registry.ids(), vec![[7u8; 20]]);
    }

    #[test]
    fn test_active_count_and_stats() {
        let registry = PeerRegistry::new();
        let active = peer(1000);
        active.mark_handshake_received([3u8; 20]);
        active.mark_handshake_sent();
        registry.insert_or_get([3u8; 20], active);
        registry.insert_or_get([4u8; 20], peer(2000));

        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.stats().len(), 2);
        assert!(registry.get(&[4u8; 20]).is_some());
    }
}
