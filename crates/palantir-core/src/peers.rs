//! Peer table of an instance.

use std::collections::HashMap;

use palantir_crypto::PeerId;
use palantir_transport::PeerHandle;
use parking_lot::RwLock;

/// Currently reachable peers, keyed by id.
///
/// Only the instance's driver task mutates the table; senders read it to
/// reject unknown destinations before touching the network.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a handle. Returns `true` if the peer was not known before.
    pub fn insert(&self, handle: PeerHandle) -> bool {
        self.peers.write().insert(handle.peer_id, handle).is_none()
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PeerHandle> {
        self.peers.write().remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerHandle> {
        self.peers.read().get(peer).cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerHandle> {
        self.peers.read().values().cloned().collect()
    }

    /// Remove every peer, returning their ids.
    pub fn drain(&self) -> Vec<PeerId> {
        self.peers.write().drain().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
