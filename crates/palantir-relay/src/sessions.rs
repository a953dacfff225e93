//! Session table: which connection currently speaks for each peer id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use palantir_crypto::{PeerBundle, PeerId};
use palantir_transport::{ChannelId, RelayFrame};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Work item for a connection task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame { channel: ChannelId, payload: Bytes },
    /// A newer connection took over this peer id.
    Close,
}

impl Outbound {
    fn announce(frame: RelayFrame) -> Self {
        Outbound::Frame {
            channel: ChannelId::DEFAULT,
            payload: frame.encode(),
        }
    }
}

/// Queues feeding one connection task.
///
/// The connection task drains `control` (announcements and eviction) before
/// `data`. Neither queue drops: a slow reader is paced by its own link while
/// frames addressed to it wait here.
#[derive(Clone, Debug)]
pub struct SessionQueues {
    pub control: mpsc::UnboundedSender<Outbound>,
    pub data: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug)]
struct SessionEntry {
    token: u64,
    bundle: PeerBundle,
    queues: SessionQueues,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("relay at capacity ({max} sessions)")]
    Full { max: usize },
}

/// Outcome of registering a session.
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    /// Token of the connection that was evicted, if any.
    pub evicted: Option<u64>,
}

/// All active sessions, keyed by peer id.
///
/// Every mutation and the announcements it causes happen under one lock, so
/// all observers see membership changes in the same order.
pub struct SessionTable {
    sessions: Mutex<HashMap<PeerId, SessionEntry>>,
    next_token: AtomicU64,
    max_sessions: Option<usize>,
}

impl SessionTable {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            max_sessions,
        }
    }

    /// Allocate a connection token. Tokens are never reused.
    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `token` the active connection for `peer`.
    ///
    /// A live entry for the same id is evicted: its connection gets
    /// [`Outbound::Close`] and the other peers see LEFT(old) then JOINED(new).
    /// The newcomer is sent JOINED for every other active peer.
    pub fn register(
        &self,
        peer: PeerId,
        token: u64,
        bundle: PeerBundle,
        queues: SessionQueues,
    ) -> Result<Registration, SessionError> {
        let mut sessions = self.sessions.lock();

        if let Some(max) = self.max_sessions {
            if !sessions.contains_key(&peer) && sessions.len() >= max {
                return Err(SessionError::Full { max });
            }
        }

        let evicted = sessions.remove(&peer).map(|old| {
            let _ = old.queues.control.send(Outbound::Close);
            broadcast(&sessions, RelayFrame::Left { token: old.token, peer });
            info!(peer = %peer.short(), old = old.token, new = token, "evicting stale session");
            old.token
        });

        broadcast(&sessions, RelayFrame::Joined { token, bundle });
        for entry in sessions.values() {
            let _ = queues.control.send(Outbound::announce(RelayFrame::Joined {
                token: entry.token,
                bundle: entry.bundle,
            }));
        }
        sessions.insert(peer, SessionEntry { token, bundle, queues });
        debug!(peer = %peer.short(), token, active = sessions.len(), "session registered");
        Ok(Registration { evicted })
    }

    /// Remove `peer` only if `token` is still its active connection, and
    /// announce the departure. A replaced connection never removes its successor.
    pub fn remove_if_current(&self, peer: &PeerId, token: u64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(peer) {
            Some(entry) if entry.token == token => {
                sessions.remove(peer);
                broadcast(&sessions, RelayFrame::Left { token, peer: *peer });
                debug!(peer = %peer.short(), token, active = sessions.len(), "session removed");
                true
            }
            _ => false,
        }
    }

    /// Data queue of the peer's active connection.
    pub fn route(&self, peer: &PeerId) -> Option<mpsc::UnboundedSender<Outbound>> {
        self.sessions.lock().get(peer).map(|e| e.queues.data.clone())
    }

    pub fn token_of(&self, peer: &PeerId) -> Option<u64> {
        self.sessions.lock().get(peer).map(|e| e.token)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.sessions.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Evict everyone, for relay shutdown.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.lock();
        for (_, entry) in sessions.drain() {
            let _ = entry.queues.control.send(Outbound::Close);
        }
    }
}

fn broadcast(sessions: &HashMap<PeerId, SessionEntry>, frame: RelayFrame) {
    let out = Outbound::announce(frame);
    for entry in sessions.values() {
        let _ = entry.queues.control.send(out.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palantir_crypto::Identity;

    struct Client {
        id: PeerId,
        bundle: PeerBundle,
        control: mpsc::UnboundedReceiver<Outbound>,
        #[allow(dead_code)]
        data: mpsc::UnboundedReceiver<Outbound>,
        queues: SessionQueues,
    }

    fn client(identity: &Identity) -> Client {
        let (control_tx, control) = mpsc::unbounded_channel();
        let (data_tx, data) = mpsc::unbounded_channel();
        Client {
            id: identity.peer_id(),
            bundle: identity.bundle(),
            control,
            data,
            queues: SessionQueues {
                control: control_tx,
                data: data_tx,
            },
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn decoded(items: Vec<Outbound>) -> Vec<RelayFrame> {
        items
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Frame { payload, .. } => Some(RelayFrame::decode(payload).unwrap()),
                Outbound::Close => None,
            })
            .collect()
    }

    #[test]
    fn test_newcomer_gets_snapshot_and_others_get_joined() {
        let table = SessionTable::new(None);
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut a = client(&alice);
        let mut b = client(&bob);

        table.register(a.id, 1, a.bundle, a.queues.clone()).unwrap();
        let reg = table.register(b.id, 2, b.bundle, b.queues.clone()).unwrap();
        assert_eq!(reg, Registration { evicted: None });

        assert_eq!(
            decoded(drain(&mut a.control)),
            vec![RelayFrame::Joined { token: 2, bundle: bob.bundle() }]
        );
        assert_eq!(
            decoded(drain(&mut b.control)),
            vec![RelayFrame::Joined { token: 1, bundle: alice.bundle() }]
        );
    }

    #[test]
    fn test_reconnect_evicts_and_orders_left_before_joined() {
        let table = SessionTable::new(None);
        let alice = Identity::generate();
        let observer = Identity::generate();
        let mut stale = client(&alice);
        let fresh = client(&alice);
        let mut obs = client(&observer);

        table.register(stale.id, 1, stale.bundle, stale.queues.clone()).unwrap();
        table.register(obs.id, 2, obs.bundle, obs.queues.clone()).unwrap();
        drain(&mut obs.control);
        drain(&mut stale.control);

        let reg = table.register(fresh.id, 3, fresh.bundle, fresh.queues.clone()).unwrap();
        assert_eq!(reg.evicted, Some(1));
        assert_eq!(drain(&mut stale.control), vec![Outbound::Close]);
        assert_eq!(
            decoded(drain(&mut obs.control)),
            vec![
                RelayFrame::Left { token: 1, peer: alice.peer_id() },
                RelayFrame::Joined { token: 3, bundle: alice.bundle() },
            ]
        );

        // The stale connection's teardown must not touch its replacement.
        assert!(!table.remove_if_current(&alice.peer_id(), 1));
        assert_eq!(table.token_of(&alice.peer_id()), Some(3));
        assert!(drain(&mut obs.control).is_empty());
    }

    #[test]
    fn test_remove_announces_left() {
        let table = SessionTable::new(None);
        let alice = Identity::generate();
        let bob = Identity::generate();
        let a = client(&alice);
        let mut b = client(&bob);

        table.register(a.id, 1, a.bundle, a.queues.clone()).unwrap();
        table.register(b.id, 2, b.bundle, b.queues.clone()).unwrap();
        drain(&mut b.control);

        assert!(table.remove_if_current(&a.id, 1));
        assert_eq!(
            decoded(drain(&mut b.control)),
            vec![RelayFrame::Left { token: 1, peer: alice.peer_id() }]
        );
        assert!(table.route(&a.id).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity_limit_allows_replacement() {
        let table = SessionTable::new(Some(1));
        let alice = Identity::generate();
        let bob = Identity::generate();
        let a = client(&alice);
        let b = client(&bob);

        table.register(a.id, 1, a.bundle, a.queues.clone()).unwrap();
        assert_eq!(
            table.register(b.id, 2, b.bundle, b.queues.clone()),
            Err(SessionError::Full { max: 1 })
        );
        assert!(table.register(a.id, 3, a.bundle, a.queues.clone()).is_ok());
    }

    #[test]
    fn test_tokens_increase() {
        let table = SessionTable::new(None);
        let t1 = table.next_token();
        let t2 = table.next_token();
        assert!(t2 > t1);
    }

    #[test]
    fn test_close_all() {
        let table = SessionTable::new(None);
        let alice = Identity::generate();
        let mut a = client(&alice);
        table.register(a.id, 1, a.bundle, a.queues.clone()).unwrap();

        table.close_all();
        assert!(table.is_empty());
        assert_eq!(drain(&mut a.control), vec![Outbound::Close]);
    }
}
