//! End-to-end payload encryption between peers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use palantir_crypto::{Identity, PeerId, PeerSession};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{ErrorKind, LayerError, Origin};
use crate::traits::{Envelope, Layer, LayerEvent};

/// Seals every payload for its destination with a per-peer session.
///
/// Sessions are derived when a peer joins with a bundle. A payload that
/// fails to authenticate drops that peer's session: the error is returned
/// once and a `Left` for the peer follows on the next call.
///
/// The drop is one-sided. The relay still lists the peer and the peer still
/// lists us, so its later frames arrive here without a session and are
/// discarded (logged at `warn`) until it reconnects and joins again.
pub struct EncryptionLayer {
    inner: Box<dyn Layer>,
    identity: Arc<Identity>,
    sessions: RwLock<HashMap<PeerId, PeerSession>>,
    pending: Mutex<VecDeque<LayerEvent>>,
}

impl EncryptionLayer {
    pub fn new(inner: Box<dyn Layer>, identity: Arc<Identity>) -> Self {
        Self {
            inner,
            identity,
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.read().contains_key(peer)
    }

    fn authentication_failed(&self, peer: PeerId) -> LayerError {
        self.sessions.write().remove(&peer);
        self.pending.lock().push_back(LayerEvent::Left(peer));
        LayerError::new(Origin::Encryption, ErrorKind::AuthenticationFailed(peer))
    }
}

#[async_trait]
impl Layer for EncryptionLayer {
    fn kind(&self) -> Origin {
        Origin::Encryption
    }

    fn inner(&self) -> Option<&dyn Layer> {
        Some(self.inner.as_ref())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), LayerError> {
        let sealed = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(&envelope.peer)
                .ok_or_else(|| LayerError::unknown_peer(Origin::Encryption, envelope.peer))?;
            session
                .seal(envelope.channel.0, &envelope.payload)
                .map_err(|e| LayerError::new(Origin::Encryption, ErrorKind::Io(e.to_string())))?
        };
        self.inner
            .send(Envelope {
                payload: Bytes::from(sealed),
                ..envelope
            })
            .await
    }

    async fn next_event(&self) -> Result<LayerEvent, LayerError> {
        loop {
            if let Some(event) = self.pending.lock().pop_front() {
                return Ok(event);
            }

            match self.inner.next_event().await? {
                LayerEvent::Joined(handle) => {
                    let Some(bundle) = handle.bundle.as_ref() else {
                        warn!(
                            peer = %handle.peer_id.short(),
                            "peer joined without key bundle, ignoring"
                        );
                        continue;
                    };
                    match PeerSession::derive(&self.identity, bundle) {
                        Ok(session) if session.remote() == handle.peer_id => {
                            self.sessions.write().insert(handle.peer_id, session);
                            debug!(peer = %handle.peer_id.short(), "session established");
                            return Ok(LayerEvent::Joined(handle));
                        }
                        Ok(_) => {
                            warn!(
                                security = true,
                                peer = %handle.peer_id.short(),
                                "bundle names a different peer, ignoring"
                            );
                        }
                        Err(e) => {
                            warn!(
                                security = true,
                                peer = %handle.peer_id.short(),
                                error = %e,
                                "rejecting peer bundle"
                            );
                        }
                    }
                }
                LayerEvent::Left(peer) => {
                    if self.sessions.write().remove(&peer).is_some() {
                        return Ok(LayerEvent::Left(peer));
                    }
                }
                LayerEvent::Message(env) => {
                    let opened = self
                        .sessions
                        .read()
                        .get(&env.peer)
                        .map(|session| session.open(env.channel.0, &env.payload));
                    match opened {
                        Some(Ok(plain)) => {
                            return Ok(LayerEvent::Message(Envelope {
                                payload: Bytes::from(plain),
                                ..env
                            }))
                        }
                        Some(Err(e)) => {
                            warn!(
                                security = true,
                                peer = %env.peer.short(),
                                error = %e,
                                "dropping session after failed decryption"
                            );
                            return Err(self.authentication_failed(env.peer));
                        }
                        None => {
                            warn!(
                                peer = %env.peer.short(),
                                channel = env.channel.0,
                                "message from peer without session, dropped"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) {
        self.sessions.write().clear();
        self.inner.close().await;
    }
}
