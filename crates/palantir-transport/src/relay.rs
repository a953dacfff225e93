//! Client side of relay routing.

use std::collections::HashMap;

use async_trait::async_trait;
use palantir_crypto::PeerId;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{ErrorKind, LayerError, Origin};
use crate::traits::{Envelope, Layer, LayerEvent, PeerHandle, Route};
use crate::wire::RelayFrame;

/// Routes envelopes to peers through a relay reached over the inner layer.
///
/// Peer presence comes from the relay's JOINED/LEFT announcements. The
/// relay's own link-level `Joined` is consumed while the layer is built.
pub struct RelayLayer {
    inner: Box<dyn Layer>,
    relay: PeerId,
    /// Current relay token per announced peer.
    tokens: Mutex<HashMap<PeerId, u64>>,
}

impl RelayLayer {
    /// Wrap an authenticated link to the relay. When `pinned` is set the
    /// relay must have authenticated as that id.
    pub async fn new(inner: Box<dyn Layer>, pinned: Option<PeerId>) -> Result<Self, LayerError> {
        let relay = loop {
            match inner.next_event().await {
                Ok(LayerEvent::Joined(handle)) if !handle.peer_id.is_unbound() => {
                    break handle.peer_id
                }
                Ok(LayerEvent::Joined(_)) => continue,
                Ok(other) => {
                    inner.close().await;
                    return Err(LayerError::malformed(
                        Origin::Relay,
                        format!("expected relay identity, got {other:?}"),
                    ));
                }
                Err(err) => {
                    inner.close().await;
                    return Err(err);
                }
            }
        };

        if let Some(expected) = pinned {
            if expected != relay {
                warn!(
                    security = true,
                    expected = %expected.short(),
                    got = %relay.short(),
                    "relay identity mismatch"
                );
                inner.close().await;
                let detail = format!("relay authenticated as {relay}, expected {expected}");
                return Err(LayerError::new(Origin::Relay, ErrorKind::HandshakeFailed(detail)));
            }
        }
        debug!(relay = %relay.short(), "relay link ready");

        Ok(Self {
            inner,
            relay,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn relay_id(&self) -> PeerId {
        self.relay
    }
}

#[async_trait]
impl Layer for RelayLayer {
    fn kind(&self) -> Origin {
        Origin::Relay
    }

    fn inner(&self) -> Option<&dyn Layer> {
        Some(self.inner.as_ref())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), LayerError> {
        let payload = RelayFrame::Data {
            peer: envelope.peer,
            payload: envelope.payload,
        }
        .encode();
        self.inner
            .send(Envelope {
                peer: self.relay,
                channel: envelope.channel,
                payload,
            })
            .await
    }

    async fn next_event(&self) -> Result<LayerEvent, LayerError> {
        loop {
            let env = match self.inner.next_event().await? {
                LayerEvent::Message(env) => env,
                // The link to the relay is gone: nobody is reachable any more.
                LayerEvent::Left(_) => return Err(LayerError::closed(Origin::Relay)),
                LayerEvent::Joined(_) => continue,
            };

            let frame = RelayFrame::decode(env.payload)
                .map_err(|e| LayerError::malformed(Origin::Relay, e.to_string()))?;
            match frame {
                RelayFrame::Data { peer, payload } => {
                    trace!(from = %peer.short(), bytes = payload.len(), "relayed message");
                    return Ok(LayerEvent::Message(Envelope {
                        peer,
                        channel: env.channel,
                        payload,
                    }));
                }
                RelayFrame::Joined { token, bundle } => {
                    let peer_id = bundle.peer_id();
                    self.tokens.lock().insert(peer_id, token);
                    return Ok(LayerEvent::Joined(PeerHandle {
                        peer_id,
                        bundle: Some(bundle),
                        route: Route::Relayed { token },
                    }));
                }
                RelayFrame::Left { token, peer } => {
                    let current = {
                        let mut tokens = self.tokens.lock();
                        if tokens.get(&peer) == Some(&token) {
                            tokens.remove(&peer);
                            true
                        } else {
                            false
                        }
                    };
                    if current {
                        return Ok(LayerEvent::Left(peer));
                    }
                    debug!(peer = %peer.short(), token, "ignoring stale departure");
                }
            }
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
