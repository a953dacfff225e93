//! Building a layer stack over a fresh connection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use palantir_crypto::{Identity, PeerId};
use tracing::info;

use crate::encryption::EncryptionLayer;
use crate::error::{LayerError, Origin};
use crate::framing::DEFAULT_MAX_FRAME_SIZE;
use crate::handshake::{HandshakeLayer, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::mux::MuxLayer;
use crate::relay::RelayLayer;
use crate::traits::{Envelope, Layer, LayerEvent, Transport};

/// Optional layer stacked above relay routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OuterLayer {
    Encryption,
}

impl FromStr for OuterLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "encryption" => Ok(OuterLayer::Encryption),
            other => Err(format!("unknown layer '{other}'")),
        }
    }
}

impl fmt::Display for OuterLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OuterLayer::Encryption => f.write_str("encryption"),
        }
    }
}

/// Assembles `[outer layers] -> relay -> handshake -> mux -> connection`.
pub struct StackBuilder {
    identity: Arc<Identity>,
    outer: Vec<OuterLayer>,
    relay_id: Option<PeerId>,
    max_frame_size: usize,
    handshake_timeout: Duration,
    credential: Vec<u8>,
}

impl StackBuilder {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            outer: Vec::new(),
            relay_id: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            credential: Vec::new(),
        }
    }

    /// Add an outer layer. Layers listed first end up outermost.
    pub fn layer(mut self, layer: OuterLayer) -> Self {
        self.outer.push(layer);
        self
    }

    pub fn pin_relay(mut self, relay_id: Option<PeerId>) -> Self {
        self.relay_id = relay_id;
        self
    }

    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Credential presented to the relay's admission policy.
    pub fn credential(mut self, credential: impl Into<Vec<u8>>) -> Self {
        self.credential = credential.into();
        self
    }

    /// Open a connection to `addr` and build the full stack over it.
    ///
    /// Returns once the handshake with the relay has completed.
    pub async fn connect(
        self,
        transport: &dyn Transport,
        addr: &str,
    ) -> Result<Stack, LayerError> {
        let conn = transport.open(addr).await.map_err(LayerError::from)?;
        let mux = MuxLayer::with_max_frame_size(conn, self.max_frame_size);
        let handshake = HandshakeLayer::initiate_with_credential(
            Box::new(mux),
            &self.identity,
            self.handshake_timeout,
            &self.credential,
        )
        .await?;
        let relay = RelayLayer::new(Box::new(handshake), self.relay_id).await?;
        info!(%addr, relay = %relay.relay_id().short(), "connected to relay");

        let mut top: Box<dyn Layer> = Box::new(relay);
        for layer in self.outer.iter().rev() {
            top = match layer {
                OuterLayer::Encryption => {
                    Box::new(EncryptionLayer::new(top, self.identity.clone()))
                }
            };
        }
        Ok(Stack { top })
    }
}

/// A fully built stack, addressed through its outermost layer.
pub struct Stack {
    top: Box<dyn Layer>,
}

impl Stack {
    pub fn from_layer(top: Box<dyn Layer>) -> Self {
        Self { top }
    }

    /// Layer kinds from outermost to innermost.
    pub fn layers(&self) -> Vec<Origin> {
        let mut kinds = Vec::new();
        let mut current = Some(self.top.as_ref());
        while let Some(layer) = current {
            kinds.push(layer.kind());
            current = layer.inner();
        }
        kinds
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), LayerError> {
        self.top.send(envelope).await
    }

    pub async fn next_event(&self) -> Result<LayerEvent, LayerError> {
        self.top.next_event().await
    }

    pub async fn close(&self) {
        self.top.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTransport;
    use crate::error::ErrorKind;

    #[test]
    fn test_outer_layer_names() {
        assert_eq!("Encryption".parse::<OuterLayer>(), Ok(OuterLayer::Encryption));
        assert!("compression".parse::<OuterLayer>().is_err());
        assert_eq!(OuterLayer::Encryption.to_string(), "encryption");
    }

    #[tokio::test]
    async fn test_builds_full_chain_against_responder() {
        let net = MemoryTransport::new();
        let listener = net.listen("mem:relay").await.unwrap();
        let relay_identity = Identity::generate();
        let relay_id = relay_identity.peer_id();

        let responder = async {
            let conn = listener.accept().await.unwrap();
            let mux = Box::new(MuxLayer::new(conn));
            HandshakeLayer::respond(mux, &relay_identity, DEFAULT_HANDSHAKE_TIMEOUT)
                .await
                .unwrap()
        };
        let client = StackBuilder::new(Arc::new(Identity::generate()))
            .layer(OuterLayer::Encryption)
            .pin_relay(Some(relay_id))
            .connect(&net, "mem:relay");

        let (_server, stack) = tokio::join!(responder, client);
        let stack = stack.unwrap();
        assert_eq!(
            stack.layers(),
            vec![Origin::Encryption, Origin::Relay, Origin::Handshake, Origin::Framing]
        );
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_connect_failed() {
        let net = MemoryTransport::new();
        let err = StackBuilder::new(Arc::new(Identity::generate()))
            .connect(&net, "mem:nowhere")
            .await
            .err()
            .unwrap();
        assert_eq!(err.origin, Origin::Transport);
        assert!(matches!(err.kind, ErrorKind::ConnectFailed(_)));
    }
}
