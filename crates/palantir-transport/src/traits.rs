//! Transport and layer traits.
//!
//! A [`Transport`] produces raw byte [`Connection`]s. A [`Layer`] wraps exactly
//! one inner layer (or, for the innermost layer, a connection) and adds a
//! single concern while keeping the same send / next_event / close contract.

use async_trait::async_trait;
use bytes::Bytes;
use palantir_crypto::{PeerBundle, PeerId};

use crate::error::{LayerError, Origin, TransportError};

/// Factory for connections to and from network addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection. No retry is attempted on failure.
    async fn open(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Bind a listener for inbound connections.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Address actually bound, which differs from the requested one for port 0.
    fn local_addr(&self) -> String;
}

/// An ordered, reliable byte pipe to one remote endpoint.
///
/// `recv` returns whatever bytes are available, not message boundaries.
/// A clean close by the remote end surfaces as [`TransportError::Closed`].
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Cancellation safe: dropping the future never loses received bytes.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    async fn close(&self);

    fn remote_addr(&self) -> String;
}

/// Logical sub-stream of a link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl ChannelId {
    pub const DEFAULT: ChannelId = ChannelId(0);
}

impl From<u16> for ChannelId {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

/// Addressed message. `peer` is the destination on send and the source on receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub peer: PeerId,
    pub channel: ChannelId,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(peer: PeerId, channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            peer,
            channel,
            payload: payload.into(),
        }
    }
}

/// How a peer is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Over the link itself.
    Direct,
    /// Through a relay; `token` identifies the peer's relay connection.
    Relayed { token: u64 },
}

/// Local record of a reachable peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerHandle {
    pub peer_id: PeerId,
    pub bundle: Option<PeerBundle>,
    pub route: Route,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerEvent {
    Joined(PeerHandle),
    Left(PeerId),
    Message(Envelope),
}

/// One concern in a protocol stack.
///
/// `next_event` is driven by a single task and must be cancellation safe;
/// `send` may be called concurrently with it. After `close`, a pending or
/// future `next_event` returns `Closed`.
#[async_trait]
pub trait Layer: Send + Sync {
    fn kind(&self) -> Origin;

    /// The wrapped layer, `None` for the layer sitting on the connection.
    fn inner(&self) -> Option<&dyn Layer>;

    async fn send(&self, envelope: Envelope) -> Result<(), LayerError>;

    async fn next_event(&self) -> Result<LayerEvent, LayerError>;

    /// Close this layer and everything beneath it, outermost first.
    async fn close(&self);
}
