//! Error taxonomy shared by transports and layers.

use std::fmt;

use palantir_crypto::PeerId;
use thiserror::Error;

/// Errors raised by a raw [`Connection`](crate::traits::Connection) or
/// [`Transport`](crate::traits::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Which layer raised an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Transport,
    Framing,
    Handshake,
    Relay,
    Encryption,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Origin::Transport => "transport",
            Origin::Framing => "framing",
            Origin::Handshake => "handshake",
            Origin::Relay => "relay",
            Origin::Encryption => "encryption",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("authentication failed for peer {0}")]
    AuthenticationFailed(PeerId),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(String),

    #[error("closed")]
    Closed,

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Error surfaced by any layer, tagged with the layer that raised it.
///
/// Layers never rewrap an inner error, so `origin` always names the layer
/// where the failure happened.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{origin} layer: {kind}")]
pub struct LayerError {
    pub origin: Origin,
    pub kind: ErrorKind,
}

impl LayerError {
    pub fn new(origin: Origin, kind: ErrorKind) -> Self {
        Self { origin, kind }
    }

    pub fn closed(origin: Origin) -> Self {
        Self::new(origin, ErrorKind::Closed)
    }

    pub fn malformed(origin: Origin, detail: impl Into<String>) -> Self {
        Self::new(origin, ErrorKind::MalformedFrame(detail.into()))
    }

    pub fn handshake(detail: impl Into<String>) -> Self {
        Self::new(Origin::Handshake, ErrorKind::HandshakeFailed(detail.into()))
    }

    pub fn unknown_peer(origin: Origin, peer: PeerId) -> Self {
        Self::new(origin, ErrorKind::UnknownPeer(peer))
    }

    /// Whether the connection underneath is unusable after this error.
    ///
    /// `AuthenticationFailed` and `UnknownPeer` concern one remote peer and
    /// leave the link to everyone else intact.
    pub fn is_fatal(&self) -> bool {
        match &self.kind {
            ErrorKind::ConnectFailed(_)
            | ErrorKind::HandshakeFailed(_)
            | ErrorKind::MalformedFrame(_)
            | ErrorKind::FrameTooLarge { .. }
            | ErrorKind::Closed => true,
            ErrorKind::Io(_) => self.origin == Origin::Transport,
            ErrorKind::AuthenticationFailed(_) | ErrorKind::UnknownPeer(_) => false,
        }
    }

    /// Errors that may indicate a misbehaving or malicious peer.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::HandshakeFailed(_)
                | ErrorKind::AuthenticationFailed(_)
                | ErrorKind::MalformedFrame(_)
                | ErrorKind::FrameTooLarge { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        self.kind == ErrorKind::Closed
    }
}

impl From<TransportError> for LayerError {
    fn from(err: TransportError) -> Self {
        let kind = match err {
            TransportError::Closed => ErrorKind::Closed,
            TransportError::ConnectFailed { addr, reason } => {
                ErrorKind::ConnectFailed(format!("{addr}: {reason}"))
            }
            TransportError::InvalidAddress(addr) => {
                ErrorKind::ConnectFailed(format!("invalid address {addr}"))
            }
            TransportError::Io(e) => ErrorKind::Io(e.to_string()),
        };
        LayerError::new(Origin::Transport, kind)
    }
}
