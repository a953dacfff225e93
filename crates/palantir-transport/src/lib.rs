//! Transports and composable protocol layers for Palantir.
//!
//! A stack is built from a single [`Connection`] upwards: [`MuxLayer`] frames
//! the byte pipe, [`HandshakeLayer`] authenticates the remote end,
//! [`RelayLayer`] routes to peers behind a relay, and [`EncryptionLayer`]
//! seals payloads end to end. [`StackBuilder`] wires them together.

pub mod admission;
pub mod connection;
pub mod encryption;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod mux;
pub mod relay;
pub mod stack;
pub mod tcp;
pub mod testing;
pub mod traits;
pub mod wire;

pub use admission::{AdmitAll, Admission, Rejection, MAX_CREDENTIAL_LEN};
pub use connection::StreamConnection;
pub use encryption::EncryptionLayer;
pub use error::{ErrorKind, LayerError, Origin, TransportError};
pub use framing::{FrameCodec, FramingError, DEFAULT_MAX_FRAME_SIZE};
pub use handshake::{HandshakeLayer, Role, DEFAULT_HANDSHAKE_TIMEOUT};
pub use mux::MuxLayer;
pub use relay::RelayLayer;
pub use stack::{OuterLayer, Stack, StackBuilder};
pub use tcp::TcpTransport;
pub use traits::*;
pub use wire::{RelayFrame, WireError};
