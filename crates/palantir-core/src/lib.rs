//! Palantir: addressed, authenticated, multiplexed messaging between peers.
//!
//! ```no_run
//! # async fn demo() -> Result<(), palantir_core::PalantirError> {
//! use palantir_core::{Identity, NetworkDescriptor, Palantir};
//!
//! let descriptor = NetworkDescriptor::new("127.0.0.1:7400");
//! let palantir = Palantir::connect(&descriptor, Identity::generate()).await?;
//! let mut events = palantir.subscribe_peer_events()?;
//! let mut inbox = palantir.receive()?;
//!
//! let joined = events.next().await?;
//! palantir.send(joined.peer(), &b"hello"[..]).await?;
//! let reply = inbox.next().await?;
//! println!("{} says {:?}", reply.peer, reply.payload);
//!
//! let answer = palantir.request(joined.peer(), &b"status?"[..]).await?;
//! println!("status: {answer:?}");
//! palantir.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
pub mod errors;
pub mod events;
pub mod instance;
pub mod message;
pub mod peers;
pub mod request;

pub use descriptor::{DescriptorError, NetworkDescriptor};
pub use errors::PalantirError;
pub use events::{Delivery, Inbox, PeerEvent, PeerEvents, Requests};
pub use instance::{Palantir, DEFAULT_REQUEST_TIMEOUT};
pub use message::{AppMessage, MessageError};
pub use peers::PeerTable;
pub use request::{PendingRequests, PendingResponse, Request};

pub use palantir_crypto::{Identity, PeerId};
pub use palantir_transport::{ChannelId, LayerError, Origin};
