//! Error types surfaced by a [`Palantir`](crate::Palantir) instance.

use std::time::Duration;

use palantir_crypto::PeerId;
use palantir_transport::LayerError;
use thiserror::Error;

use crate::descriptor::DescriptorError;

#[derive(Debug, Error)]
pub enum PalantirError {
    /// The stack could not be built: transport, handshake or relay pinning failed.
    #[error("connect failed: {0}")]
    Connect(LayerError),

    /// Destination not in the local peer table. Nothing was sent.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("send failed: {0}")]
    SendFailed(LayerError),

    /// The instance was disconnected or its stack terminated.
    #[error("instance closed")]
    Closed,

    /// The event sequence was already handed out.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// No response arrived in time. A late response is discarded.
    #[error("request to {peer} timed out after {after:?}")]
    RequestTimedOut { peer: PeerId, after: Duration },

    /// The peer left or the instance closed before responding.
    #[error("request to {0} aborted")]
    RequestAborted(PeerId),

    #[error("invalid network descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
}

impl PalantirError {
    /// Local validation failures with no network effect; safe to retry after discovery.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            PalantirError::UnknownPeer(_)
                | PalantirError::AlreadySubscribed
                | PalantirError::InvalidDescriptor(_)
        )
    }
}
