//! Admission policy consulted by the responding end of a handshake.

use async_trait::async_trait;
use thiserror::Error;

use crate::traits::PeerHandle;

/// Longest credential an initiator may attach to its AUTH.
pub const MAX_CREDENTIAL_LEN: usize = 512;

/// Reason returned to the initiator when it is turned away.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Decides whether an authenticated peer may use the link.
///
/// Called after both signatures verified, so `peer` is authentic and the
/// `credential` is covered by the initiator's signature. A rejection fails
/// the handshake on both ends.
#[async_trait]
pub trait Admission: Send + Sync {
    async fn admit(&self, peer: &PeerHandle, credential: &[u8]) -> Result<(), Rejection>;
}

/// Admits every authenticated peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdmitAll;

#[async_trait]
impl Admission for AdmitAll {
    async fn admit(&self, _peer: &PeerHandle, _credential: &[u8]) -> Result<(), Rejection> {
        Ok(())
    }
}
