//! Who the relay lets in after authentication.

use std::collections::HashSet;

use async_trait::async_trait;
use constant_time_eq::constant_time_eq;
use palantir_crypto::PeerId;
use palantir_transport::{Admission, PeerHandle, Rejection};
use tracing::info;

use crate::config::{ConfigError, RelayConfig};

/// Allow-list and shared access token from [`RelayConfig`].
///
/// With neither configured every authenticated peer is admitted.
#[derive(Debug, Default)]
pub struct RelayAdmission {
    allowed_peers: Option<HashSet<PeerId>>,
    access_token: Option<Vec<u8>>,
}

impl RelayAdmission {
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let allowed = config.allowed_peer_ids()?;
        Ok(Self {
            allowed_peers: (!allowed.is_empty()).then(|| allowed.into_iter().collect()),
            access_token: config.access_token.as_ref().map(|t| t.as_bytes().to_vec()),
        })
    }

    /// Whether any authenticated peer gets in.
    pub fn is_open(&self) -> bool {
        self.allowed_peers.is_none() && self.access_token.is_none()
    }
}

#[async_trait]
impl Admission for RelayAdmission {
    async fn admit(&self, peer: &PeerHandle, credential: &[u8]) -> Result<(), Rejection> {
        if let Some(allowed) = &self.allowed_peers {
            if !allowed.contains(&peer.peer_id) {
                info!(peer = %peer.peer_id.short(), "peer not on the allow list");
                return Err(Rejection::new("peer not allowed"));
            }
        }
        if let Some(token) = &self.access_token {
            if !constant_time_eq(token, credential) {
                info!(peer = %peer.peer_id.short(), "wrong access token");
                return Err(Rejection::new("invalid access token"));
            }
        }
        Ok(())
    }
}
