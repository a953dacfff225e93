//! Session cryptography module.
//!
//! Derives per-peer session keys from a static-static X25519 agreement and
//! seals payloads with ChaCha20Poly1305 under random nonces. Each side of a
//! pair gets its own directional key, chosen by the ordering of the two peer ids.

#![forbid(unsafe_code)]

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::identity::{Identity, IdentityError, PeerBundle, PeerId};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const LABEL_LO2HI: &[u8] = b"palantir_e2e_lo2hi_v1";
const LABEL_HI2LO: &[u8] = b"palantir_e2e_hi2lo_v1";

/// Error type for session crypto operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionCryptoError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid blob: too short")]
    InvalidBlob,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("RNG failed")]
    RngError,
    #[error("peer bundle rejected: {0}")]
    Bundle(#[from] IdentityError),
}

/// A single-direction AEAD cipher.
struct DirectionalKey {
    aead: ChaCha20Poly1305,
}

impl DirectionalKey {
    fn new(mut key: [u8; 32]) -> Self {
        let aead = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { aead }
    }
}

/// Symmetric session shared with one remote peer.
pub struct PeerSession {
    local: PeerId,
    remote: PeerId,
    outbound: DirectionalKey,
    inbound: DirectionalKey,
}

impl PeerSession {
    /// Derive the session with `remote` from our identity and its bundle.
    ///
    /// The bundle's binding signature is verified first, so a relay that
    /// swapped in its own key agreement key is caught here.
    pub fn derive(local: &Identity, remote: &PeerBundle) -> Result<Self, SessionCryptoError> {
        let remote_id = remote.verify()?;
        let mut shared = local.key_exchange(&remote.kex_pub);
        let session = Self::from_shared(&shared, local.peer_id(), remote_id);
        shared.zeroize();
        session
    }

    /// Build a session from an already agreed secret.
    ///
    /// Salt is `lo_id || hi_id`. When both ids are equal the lo2hi key serves
    /// both directions.
    pub fn from_shared(
        shared: &[u8; 32],
        local: PeerId,
        remote: PeerId,
    ) -> Result<Self, SessionCryptoError> {
        let (lo, hi) = if local <= remote { (local, remote) } else { (remote, local) };
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(lo.as_bytes());
        salt[32..].copy_from_slice(hi.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
        let mut lo2hi = [0u8; 32];
        let mut hi2lo = [0u8; 32];
        hk.expand(LABEL_LO2HI, &mut lo2hi)
            .map_err(|_| SessionCryptoError::KeyDerivation)?;
        hk.expand(LABEL_HI2LO, &mut hi2lo)
            .map_err(|_| SessionCryptoError::KeyDerivation)?;

        let (outbound, inbound) = if local == remote {
            (lo2hi, lo2hi)
        } else if local < remote {
            (lo2hi, hi2lo)
        } else {
            (hi2lo, lo2hi)
        };
        hi2lo.zeroize();
        lo2hi.zeroize();

        Ok(Self {
            local,
            remote,
            outbound: DirectionalKey::new(outbound),
            inbound: DirectionalKey::new(inbound),
        })
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Encrypt a payload for the remote peer on `channel`.
    ///
    /// Returns: nonce(12) || ciphertext+tag
    pub fn seal(&self, channel: u16, plaintext: &[u8]) -> Result<Vec<u8>, SessionCryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|_| SessionCryptoError::RngError)?;

        let aad = aad(&self.local, &self.remote, channel);
        let ct = self
            .outbound
            .aead
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| SessionCryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt a blob the remote peer sealed for us on `channel`.
    ///
    /// Expects: nonce(12) || ciphertext+tag
    pub fn open(&self, channel: u16, blob: &[u8]) -> Result<Vec<u8>, SessionCryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(SessionCryptoError::InvalidBlob);
        }
        let (nonce, ct) = blob.split_at(NONCE_LEN);
        let aad = aad(&self.remote, &self.local, channel);
        self.inbound
            .aead
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad: &aad })
            .map_err(|_| SessionCryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// sender || recipient || channel
fn aad(sender: &PeerId, recipient: &PeerId, channel: u16) -> [u8; 66] {
    let mut out = [0u8; 66];
    out[..32].copy_from_slice(sender.as_bytes());
    out[32..64].copy_from_slice(recipient.as_bytes());
    out[64..].copy_from_slice(&channel.to_be_bytes());
    out
}
