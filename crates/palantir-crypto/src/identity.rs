//! Peer identity: keypairs, derived peer ids and announced public bundles.
//!
//! An [`Identity`] holds an Ed25519 signing key and an X25519 key agreement key.
//! The public identifier of a peer is `SHA-256(ed25519_public_key)`, so two
//! identities with equal [`PeerId`]s necessarily share the same signing key.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Domain separator for the signature binding a key agreement key to a signing key.
const BUNDLE_DOMAIN: &[u8] = b"palantir-bundle-v1";

/// Encoded size of a [`PeerBundle`]: sign_pub(32) || kex_pub(32) || binding_sig(64).
pub const BUNDLE_LEN: usize = 128;

/// Error type for identity operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid peer id encoding")]
    InvalidPeerId,
}

/// Fixed-length public identifier of a peer, derived from its signing key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Placeholder for the remote end of a point-to-point link whose identity
    /// has not been bound by a handshake yet.
    pub const UNBOUND: PeerId = PeerId([0u8; 32]);

    /// Derive the id for an Ed25519 public key.
    pub fn from_sign_pub(sign_pub: &[u8; 32]) -> Self {
        let digest = Sha256::digest(sign_pub);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let id: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self(id))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full 64-character hex id.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidPeerId)?;
        Self::from_slice(&bytes).map_err(|_| IdentityError::InvalidPeerId)
    }

    /// Abbreviated form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    pub fn is_unbound(&self) -> bool {
        *self == Self::UNBOUND
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// Public material a peer announces about itself.
///
/// `binding_sig` is the peer's Ed25519 signature over the key agreement key, so a
/// bundle can be checked end to end without trusting whoever relayed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerBundle {
    pub sign_pub: [u8; 32],
    pub kex_pub: [u8; 32],
    pub binding_sig: [u8; 64],
}

impl PeerBundle {
    /// Id derived from the bundle's signing key. Does not check the binding.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_sign_pub(&self.sign_pub)
    }

    /// Check that the key agreement key was signed by the signing key and
    /// return the derived peer id.
    pub fn verify(&self) -> Result<PeerId, IdentityError> {
        verify_signature(&self.sign_pub, &binding_message(&self.kex_pub), &self.binding_sig)?;
        Ok(self.peer_id())
    }

    pub fn to_bytes(&self) -> [u8; BUNDLE_LEN] {
        let mut out = [0u8; BUNDLE_LEN];
        out[..32].copy_from_slice(&self.sign_pub);
        out[32..64].copy_from_slice(&self.kex_pub);
        out[64..].copy_from_slice(&self.binding_sig);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != BUNDLE_LEN {
            return Err(IdentityError::InvalidKeyLength {
                expected: BUNDLE_LEN,
                got: bytes.len(),
            });
        }
        let mut sign_pub = [0u8; 32];
        let mut kex_pub = [0u8; 32];
        let mut binding_sig = [0u8; 64];
        sign_pub.copy_from_slice(&bytes[..32]);
        kex_pub.copy_from_slice(&bytes[32..64]);
        binding_sig.copy_from_slice(&bytes[64..]);
        Ok(Self {
            sign_pub,
            kex_pub,
            binding_sig,
        })
    }
}

fn binding_message(kex_pub: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(BUNDLE_DOMAIN.len() + 32);
    msg.extend_from_slice(BUNDLE_DOMAIN);
    msg.extend_from_slice(kex_pub);
    msg
}

/// A cryptographic identity with Ed25519 signing key and X25519 key exchange key.
///
/// Created at application start or from key material loaded by an external key
/// store. Key material is zeroized when the Identity is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)] // SigningKey implements Zeroize internally
    sign_key: SigningKey,
    #[zeroize(skip)] // StaticSecret implements Zeroize internally
    kex_key: StaticSecret,
}

impl Identity {
    /// Generate a new random identity using the OS random source.
    pub fn generate() -> Self {
        let sign_key = SigningKey::generate(&mut OsRng);
        let kex_key = StaticSecret::random_from_rng(OsRng);
        Self { sign_key, kex_key }
    }

    /// Rebuild an identity from stored secrets.
    ///
    /// # Arguments
    /// * `sign_key_bytes` - 32-byte Ed25519 private key seed
    /// * `kex_key_bytes` - 32-byte X25519 private key
    pub fn from_bytes(sign_key_bytes: &[u8; 32], kex_key_bytes: &[u8; 32]) -> Self {
        let sign_key = SigningKey::from_bytes(sign_key_bytes);
        let kex_key = StaticSecret::from(*kex_key_bytes);
        Self { sign_key, kex_key }
    }

    /// Parse the 64-byte `sign_seed || kex_secret` hex form used by config files.
    pub fn from_secret_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidPublicKey)?;
        if bytes.len() != 64 {
            return Err(IdentityError::InvalidKeyLength {
                expected: 64,
                got: bytes.len(),
            });
        }
        let mut sign = [0u8; 32];
        let mut kex = [0u8; 32];
        sign.copy_from_slice(&bytes[..32]);
        kex.copy_from_slice(&bytes[32..]);
        let identity = Self::from_bytes(&sign, &kex);
        sign.zeroize();
        kex.zeroize();
        Ok(identity)
    }

    /// Export `(sign_seed, kex_secret)` for an external key store.
    pub fn to_bytes(&self) -> ([u8; 32], [u8; 32]) {
        (self.sign_key.to_bytes(), self.kex_key.to_bytes())
    }

    /// ID = SHA-256(sign_pub)
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_sign_pub(&self.sign_pub())
    }

    pub fn sign_pub(&self) -> [u8; 32] {
        self.sign_key.verifying_key().to_bytes()
    }

    pub fn kex_pub(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.kex_key).as_bytes()
    }

    /// Public bundle announcing this identity, with the key agreement key
    /// bound to the signing key.
    pub fn bundle(&self) -> PeerBundle {
        let kex_pub = self.kex_pub();
        PeerBundle {
            sign_pub: self.sign_pub(),
            kex_pub,
            binding_sig: self.sign(&binding_message(&kex_pub)),
        }
    }

    /// Sign a message using Ed25519.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    /// X25519 Diffie-Hellman with a peer's key agreement key.
    pub fn key_exchange(&self, peer_kex_pub: &[u8; 32]) -> [u8; 32] {
        let peer_pub = X25519PublicKey::from(*peer_kex_pub);
        *self.kex_key.diffie_hellman(&peer_pub).as_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature.
pub fn verify_signature(
    pub_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pub_key).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}
