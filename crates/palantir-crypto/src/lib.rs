#![forbid(unsafe_code)]

pub mod identity;
pub mod session_crypto;
pub mod transcript;

pub use identity::{verify_signature, Identity, IdentityError, PeerBundle, PeerId, BUNDLE_LEN};
pub use session_crypto::{PeerSession, SessionCryptoError};
pub use transcript::Transcript;

#[cfg(test)]
mod proptests;
