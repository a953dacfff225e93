use proptest::prelude::*;

use crate::identity::{verify_signature, Identity, PeerBundle};
use crate::session_crypto::{PeerSession, SessionCryptoError};
use crate::transcript::Transcript;

proptest! {
    #[test]
    fn transcript_is_deterministic(
        tag1 in any::<u32>(),
        data1 in any::<Vec<u8>>(),
        tag2 in any::<u32>(),
        data2 in any::<Vec<u8>>()
    ) {
        let mut t1 = Transcript::new("test");
        t1.append_bytes(tag1, &data1).append_bytes(tag2, &data2);
        let mut t2 = Transcript::new("test");
        t2.append_bytes(tag1, &data1).append_bytes(tag2, &data2);

        prop_assert_eq!(t1.hash(), t2.hash());
    }

    #[test]
    fn signature_round_trip(
        sign_seed in any::<[u8; 32]>(),
        kex_seed in any::<[u8; 32]>(),
        message in any::<Vec<u8>>()
    ) {
        let identity = Identity::from_bytes(&sign_seed, &kex_seed);
        let sig = identity.sign(&message);
        prop_assert!(verify_signature(&identity.sign_pub(), &message, &sig).is_ok());
    }

    #[test]
    fn bundle_encoding_preserves_verification(
        sign_seed in any::<[u8; 32]>(),
        kex_seed in any::<[u8; 32]>()
    ) {
        let identity = Identity::from_bytes(&sign_seed, &kex_seed);
        let decoded = PeerBundle::from_bytes(&identity.bundle().to_bytes()).unwrap();
        prop_assert_eq!(decoded.verify().unwrap(), identity.peer_id());
    }

    #[test]
    fn session_open_reproduces_sealed_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        channel in any::<u16>()
    ) {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let a = PeerSession::derive(&alice, &bob.bundle()).unwrap();
        let b = PeerSession::derive(&bob, &alice.bundle()).unwrap();

        let blob = a.seal(channel, &payload).unwrap();
        prop_assert_eq!(b.open(channel, &blob).unwrap(), payload);
    }

    #[test]
    fn session_bit_flip_never_yields_plaintext(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        flip in any::<prop::sample::Index>()
    ) {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let a = PeerSession::derive(&alice, &bob.bundle()).unwrap();
        let b = PeerSession::derive(&bob, &alice.bundle()).unwrap();

        let mut blob = a.seal(0, &payload).unwrap();
        let i = flip.index(blob.len());
        blob[i] ^= 0x80;
        prop_assert_eq!(b.open(0, &blob), Err(SessionCryptoError::DecryptionFailed));
    }
}
