//! Tagged, length-prefixed transcript hashing.
//!
//! Both ends of a handshake append the same fields in the same order and
//! sign the resulting digest, so any field altered in transit changes the hash.

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};

/// Tags for the fields bound into a handshake transcript.
pub mod tags {
    pub const DOMAIN: u32 = 0;
    pub const VERSION: u32 = 1;
    pub const INITIATOR_HELLO: u32 = 2;
    pub const RESPONDER_HELLO: u32 = 3;
}

/// Deterministic transcript builder.
/// Each entry is (tag u32 BE, len u32 BE, bytes).
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self {
            buf: BytesMut::with_capacity(512),
        };
        t.append_bytes(tags::DOMAIN, domain.as_bytes());
        t
    }

    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_u8(&mut self, tag: u32, v: u8) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(1);
        self.buf.put_u8(v);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// SHA-256 of everything appended so far.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.buf).into()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_determinism() {
        let mut t1 = Transcript::new("test_domain");
        t1.append_bytes(tags::INITIATOR_HELLO, b"hello").append_u8(tags::VERSION, 1);
        let mut t2 = Transcript::new("test_domain");
        t2.append_bytes(tags::INITIATOR_HELLO, b"hello").append_u8(tags::VERSION, 1);

        assert_eq!(t1.as_bytes(), t2.as_bytes());
        assert_eq!(t1.hash(), t2.hash());
    }

    #[test]
    fn test_field_order_matters() {
        let mut t1 = Transcript::new("d");
        t1.append_bytes(tags::INITIATOR_HELLO, b"a")
            .append_bytes(tags::RESPONDER_HELLO, b"b");
        let mut t2 = Transcript::new("d");
        t2.append_bytes(tags::RESPONDER_HELLO, b"b")
            .append_bytes(tags::INITIATOR_HELLO, b"a");

        assert_ne!(t1.hash(), t2.hash());
    }

    #[test]
    fn test_length_prefix_prevents_ambiguity() {
        let mut t1 = Transcript::new("d");
        t1.append_bytes(2, b"ab").append_bytes(2, b"c");
        let mut t2 = Transcript::new("d");
        t2.append_bytes(2, b"a").append_bytes(2, b"bc");

        assert_ne!(t1.hash(), t2.hash());
    }

    #[test]
    fn test_different_domains_different_outputs() {
        let t1 = Transcript::new("domain_a");
        let t2 = Transcript::new("domain_b");
        assert_ne!(t1.hash(), t2.hash());
        assert!(!t1.is_empty());
        assert_eq!(t1.len(), 8 + "domain_a".len());
    }
}
