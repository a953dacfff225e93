//! Relay wire format, carried inside mux frame payloads after the handshake.
//!
//! ```text
//! 0x01 DATA    peer_id[32] || payload          destination (to relay) / source (from relay)
//! 0x02 JOINED  token u64 BE || bundle[128]     relay -> client
//! 0x03 LEFT    token u64 BE || peer_id[32]     relay -> client
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use palantir_crypto::{PeerBundle, PeerId, BUNDLE_LEN};
use thiserror::Error;

pub const KIND_DATA: u8 = 0x01;
pub const KIND_JOINED: u8 = 0x02;
pub const KIND_LEFT: u8 = 0x03;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty relay frame")]
    Empty,
    #[error("unknown relay frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("relay frame kind 0x{kind:02x} truncated: {len} body bytes")]
    Truncated { kind: u8, len: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayFrame {
    Data { peer: PeerId, payload: Bytes },
    Joined { token: u64, bundle: PeerBundle },
    Left { token: u64, peer: PeerId },
}

impl RelayFrame {
    pub fn kind(&self) -> u8 {
        match self {
            RelayFrame::Data { .. } => KIND_DATA,
            RelayFrame::Joined { .. } => KIND_JOINED,
            RelayFrame::Left { .. } => KIND_LEFT,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            RelayFrame::Data { peer, payload } => {
                let mut out = BytesMut::with_capacity(1 + 32 + payload.len());
                out.put_u8(KIND_DATA);
                out.extend_from_slice(peer.as_bytes());
                out.extend_from_slice(payload);
                out.freeze()
            }
            RelayFrame::Joined { token, bundle } => {
                let mut out = BytesMut::with_capacity(1 + 8 + BUNDLE_LEN);
                out.put_u8(KIND_JOINED);
                out.put_u64(*token);
                out.extend_from_slice(&bundle.to_bytes());
                out.freeze()
            }
            RelayFrame::Left { token, peer } => {
                let mut out = BytesMut::with_capacity(1 + 8 + 32);
                out.put_u8(KIND_LEFT);
                out.put_u64(*token);
                out.extend_from_slice(peer.as_bytes());
                out.freeze()
            }
        }
    }

    /// Decode one frame. DATA payloads are zero-copy slices of `frame`.
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        if frame.is_empty() {
            return Err(WireError::Empty);
        }
        let kind = frame.get_u8();
        let truncated = |len| WireError::Truncated { kind, len };
        match kind {
            KIND_DATA => {
                if frame.len() < 32 {
                    return Err(truncated(frame.len()));
                }
                let peer = read_peer(&mut frame);
                Ok(RelayFrame::Data {
                    peer,
                    payload: frame,
                })
            }
            KIND_JOINED => {
                if frame.len() != 8 + BUNDLE_LEN {
                    return Err(truncated(frame.len()));
                }
                let token = frame.get_u64();
                let bundle =
                    PeerBundle::from_bytes(&frame).map_err(|_| truncated(frame.len()))?;
                Ok(RelayFrame::Joined { token, bundle })
            }
            KIND_LEFT => {
                if frame.len() != 8 + 32 {
                    return Err(truncated(frame.len()));
                }
                let token = frame.get_u64();
                let peer = read_peer(&mut frame);
                Ok(RelayFrame::Left { token, peer })
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

fn read_peer(buf: &mut Bytes) -> PeerId {
    let mut id = [0u8; 32];
    buf.copy_to_slice(&mut id);
    PeerId(id)
}

/// Rewrite the peer id of an encoded DATA frame in place of re-encoding the payload.
///
/// The relay uses this to turn a client's destination into the sender's id.
pub fn readdress_data(frame: &[u8], source: &PeerId) -> Result<Bytes, WireError> {
    match frame.first() {
        None => Err(WireError::Empty),
        Some(&KIND_DATA) if frame.len() >= 33 => {
            let mut out = BytesMut::with_capacity(frame.len());
            out.put_u8(KIND_DATA);
            out.extend_from_slice(source.as_bytes());
            out.extend_from_slice(&frame[33..]);
            Ok(out.freeze())
        }
        Some(&KIND_DATA) => Err(WireError::Truncated {
            kind: KIND_DATA,
            len: frame.len() - 1,
        }),
        Some(&other) => Err(WireError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palantir_crypto::Identity;
    use proptest::prelude::*;

    #[test]
    fn test_joined_layout() {
        let bundle = Identity::generate().bundle();
        let frame = RelayFrame::Joined { token: 0x0102, bundle }.encode();
        assert_eq!(frame.len(), 1 + 8 + BUNDLE_LEN);
        assert_eq!(&frame[..9], &[KIND_JOINED, 0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(
            RelayFrame::decode(frame).unwrap(),
            RelayFrame::Joined { token: 0x0102, bundle }
        );
    }

    #[test]
    fn test_left_round_trip() {
        let frame = RelayFrame::Left {
            token: 9,
            peer: PeerId([3; 32]),
        };
        assert_eq!(RelayFrame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(RelayFrame::decode(Bytes::new()), Err(WireError::Empty));
        assert_eq!(
            RelayFrame::decode(Bytes::from_static(&[0x7f, 1, 2])),
            Err(WireError::UnknownKind(0x7f))
        );
        assert_eq!(
            RelayFrame::decode(Bytes::from_static(&[KIND_DATA, 1, 2])),
            Err(WireError::Truncated { kind: KIND_DATA, len: 2 })
        );
        assert!(RelayFrame::decode(Bytes::from_static(&[KIND_LEFT, 0, 0])).is_err());
    }

    #[test]
    fn test_readdress_keeps_payload() {
        let dest = PeerId([1; 32]);
        let source = PeerId([2; 32]);
        let frame = RelayFrame::Data {
            peer: dest,
            payload: Bytes::from_static(b"body"),
        }
        .encode();

        let rewritten = readdress_data(&frame, &source).unwrap();
        assert_eq!(
            RelayFrame::decode(rewritten).unwrap(),
            RelayFrame::Data {
                peer: source,
                payload: Bytes::from_static(b"body"),
            }
        );
        assert!(readdress_data(&[KIND_LEFT; 41], &source).is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..300)) {
            let _ = RelayFrame::decode(Bytes::from(data));
        }

        #[test]
        fn prop_data_payload_preserved(
            peer in any::<[u8; 32]>(),
            payload in prop::collection::vec(any::<u8>(), 0..1024)
        ) {
            let frame = RelayFrame::Data { peer: PeerId(peer), payload: Bytes::from(payload) };
            prop_assert_eq!(RelayFrame::decode(frame.encode()).unwrap(), frame);
        }
    }
}
