//! Framing and channel multiplexing over a raw connection.

use async_trait::async_trait;
use bytes::BytesMut;
use palantir_crypto::PeerId;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::{ErrorKind, LayerError, Origin, TransportError};
use crate::framing::{FrameCodec, FramingError, DEFAULT_MAX_FRAME_SIZE};
use crate::traits::{Connection, Envelope, Layer, LayerEvent, PeerHandle, Route};

struct ReadState {
    buf: BytesMut,
    announced: bool,
    failed: bool,
}

/// Innermost layer: turns a byte pipe into channel-tagged frames.
///
/// The remote end is addressed as [`PeerId::UNBOUND`]; outbound envelopes go
/// to the link regardless of their `peer`. A single `Joined(UNBOUND)` is
/// emitted first so the layer above can observe the link.
pub struct MuxLayer {
    conn: Box<dyn Connection>,
    codec: FrameCodec,
    read: Mutex<ReadState>,
    closed: watch::Sender<bool>,
}

impl MuxLayer {
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self::with_max_frame_size(conn, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(conn: Box<dyn Connection>, max_frame_size: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            conn,
            codec: FrameCodec::new(max_frame_size),
            read: Mutex::new(ReadState {
                buf: BytesMut::with_capacity(8 * 1024),
                announced: false,
                failed: false,
            }),
            closed,
        }
    }

    pub fn remote_addr(&self) -> String {
        self.conn.remote_addr()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Protocol violation on the read side: tear the link down.
    async fn fail(&self, state: &mut ReadState, err: FramingError) -> LayerError {
        state.failed = true;
        state.buf.clear();
        let kind = match err {
            FramingError::TooLarge(size, max) => ErrorKind::FrameTooLarge { size, max },
            FramingError::Truncated(len) => {
                ErrorKind::MalformedFrame(format!("frame length {len} below header size"))
            }
        };
        let err = LayerError::new(Origin::Framing, kind);
        warn!(
            security = true,
            remote = %self.conn.remote_addr(),
            error = %err,
            "closing link on bad frame"
        );
        self.closed.send_replace(true);
        self.conn.close().await;
        err
    }
}

#[async_trait]
impl Layer for MuxLayer {
    fn kind(&self) -> Origin {
        Origin::Framing
    }

    fn inner(&self) -> Option<&dyn Layer> {
        None
    }

    async fn send(&self, envelope: Envelope) -> Result<(), LayerError> {
        if self.is_closed() {
            return Err(LayerError::closed(Origin::Framing));
        }
        let frame = self
            .codec
            .encode(envelope.channel, &envelope.payload)
            .map_err(|e| match e {
                FramingError::TooLarge(size, max) => {
                    LayerError::new(Origin::Framing, ErrorKind::FrameTooLarge { size, max })
                }
                FramingError::Truncated(_) => LayerError::malformed(Origin::Framing, e.to_string()),
            })?;
        self.conn.send(&frame).await.map_err(LayerError::from)
    }

    async fn next_event(&self) -> Result<LayerEvent, LayerError> {
        let mut closed = self.closed.subscribe();
        let mut state = self.read.lock().await;

        if state.failed {
            return Err(LayerError::closed(Origin::Framing));
        }
        if !state.announced {
            state.announced = true;
            return Ok(LayerEvent::Joined(PeerHandle {
                peer_id: PeerId::UNBOUND,
                bundle: None,
                route: Route::Direct,
            }));
        }

        loop {
            match self.codec.decode_stream(&mut state.buf) {
                Ok(Some((channel, payload))) => {
                    return Ok(LayerEvent::Message(Envelope {
                        peer: PeerId::UNBOUND,
                        channel,
                        payload,
                    }));
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(&mut state, e).await),
            }

            let chunk = tokio::select! {
                _ = closed.wait_for(|c| *c) => {
                    return Err(LayerError::closed(Origin::Framing));
                }
                chunk = self.conn.recv() => chunk,
            };
            match chunk {
                Ok(bytes) => state.buf.extend_from_slice(&bytes),
                Err(TransportError::Closed) => {
                    debug!(remote = %self.conn.remote_addr(), "link closed by remote");
                    state.failed = true;
                    return Err(LayerError::closed(Origin::Transport));
                }
                Err(e) => {
                    state.failed = true;
                    return Err(e.into());
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.conn.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::connection_pair;
    use crate::traits::ChannelId;
    use bytes::Bytes;

    fn joined_unbound() -> LayerEvent {
        LayerEvent::Joined(PeerHandle {
            peer_id: PeerId::UNBOUND,
            bundle: None,
            route: Route::Direct,
        })
    }

    #[tokio::test]
    async fn test_frames_cross_link_in_order() {
        let (a, b) = connection_pair();
        let a = MuxLayer::new(a);
        let b = MuxLayer::new(b);

        assert_eq!(b.next_event().await.unwrap(), joined_unbound());

        for i in 0u8..10 {
            a.send(Envelope::new(PeerId::UNBOUND, ChannelId(1), vec![i; 3]))
                .await
                .unwrap();
        }
        for i in 0u8..10 {
            match b.next_event().await.unwrap() {
                LayerEvent::Message(env) => {
                    assert_eq!(env.channel, ChannelId(1));
                    assert_eq!(env.payload, Bytes::from(vec![i; 3]));
                    assert!(env.peer.is_unbound());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_link() {
        let (raw, b) = connection_pair();
        let b = MuxLayer::with_max_frame_size(b, 64);
        assert_eq!(b.next_event().await.unwrap(), joined_unbound());

        // Header announcing 1000 bytes followed by a partial body.
        let mut wire = vec![0u8, 0, 0x03, 0xE8, 0, 1];
        wire.extend_from_slice(&[0xAA; 32]);
        raw.send(&wire).await.unwrap();

        let err = b.next_event().await.unwrap_err();
        assert_eq!(
            err,
            LayerError::new(Origin::Framing, ErrorKind::FrameTooLarge { size: 1000, max: 64 })
        );
        assert!(err.is_fatal());

        // Nothing is delivered afterwards and the remote sees the close.
        assert!(b.next_event().await.unwrap_err().is_closed());
        assert!(matches!(raw.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_short_length_is_malformed() {
        let (raw, b) = connection_pair();
        let b = MuxLayer::new(b);
        b.next_event().await.unwrap();

        raw.send(&[0, 0, 0, 1, 0]).await.unwrap();
        let err = b.next_event().await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MalformedFrame(_)));
        assert!(err.is_security_relevant());
    }

    #[tokio::test]
    async fn test_partial_reads_reassemble() {
        let (raw, b) = connection_pair();
        let b = MuxLayer::new(b);
        b.next_event().await.unwrap();

        let frame = FrameCodec::default().encode(ChannelId(4), b"split me").unwrap();
        let (first, rest) = frame.split_at(3);
        raw.send(first).await.unwrap();
        tokio::task::yield_now().await;
        raw.send(rest).await.unwrap();

        match b.next_event().await.unwrap() {
            LayerEvent::Message(env) => assert_eq!(&env.payload[..], b"split me"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let (_a, b) = connection_pair();
        let b = std::sync::Arc::new(MuxLayer::new(b));
        b.next_event().await.unwrap();

        let reader = {
            let b = b.clone();
            tokio::spawn(async move { b.next_event().await })
        };
        tokio::task::yield_now().await;
        b.close().await;

        let err = reader.await.unwrap().unwrap_err();
        assert!(err.is_closed());
        assert!(b
            .send(Envelope::new(PeerId::UNBOUND, ChannelId(0), Bytes::new()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_outbound_too_large_rejected() {
        let (a, _b) = connection_pair();
        let a = MuxLayer::with_max_frame_size(a, 8);
        let err = a
            .send(Envelope::new(PeerId::UNBOUND, ChannelId(0), vec![0u8; 16]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FrameTooLarge { size: 18, max: 8 });
    }

    #[tokio::test]
    async fn test_remote_close_is_closed() {
        let (a, b) = connection_pair();
        let a = MuxLayer::new(a);
        let b = MuxLayer::new(b);
        b.next_event().await.unwrap();

        a.close().await;
        let err = b.next_event().await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(err.origin, Origin::Transport);
    }
}
