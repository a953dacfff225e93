//! Data frame forwarding between sessions

use std::sync::Arc;

use palantir_crypto::PeerId;
use palantir_transport::wire::{readdress_data, KIND_DATA};
use palantir_transport::{ChannelId, WireError};
use thiserror::Error;
use tracing::trace;

use crate::metrics::RelayMetrics;
use crate::sessions::{Outbound, SessionTable};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// The client sent something other than a well-formed DATA frame.
    #[error("protocol violation: {0}")]
    Violation(#[from] WireError),
    #[error("client sent relay-only frame kind 0x{0:02x}")]
    UnexpectedKind(u8),
    #[error("destination {0:?} is not connected")]
    Offline(PeerId),
}

impl ForwardError {
    /// Whether the sending connection must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForwardError::Violation(_) | ForwardError::UnexpectedKind(_))
    }
}

/// Routes client DATA frames to the destination's current session.
pub struct Forwarder {
    sessions: Arc<SessionTable>,
    metrics: Arc<RelayMetrics>,
}

impl Forwarder {
    pub fn new(sessions: Arc<SessionTable>, metrics: Arc<RelayMetrics>) -> Self {
        Self { sessions, metrics }
    }

    /// Forward one frame from `source`, preserving its channel.
    ///
    /// The destination id is replaced by the source id; the payload is not
    /// inspected. Only a destination without a session drops the frame.
    pub fn forward(
        &self,
        source: &PeerId,
        channel: ChannelId,
        frame: &[u8],
    ) -> Result<(), ForwardError> {
        match frame.first() {
            Some(&KIND_DATA) => {}
            Some(&other) => return Err(ForwardError::UnexpectedKind(other)),
            None => return Err(WireError::Empty.into()),
        }
        let readdressed = readdress_data(frame, source)?;
        let destination = PeerId::from_slice(&frame[1..33])
            .map_err(|_| WireError::Truncated { kind: KIND_DATA, len: frame.len() - 1 })?;

        let Some(queue) = self.sessions.route(&destination) else {
            self.metrics.frames_dropped.inc();
            return Err(ForwardError::Offline(destination));
        };

        let len = readdressed.len();
        // A closed queue means the session ended after the lookup.
        if queue.send(Outbound::Frame { channel, payload: readdressed }).is_err() {
            self.metrics.frames_dropped.inc();
            return Err(ForwardError::Offline(destination));
        }
        self.metrics.record_forward(len);
        trace!(
            from = %source.short(),
            to = %destination.short(),
            channel = channel.0,
            len,
            "forwarded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionQueues;
    use palantir_crypto::Identity;
    use bytes::Bytes;
    use palantir_transport::RelayFrame;
    use tokio::sync::mpsc;

    struct Fixture {
        forwarder: Forwarder,
        metrics: Arc<RelayMetrics>,
        sessions: Arc<SessionTable>,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionTable::new(None));
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        Fixture {
            forwarder: Forwarder::new(sessions.clone(), metrics.clone()),
            metrics,
            sessions,
        }
    }

    fn register(
        sessions: &SessionTable,
        identity: &Identity,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (control, _control_rx) = mpsc::unbounded_channel();
        let (data, data_rx) = mpsc::unbounded_channel();
        let token = sessions.next_token();
        sessions
            .register(identity.peer_id(), token, identity.bundle(), SessionQueues { control, data })
            .unwrap();
        data_rx
    }

    fn data_to(peer: PeerId, payload: &'static [u8]) -> Bytes {
        RelayFrame::Data { peer, payload: Bytes::from_static(payload) }.encode()
    }

    #[test]
    fn test_forward_rewrites_source_and_keeps_channel() {
        let fx = fixture();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut bob_rx = register(&fx.sessions, &bob);

        let frame = data_to(bob.peer_id(), b"hi bob");
        fx.forwarder.forward(&alice.peer_id(), ChannelId(7), &frame).unwrap();

        match bob_rx.try_recv().unwrap() {
            Outbound::Frame { channel, payload } => {
                assert_eq!(channel, ChannelId(7));
                let decoded = RelayFrame::decode(payload).unwrap();
                let expected = RelayFrame::Data {
                    peer: alice.peer_id(),
                    payload: Bytes::from_static(b"hi bob"),
                };
                assert_eq!(decoded, expected);
            }
            Outbound::Close => panic!("unexpected close"),
        }
        assert_eq!(fx.metrics.frames_forwarded.get(), 1);
    }

    #[test]
    fn test_offline_destination_is_dropped() {
        let fx = fixture();
        let alice = Identity::generate();
        let ghost = Identity::generate().peer_id();

        let err = fx
            .forwarder
            .forward(&alice.peer_id(), ChannelId(0), &data_to(ghost, b"x"))
            .unwrap_err();
        assert_eq!(err, ForwardError::Offline(ghost));
        assert!(!err.is_fatal());
        assert_eq!(fx.metrics.frames_dropped.get(), 1);
    }

    #[test]
    fn test_unread_destination_keeps_every_frame() {
        let fx = fixture();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut bob_rx = register(&fx.sessions, &bob);

        let frame = data_to(bob.peer_id(), b"backlog");
        for _ in 0..5000 {
            fx.forwarder.forward(&alice.peer_id(), ChannelId(0), &frame).unwrap();
        }
        assert_eq!(fx.metrics.frames_dropped.get(), 0);
        assert_eq!(fx.metrics.frames_forwarded.get(), 5000);

        let mut queued = 0;
        while bob_rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 5000);
    }

    #[test]
    fn test_ended_session_counts_as_offline() {
        let fx = fixture();
        let alice = Identity::generate();
        let bob = Identity::generate();
        drop(register(&fx.sessions, &bob));

        let err = fx
            .forwarder
            .forward(&alice.peer_id(), ChannelId(0), &data_to(bob.peer_id(), b"late"))
            .unwrap_err();
        assert_eq!(err, ForwardError::Offline(bob.peer_id()));
        assert_eq!(fx.metrics.frames_dropped.get(), 1);
    }

    #[test]
    fn test_relay_only_kinds_are_violations() {
        let fx = fixture();
        let alice = Identity::generate();
        let left = RelayFrame::Left { token: 1, peer: alice.peer_id() }.encode();

        let err = fx.forwarder.forward(&alice.peer_id(), ChannelId(0), &left).unwrap_err();
        assert_eq!(err, ForwardError::UnexpectedKind(0x03));
        assert!(err.is_fatal());

        let err = fx.forwarder.forward(&alice.peer_id(), ChannelId(0), &[]).unwrap_err();
        assert!(err.is_fatal());

        let err = fx
            .forwarder
            .forward(&alice.peer_id(), ChannelId(0), &[KIND_DATA, 1, 2])
            .unwrap_err();
        assert!(matches!(err, ForwardError::Violation(WireError::Truncated { .. })));
    }
}
