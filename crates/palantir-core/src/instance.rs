//! The Palantir instance: root of a layer stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use palantir_crypto::{Identity, PeerId};
use palantir_transport::{
    ChannelId, Envelope, LayerError, LayerEvent, Origin, PeerHandle, Stack, StackBuilder,
    TcpTransport, Transport,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::descriptor::NetworkDescriptor;
use crate::errors::PalantirError;
use crate::events::{Delivery, Inbox, PeerEvent, PeerEvents, Requests};
use crate::message::AppMessage;
use crate::peers::PeerTable;
use crate::request::{PendingRequests, Request};

/// Response timeout used by [`Palantir::request`] unless overridden.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected participant in a Palantir network.
///
/// A background driver task reads the stack, maintains the peer table and
/// feeds the event sequences. Dropping the instance signals the driver
/// to close the stack; [`Palantir::disconnect`] does the same and waits for it.
pub struct Palantir {
    identity: Arc<Identity>,
    stack: Arc<Stack>,
    peers: Arc<PeerTable>,
    inbox: Mutex<Option<Inbox>>,
    peer_events: Mutex<Option<PeerEvents>>,
    requests: Mutex<Option<Requests>>,
    serving: Arc<AtomicBool>,
    pending: Arc<PendingRequests>,
    request_timeout: Duration,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    termination: Arc<Mutex<Option<Arc<LayerError>>>>,
}

impl Palantir {
    /// Connect over TCP using `descriptor`.
    pub async fn connect(
        descriptor: &NetworkDescriptor,
        identity: impl Into<Arc<Identity>>,
    ) -> Result<Self, PalantirError> {
        Self::connect_with(&TcpTransport::new(), descriptor, identity).await
    }

    /// Connect over any transport.
    pub async fn connect_with(
        transport: &dyn Transport,
        descriptor: &NetworkDescriptor,
        identity: impl Into<Arc<Identity>>,
    ) -> Result<Self, PalantirError> {
        descriptor.validate()?;
        let identity = identity.into();

        let mut builder = StackBuilder::new(identity.clone())
            .pin_relay(descriptor.pinned_relay()?)
            .max_frame_size(descriptor.max_frame_size)
            .handshake_timeout(descriptor.handshake_timeout());
        if let Some(credential) = &descriptor.credential {
            builder = builder.credential(credential.as_bytes());
        }
        for layer in descriptor.outer_layers()? {
            builder = builder.layer(layer);
        }

        let stack = builder
            .connect(transport, &descriptor.relay_address)
            .await
            .map_err(|e| {
                warn!(
                    security = e.is_security_relevant(),
                    error = %e,
                    relay = %descriptor.relay_address,
                    "connect failed"
                );
                PalantirError::Connect(e)
            })?;
        info!(
            local = %identity.peer_id().short(),
            layers = ?stack.layers(),
            "palantir connected"
        );

        Ok(Self::from_stack(stack, identity, descriptor.inbox_capacity)
            .with_request_timeout(descriptor.request_timeout()))
    }

    /// Run an instance over an already built stack.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stack(stack: Stack, identity: Arc<Identity>, inbox_capacity: usize) -> Self {
        let stack = Arc::new(stack);
        let peers = Arc::new(PeerTable::new());
        let termination = Arc::new(Mutex::new(None));
        let pending = Arc::new(PendingRequests::new());
        let serving = Arc::new(AtomicBool::new(false));
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity.max(1));
        let (requests_tx, requests_rx) = mpsc::channel(inbox_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(
            Driver {
                stack: stack.clone(),
                peers: peers.clone(),
                inbox: inbox_tx,
                requests: requests_tx,
                serving: serving.clone(),
                pending: pending.clone(),
                events: events_tx,
                shutdown: shutdown_rx,
                termination: termination.clone(),
            }
            .run(),
        );

        Self {
            identity,
            stack,
            peers,
            inbox: Mutex::new(Some(Inbox::new(inbox_rx))),
            peer_events: Mutex::new(Some(PeerEvents::new(events_rx))),
            requests: Mutex::new(Some(Requests::new(requests_rx))),
            serving,
            pending,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown,
            driver: Mutex::new(Some(driver)),
            termination,
        }
    }

    /// Timeout applied by [`Palantir::request`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn local_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Peers currently reachable.
    pub fn peers(&self) -> Vec<PeerHandle> {
        self.peers.snapshot()
    }

    pub fn is_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    /// Layer kinds from outermost to innermost.
    pub fn layers(&self) -> Vec<Origin> {
        self.stack.layers()
    }

    /// The error that ended the stack, if it ended on its own.
    pub fn termination(&self) -> Option<Arc<LayerError>> {
        self.termination.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
            || self
                .driver
                .lock()
                .as_ref()
                .map_or(true, |handle| handle.is_finished())
    }

    /// Send `payload` to `peer` on the default channel.
    pub async fn send(
        &self,
        peer: PeerId,
        payload: impl Into<Bytes>,
    ) -> Result<(), PalantirError> {
        self.send_on(peer, ChannelId::DEFAULT, payload).await
    }

    /// Send on a specific channel. Ordering is preserved per channel.
    pub async fn send_on(
        &self,
        peer: PeerId,
        channel: ChannelId,
        payload: impl Into<Bytes>,
    ) -> Result<(), PalantirError> {
        self.transmit(peer, channel, AppMessage::Message(payload.into()))
            .await
    }

    /// Send a request on the default channel and wait for the response.
    pub async fn request(
        &self,
        peer: PeerId,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes, PalantirError> {
        self.request_on(peer, ChannelId::DEFAULT, payload, self.request_timeout)
            .await
    }

    /// Send a request on `channel` and wait up to `timeout` for the response.
    ///
    /// Fails with `RequestTimedOut` when the peer stays silent and with
    /// `RequestAborted` when it leaves first.
    pub async fn request_on(
        &self,
        peer: PeerId,
        channel: ChannelId,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, PalantirError> {
        let pending = self.pending.register(peer);
        let frame = AppMessage::Request {
            id: pending.id(),
            payload: payload.into(),
        };
        self.transmit(peer, channel, frame).await?;
        match pending.wait(timeout).await {
            Err(PalantirError::RequestAborted(_)) if self.is_closed() => Err(PalantirError::Closed),
            Err(err @ PalantirError::RequestTimedOut { .. }) => {
                debug!(peer = %peer.short(), channel = channel.0, "request timed out");
                Err(err)
            }
            other => other,
        }
    }

    async fn transmit(
        &self,
        peer: PeerId,
        channel: ChannelId,
        message: AppMessage,
    ) -> Result<(), PalantirError> {
        if self.is_closed() {
            return Err(PalantirError::Closed);
        }
        if !self.peers.contains(&peer) {
            return Err(PalantirError::UnknownPeer(peer));
        }
        self.stack
            .send(Envelope::new(peer, channel, message.encode()))
            .await
            .map_err(PalantirError::SendFailed)
    }

    /// Take the sequence of peer arrivals and departures. Only one subscriber.
    pub fn subscribe_peer_events(&self) -> Result<PeerEvents, PalantirError> {
        self.peer_events
            .lock()
            .take()
            .ok_or(PalantirError::AlreadySubscribed)
    }

    /// Take the sequence of received messages. Only one subscriber.
    pub fn receive(&self) -> Result<Inbox, PalantirError> {
        self.inbox.lock().take().ok_or(PalantirError::AlreadySubscribed)
    }

    /// Take the sequence of requests from peers. Only one subscriber.
    ///
    /// Until this is called incoming requests are discarded and their
    /// senders time out.
    pub fn requests(&self) -> Result<Requests, PalantirError> {
        let requests = self
            .requests
            .lock()
            .take()
            .ok_or(PalantirError::AlreadySubscribed)?;
        self.serving.store(true, Ordering::Release);
        Ok(requests)
    }

    /// Close the stack top-down and wait for the driver to finish.
    ///
    /// Every event sequence ends and every waiting request fails after this
    /// returns. Idempotent.
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(error = %e, "driver task failed");
            }
        }
    }
}

impl Drop for Palantir {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

struct Driver {
    stack: Arc<Stack>,
    peers: Arc<PeerTable>,
    inbox: mpsc::Sender<Delivery>,
    requests: mpsc::Sender<Request>,
    serving: Arc<AtomicBool>,
    pending: Arc<PendingRequests>,
    events: mpsc::UnboundedSender<PeerEvent>,
    shutdown: watch::Receiver<bool>,
    termination: Arc<Mutex<Option<Arc<LayerError>>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|s| *s) => break,
                event = self.stack.next_event() => event,
            };

            match event {
                Ok(LayerEvent::Joined(handle)) => {
                    let peer = handle.peer_id;
                    if self.peers.insert(handle) {
                        debug!(peer = %peer.short(), "peer joined");
                        let _ = self.events.send(PeerEvent::Joined(peer));
                    }
                }
                Ok(LayerEvent::Left(peer)) => {
                    if self.peers.remove(&peer).is_some() {
                        debug!(peer = %peer.short(), "peer left");
                        let _ = self.events.send(PeerEvent::Left(peer));
                    }
                    let aborted = self.pending.abort_peer(&peer);
                    if aborted > 0 {
                        debug!(peer = %peer.short(), aborted, "requests aborted");
                    }
                }
                Ok(LayerEvent::Message(env)) => {
                    if !self.dispatch(env).await {
                        break;
                    }
                }
                Err(err) if !err.is_fatal() => {
                    warn!(
                        security = err.is_security_relevant(),
                        origin = ?err.origin,
                        error = %err,
                        "peer error"
                    );
                }
                Err(err) => {
                    if err.is_closed() {
                        info!(origin = ?err.origin, "stack closed");
                    } else {
                        warn!(
                            security = err.is_security_relevant(),
                            origin = ?err.origin,
                            error = %err,
                            "stack terminated"
                        );
                    }
                    *self.termination.lock() = Some(Arc::new(err));
                    break;
                }
            }
        }

        self.stack.close().await;
        self.pending.abort_all();
        for peer in self.peers.drain() {
            let _ = self.events.send(PeerEvent::Left(peer));
        }
        debug!("driver stopped");
    }

    /// Route one received envelope. Returns false once shutdown was signalled.
    async fn dispatch(&mut self, env: Envelope) -> bool {
        let (peer, channel) = (env.peer, env.channel);
        match AppMessage::decode(env.payload) {
            Ok(AppMessage::Message(payload)) => {
                let delivery = Delivery {
                    peer,
                    channel,
                    payload,
                };
                deliver(&mut self.shutdown, &self.inbox, delivery).await
            }
            Ok(AppMessage::Request { id, payload }) => {
                if !self.serving.load(Ordering::Acquire) {
                    debug!(peer = %peer.short(), id, "no request subscriber, discarding request");
                    return true;
                }
                let request = Request::new(peer, channel, id, payload, self.stack.clone());
                deliver(&mut self.shutdown, &self.requests, request).await
            }
            Ok(AppMessage::Response { id, payload }) => {
                if !self.pending.complete(peer, id, payload) {
                    debug!(peer = %peer.short(), id, "unsolicited or late response");
                }
                true
            }
            Err(err) => {
                warn!(
                    security = true,
                    peer = %peer.short(),
                    channel = channel.0,
                    error = %err,
                    "malformed message, dropped"
                );
                true
            }
        }
    }
}

/// Queue `item` for the application. A full queue stops reading from the
/// stack until the application catches up. Returns false on shutdown.
async fn deliver<T>(
    shutdown: &mut watch::Receiver<bool>,
    queue: &mpsc::Sender<T>,
    item: T,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|s| *s) => false,
        sent = queue.send(item) => {
            if sent.is_err() {
                debug!("subscriber dropped, discarding");
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palantir_transport::testing::{MockLayer, MockLayerHandle};
    use palantir_transport::{ErrorKind, Route};

    fn instance() -> (Palantir, MockLayerHandle) {
        let (layer, handle) = MockLayer::new(Origin::Relay);
        let palantir = Palantir::from_stack(
            Stack::from_layer(Box::new(layer)),
            Arc::new(Identity::generate()),
            8,
        );
        (palantir, handle)
    }

    fn message(peer: PeerId, channel: ChannelId, frame: AppMessage) -> LayerEvent {
        LayerEvent::Message(Envelope::new(peer, channel, frame.encode()))
    }

    fn text(peer: PeerId, channel: ChannelId, payload: &[u8]) -> LayerEvent {
        message(peer, channel, AppMessage::Message(Bytes::copy_from_slice(payload)))
    }

    fn joined(peer: PeerId) -> LayerEvent {
        LayerEvent::Joined(PeerHandle {
            peer_id: peer,
            bundle: None,
            route: Route::Relayed { token: 1 },
        })
    }

    #[tokio::test]
    async fn test_unknown_peer_has_no_network_effect() {
        let (palantir, handle) = instance();
        let stranger = PeerId([9; 32]);

        let err = palantir.send(stranger, &b"hello"[..]).await.unwrap_err();
        assert!(matches!(err, PalantirError::UnknownPeer(p) if p == stranger));
        assert!(err.is_local());
        assert!(handle.sent().is_empty());
    }

    #[tokio::test]
    async fn test_peer_events_and_send() {
        let (palantir, handle) = instance();
        let mut events = palantir.subscribe_peer_events().unwrap();
        let peer = PeerId([1; 32]);

        handle.inject(joined(peer));
        assert_eq!(events.next().await.unwrap(), PeerEvent::Joined(peer));
        assert!(palantir.is_peer(&peer));

        palantir.send_on(peer, ChannelId(3), &b"data"[..]).await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, peer);
        assert_eq!(sent[0].channel, ChannelId(3));
        assert_eq!(
            AppMessage::decode(sent[0].payload.clone()).unwrap(),
            AppMessage::Message(Bytes::from_static(b"data"))
        );

        handle.inject(LayerEvent::Left(peer));
        assert_eq!(events.next().await.unwrap(), PeerEvent::Left(peer));
        assert!(!palantir.is_peer(&peer));
    }

    #[tokio::test]
    async fn test_duplicate_join_reported_once() {
        let (palantir, handle) = instance();
        let mut events = palantir.subscribe_peer_events().unwrap();
        let peer = PeerId([1; 32]);

        handle.inject(joined(peer));
        handle.inject(joined(peer));
        handle.inject(LayerEvent::Left(peer));
        assert_eq!(events.next().await.unwrap(), PeerEvent::Joined(peer));
        assert_eq!(events.next().await.unwrap(), PeerEvent::Left(peer));
    }

    #[tokio::test]
    async fn test_messages_reach_inbox_in_order() {
        let (palantir, handle) = instance();
        let mut inbox = palantir.receive().unwrap();
        let peer = PeerId([2; 32]);

        for i in 0u8..20 {
            handle.inject(text(peer, ChannelId(1), &[i]));
        }
        for i in 0u8..20 {
            let delivery = inbox.next().await.unwrap();
            assert_eq!(delivery.peer, peer);
            assert_eq!(&delivery.payload[..], &[i]);
        }
    }

    #[tokio::test]
    async fn test_subscriptions_are_single_use() {
        let (palantir, _handle) = instance();
        let _events = palantir.subscribe_peer_events().unwrap();
        let _inbox = palantir.receive().unwrap();
        let _requests = palantir.requests().unwrap();
        assert!(matches!(
            palantir.subscribe_peer_events(),
            Err(PalantirError::AlreadySubscribed)
        ));
        assert!(matches!(palantir.receive(), Err(PalantirError::AlreadySubscribed)));
        assert!(matches!(palantir.requests(), Err(PalantirError::AlreadySubscribed)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_stack_and_ends_sequences() {
        let (palantir, handle) = instance();
        let mut events = palantir.subscribe_peer_events().unwrap();
        let mut inbox = palantir.receive().unwrap();
        let peer = PeerId([5; 32]);

        handle.inject(joined(peer));
        assert_eq!(events.next().await.unwrap(), PeerEvent::Joined(peer));

        palantir.disconnect().await;
        assert!(handle.is_closed());
        assert!(palantir.is_closed());
        assert_eq!(events.next().await.unwrap(), PeerEvent::Left(peer));
        assert!(matches!(events.next().await, Err(PalantirError::Closed)));
        assert!(matches!(inbox.next().await, Err(PalantirError::Closed)));
        assert!(matches!(
            palantir.send(peer, Bytes::new()).await,
            Err(PalantirError::Closed)
        ));

        // Idempotent.
        palantir.disconnect().await;
    }

    #[tokio::test]
    async fn test_fatal_error_terminates_with_left_events() {
        let (palantir, handle) = instance();
        let mut events = palantir.subscribe_peer_events().unwrap();
        let peer = PeerId([6; 32]);

        handle.inject(joined(peer));
        let fatal = LayerError::new(
            Origin::Framing,
            ErrorKind::FrameTooLarge { size: 10, max: 5 },
        );
        handle.inject_err(fatal.clone());

        assert_eq!(events.next().await.unwrap(), PeerEvent::Joined(peer));
        assert_eq!(events.next().await.unwrap(), PeerEvent::Left(peer));
        assert!(matches!(events.next().await, Err(PalantirError::Closed)));
        assert_eq!(*palantir.termination().unwrap(), fatal);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_peer_scoped_error_keeps_running() {
        let (palantir, handle) = instance();
        let mut inbox = palantir.receive().unwrap();
        let peer = PeerId([7; 32]);

        handle.inject_err(LayerError::new(
            Origin::Encryption,
            ErrorKind::AuthenticationFailed(peer),
        ));
        handle.inject(text(peer, ChannelId(0), b"still here"));

        assert_eq!(&inbox.next().await.unwrap().payload[..], b"still here");
        assert!(palantir.termination().is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (palantir, handle) = instance();
        let mut inbox = palantir.receive().unwrap();
        let peer = PeerId([8; 32]);

        handle.inject(LayerEvent::Message(Envelope::new(peer, ChannelId(0), Bytes::new())));
        handle.inject(LayerEvent::Message(Envelope::new(peer, ChannelId(0), vec![0x7f, 1])));
        handle.inject(text(peer, ChannelId(0), b"after"));

        assert_eq!(&inbox.next().await.unwrap().payload[..], b"after");
        assert!(palantir.termination().is_none());
    }

    /// Wait until the stack has seen a request and return its id.
    async fn sent_request(handle: &MockLayerHandle) -> (ChannelId, u64, Bytes) {
        loop {
            if let Some(env) = handle.sent().into_iter().last() {
                let decoded = AppMessage::decode(env.payload).unwrap();
                if let AppMessage::Request { id, payload } = decoded {
                    return (env.channel, id, payload);
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_request_gets_matching_response() {
        let (palantir, handle) = instance();
        let peer = PeerId([10; 32]);
        handle.inject(joined(peer));
        while !palantir.is_peer(&peer) {
            tokio::task::yield_now().await;
        }

        let responder = async {
            let (channel, id, payload) = sent_request(&handle).await;
            assert_eq!(channel, ChannelId::DEFAULT);
            assert_eq!(&payload[..], b"ping");
            // An unrelated id first: it must not complete the request.
            handle.inject(message(
                peer,
                channel,
                AppMessage::Response {
                    id: id + 100,
                    payload: Bytes::from_static(b"stale"),
                },
            ));
            handle.inject(message(
                peer,
                channel,
                AppMessage::Response {
                    id,
                    payload: Bytes::from_static(b"pong"),
                },
            ));
        };

        let (response, ()) = tokio::join!(palantir.request(peer, &b"ping"[..]), responder);
        assert_eq!(&response.unwrap()[..], b"pong");
        assert!(palantir.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let (palantir, handle) = instance();
        let mut inbox = palantir.receive().unwrap();
        let peer = PeerId([11; 32]);
        handle.inject(joined(peer));
        while !palantir.is_peer(&peer) {
            tokio::task::yield_now().await;
        }

        let err = palantir
            .request_on(peer, ChannelId(4), &b"anyone?"[..], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PalantirError::RequestTimedOut { peer: p, after }
                if p == peer && after == Duration::from_secs(2)
        ));
        assert!(palantir.pending.is_empty());

        // The late response is discarded; ordinary traffic still flows.
        let (_, id, _) = sent_request(&handle).await;
        handle.inject(message(
            peer,
            ChannelId(4),
            AppMessage::Response {
                id,
                payload: Bytes::from_static(b"too late"),
            },
        ));
        handle.inject(text(peer, ChannelId(4), b"next"));
        assert_eq!(&inbox.next().await.unwrap().payload[..], b"next");
    }

    #[tokio::test]
    async fn test_request_to_unknown_peer_sends_nothing() {
        let (palantir, handle) = instance();
        let err = palantir.request(PeerId([12; 32]), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, PalantirError::UnknownPeer(_)));
        assert!(handle.sent().is_empty());
        assert!(palantir.pending.is_empty());
    }

    #[tokio::test]
    async fn test_peer_leaving_aborts_request() {
        let (palantir, handle) = instance();
        let peer = PeerId([13; 32]);
        handle.inject(joined(peer));
        while !palantir.is_peer(&peer) {
            tokio::task::yield_now().await;
        }

        let leaver = async {
            sent_request(&handle).await;
            handle.inject(LayerEvent::Left(peer));
        };
        let (result, ()) = tokio::join!(palantir.request(peer, &b"bye?"[..]), leaver);
        assert!(matches!(result, Err(PalantirError::RequestAborted(p)) if p == peer));
    }

    #[tokio::test]
    async fn test_incoming_request_is_answered_on_its_channel() {
        let (palantir, handle) = instance();
        let mut requests = palantir.requests().unwrap();
        let peer = PeerId([14; 32]);

        handle.inject(message(
            peer,
            ChannelId(6),
            AppMessage::Request {
                id: 41,
                payload: Bytes::from_static(b"question"),
            },
        ));
        let request = requests.next().await.unwrap();
        assert_eq!(request.peer, peer);
        assert_eq!(request.channel, ChannelId(6));
        assert_eq!(request.id(), 41);
        assert_eq!(&request.payload[..], b"question");

        request.respond(&b"answer"[..]).await.unwrap();
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, ChannelId(6));
        assert_eq!(
            AppMessage::decode(sent[0].payload.clone()).unwrap(),
            AppMessage::Response {
                id: 41,
                payload: Bytes::from_static(b"answer"),
            }
        );
    }

    #[tokio::test]
    async fn test_requests_without_subscriber_are_discarded() {
        let (palantir, handle) = instance();
        let mut inbox = palantir.receive().unwrap();
        let peer = PeerId([15; 32]);

        for id in 0..32 {
            handle.inject(message(
                peer,
                ChannelId(0),
                AppMessage::Request {
                    id,
                    payload: Bytes::new(),
                },
            ));
        }
        handle.inject(text(peer, ChannelId(0), b"not stuck"));
        assert_eq!(&inbox.next().await.unwrap().payload[..], b"not stuck");
    }

    #[tokio::test]
    async fn test_drop_closes_stack() {
        let (palantir, handle) = instance();
        let mut events = palantir.subscribe_peer_events().unwrap();
        drop(palantir);
        assert!(matches!(events.next().await, Err(PalantirError::Closed)));
        assert!(handle.is_closed());
    }
}
