//! Relay server: accepts connections, authenticates them and pumps frames.

use std::sync::Arc;
use std::time::Duration;

use palantir_crypto::{Identity, PeerId};
use palantir_transport::{
    Admission, Connection, Envelope, HandshakeLayer, Layer, LayerError, LayerEvent, Listener,
    MuxLayer, Origin, TcpTransport, Transport, TransportError,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::admission::RelayAdmission;
use crate::config::{ConfigError, RelayConfig};
use crate::forwarder::Forwarder;
use crate::metrics::RelayMetrics;
use crate::sessions::{Outbound, SessionQueues, SessionTable};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle of one client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Any state may fall through to `Closing`; otherwise states only move forward by one.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Connecting | Authenticating | Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Why a connection task stopped.
#[derive(Debug)]
enum CloseReason {
    Evicted,
    Shutdown,
    PeerLeft,
    Violation,
    Link(LayerError),
}

struct ConnectionTask {
    remote: String,
    state: ConnectionState,
}

impl ConnectionTask {
    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(self.state.can_advance_to(next), "{:?} -> {:?}", self.state, next);
        trace!(remote = %self.remote, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

/// Relay server
pub struct RelayServer {
    config: RelayConfig,
    identity: Arc<Identity>,
    sessions: Arc<SessionTable>,
    forwarder: Forwarder,
    metrics: Arc<RelayMetrics>,
    admission: Arc<dyn Admission>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a relay with the configured identity, or a generated one.
    pub fn new(config: RelayConfig) -> Result<Self, ServerError> {
        let identity = config.identity()?;
        Self::with_identity(config, identity)
    }

    pub fn with_identity(config: RelayConfig, identity: Identity) -> Result<Self, ServerError> {
        config.validate()?;
        let admission = Arc::new(RelayAdmission::from_config(&config)?);
        let sessions = Arc::new(SessionTable::new(config.max_sessions));
        let metrics = Arc::new(RelayMetrics::new()?);
        let forwarder = Forwarder::new(sessions.clone(), metrics.clone());
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            identity: Arc::new(identity),
            sessions,
            forwarder,
            metrics,
            admission,
            shutdown,
        })
    }

    /// Replace the configured admission policy.
    ///
    /// Consulted for every authenticated client before it is registered or
    /// announced; a rejection fails that client's handshake.
    pub fn with_admission(mut self, admission: impl Admission + 'static) -> Self {
        self.admission = Arc::new(admission);
        self
    }

    /// Id clients may pin in their network descriptor.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Bind the configured TCP address and serve until [`RelayServer::shutdown`].
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpTransport::new()
            .listen(&self.config.listen_addr.to_string())
            .await?;
        self.serve(listener).await
    }

    /// Serve connections from any listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: Box<dyn Listener>) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %listener.local_addr(), relay = %self.peer_id(), "relay listening");

        if self.config.stats_interval_secs > 0 {
            tokio::spawn(self.clone().report_stats());
        }

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        self.metrics.connections.inc();
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(conn).await });
                    }
                    Err(TransportError::Closed) => {
                        info!("listener closed");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.sessions.close_all();
        self.metrics.active_sessions.set(0);
        info!("relay stopped");
        Ok(())
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn report_stats(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_secs(self.config.stats_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    info!(
                        sessions = self.sessions.len(),
                        forwarded = self.metrics.frames_forwarded.get(),
                        dropped = self.metrics.frames_dropped.get(),
                        "relay stats"
                    );
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, conn: Box<dyn Connection>) {
        let mut task = ConnectionTask {
            remote: conn.remote_addr(),
            state: ConnectionState::Connecting,
        };
        let mux = MuxLayer::with_max_frame_size(conn, self.config.max_frame_size);

        task.advance(ConnectionState::Authenticating);
        let link = match HandshakeLayer::respond_with(
            Box::new(mux),
            &self.identity,
            self.config.handshake_timeout(),
            self.admission.as_ref(),
        )
        .await
        {
            Ok(link) => link,
            Err(err) => {
                self.metrics.handshake_failures.inc();
                debug!(remote = %task.remote, error = %err, "connection rejected");
                task.advance(ConnectionState::Closing);
                task.advance(ConnectionState::Closed);
                return;
            }
        };

        let peer = link.remote().peer_id;
        let Some(bundle) = link.remote().bundle else {
            link.close().await;
            return;
        };

        let token = self.sessions.next_token();
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let (data, mut data_rx) = mpsc::unbounded_channel();
        match self.sessions.register(peer, token, bundle, SessionQueues { control, data }) {
            Ok(registration) => {
                if registration.evicted.is_some() {
                    self.metrics.evictions.inc();
                }
            }
            Err(err) => {
                warn!(
                    peer = %peer.short(),
                    remote = %task.remote,
                    error = %err,
                    "rejecting session"
                );
                task.advance(ConnectionState::Closing);
                link.close().await;
                task.advance(ConnectionState::Closed);
                return;
            }
        }
        self.metrics.active_sessions.set(self.sessions.len() as i64);
        task.advance(ConnectionState::Active);
        info!(peer = %peer.short(), remote = %task.remote, token, "session active");

        let reason = self.pump(&link, peer, &mut control_rx, &mut data_rx).await;

        task.advance(ConnectionState::Closing);
        self.sessions.remove_if_current(&peer, token);
        self.metrics.active_sessions.set(self.sessions.len() as i64);
        link.close().await;
        task.advance(ConnectionState::Closed);
        match reason {
            CloseReason::Link(err) => {
                info!(peer = %peer.short(), token, error = %err, "session closed")
            }
            other => info!(peer = %peer.short(), token, reason = ?other, "session closed"),
        }
    }

    /// Move frames until the connection ends.
    ///
    /// Control traffic is drained before data so a peer's JOINED always
    /// precedes the first message forwarded from it.
    async fn pump(
        &self,
        link: &HandshakeLayer,
        peer: PeerId,
        control_rx: &mut mpsc::UnboundedReceiver<Outbound>,
        data_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> CloseReason {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return CloseReason::Shutdown;
        }
        loop {
            let outbound = tokio::select! {
                biased;
                _ = shutdown.changed() => return CloseReason::Shutdown,
                control = control_rx.recv() => control,
                data = data_rx.recv() => data,
                event = link.next_event() => {
                    match event {
                        Ok(LayerEvent::Message(env)) => {
                            let forwarded =
                                self.forwarder.forward(&peer, env.channel, &env.payload);
                            if let Err(err) = forwarded {
                                if err.is_fatal() {
                                    self.metrics.protocol_violations.inc();
                                    let err = LayerError::malformed(Origin::Relay, err.to_string());
                                    warn!(
                                        security = true,
                                        peer = %peer.short(),
                                        error = %err,
                                        "closing connection on protocol violation"
                                    );
                                    return CloseReason::Violation;
                                }
                                debug!(peer = %peer.short(), error = %err, "frame dropped");
                            }
                        }
                        Ok(LayerEvent::Joined(_)) => {}
                        Ok(LayerEvent::Left(_)) => return CloseReason::PeerLeft,
                        Err(err) if err.is_closed() => return CloseReason::PeerLeft,
                        Err(err) => {
                            if err.is_security_relevant() {
                                self.metrics.protocol_violations.inc();
                            }
                            return CloseReason::Link(err);
                        }
                    }
                    continue;
                }
            };

            match outbound {
                Some(Outbound::Frame { channel, payload }) => {
                    if let Err(err) = link.send(Envelope { peer, channel, payload }).await {
                        return CloseReason::Link(err);
                    }
                }
                Some(Outbound::Close) | None => return CloseReason::Evicted,
            }
        }
    }
}
