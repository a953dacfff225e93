//! Testing utilities: an in-process network and a scriptable layer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};

use crate::connection::StreamConnection;
use crate::error::{LayerError, Origin, TransportError};
use crate::traits::{Connection, Envelope, Layer, LayerEvent, Listener, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>>;

/// In-memory network of `tokio::io::duplex` pipes keyed by address.
///
/// Clones share the same network, so a relay listening on one clone is
/// reachable from every other clone.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    listeners: Registry,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Two connected in-memory connections.
pub fn connection_pair() -> (Box<dyn Connection>, Box<dyn Connection>) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (
        Box::new(StreamConnection::new(a, "mem:b")),
        Box::new(StreamConnection::new(b, "mem:a")),
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let tx = self
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::ConnectFailed {
                addr: addr.to_string(),
                reason: "connection refused".into(),
            })?;
        tx.send(remote).map_err(|_| TransportError::ConnectFailed {
            addr: addr.to_string(),
            reason: "listener gone".into(),
        })?;
        Ok(Box::new(StreamConnection::new(local, addr)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(addr) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                addr.to_string(),
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr.to_string(), tx);
        Ok(Box::new(MemoryListener {
            addr: addr.to_string(),
            incoming: tokio::sync::Mutex::new(rx),
            registry: self.listeners.clone(),
        }))
    }
}

struct MemoryListener {
    addr: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    registry: Registry,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let stream = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        Ok(Box::new(StreamConnection::new(stream, "mem:client")))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.addr);
    }
}

/// Layer whose inbound events are scripted and whose sends are recorded.
pub struct MockLayer {
    kind: Origin,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<LayerEvent, LayerError>>>,
    sent: Arc<Mutex<Vec<Envelope>>>,
    closed: watch::Sender<bool>,
}

/// Test-side handle of a [`MockLayer`].
#[derive(Clone)]
pub struct MockLayerHandle {
    events: mpsc::UnboundedSender<Result<LayerEvent, LayerError>>,
    sent: Arc<Mutex<Vec<Envelope>>>,
    closed: watch::Receiver<bool>,
}

impl MockLayer {
    pub fn new(kind: Origin) -> (Self, MockLayerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Self {
                kind,
                events: tokio::sync::Mutex::new(rx),
                sent: sent.clone(),
                closed: closed_tx,
            },
            MockLayerHandle {
                events: tx,
                sent,
                closed: closed_rx,
            },
        )
    }
}

impl MockLayerHandle {
    /// Queue an event for the layer's `next_event`.
    pub fn inject(&self, event: LayerEvent) {
        let _ = self.events.send(Ok(event));
    }

    /// Queue an error for the layer's `next_event`.
    pub fn inject_err(&self, err: LayerError) {
        let _ = self.events.send(Err(err));
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Layer for MockLayer {
    fn kind(&self) -> Origin {
        self.kind
    }

    fn inner(&self) -> Option<&dyn Layer> {
        None
    }

    async fn send(&self, envelope: Envelope) -> Result<(), LayerError> {
        if *self.closed.borrow() {
            return Err(LayerError::closed(self.kind));
        }
        self.sent.lock().push(envelope);
        Ok(())
    }

    async fn next_event(&self) -> Result<LayerEvent, LayerError> {
        let mut closed = self.closed.subscribe();
        let mut events = self.events.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(LayerError::closed(self.kind)),
            ev = events.recv() => ev.unwrap_or_else(|| Err(LayerError::closed(self.kind))),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}
