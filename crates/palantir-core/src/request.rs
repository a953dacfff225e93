//! Request/response on top of the message channels.
//!
//! A request carries an id unique to the requesting instance. The response
//! echoes it on the same channel and completes the waiting caller through the
//! [`PendingRequests`] table. Unanswered requests give up after a timeout.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use palantir_crypto::PeerId;
use palantir_transport::{ChannelId, Envelope, Stack};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::PalantirError;
use crate::message::AppMessage;

/// Outstanding requests awaiting a response, keyed by peer and request id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<(PeerId, u64), oneshot::Sender<Bytes>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a request to `peer`. The slot is freed when the
    /// returned [`PendingResponse`] is dropped.
    pub fn register(self: &Arc<Self>, peer: PeerId) -> PendingResponse {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert((peer, id), tx);
        PendingResponse {
            peer,
            id,
            rx,
            table: self.clone(),
        }
    }

    /// Hand `payload` to the caller waiting on (`peer`, `id`). Returns false
    /// when nobody waits: unknown id, wrong peer, or already timed out.
    pub fn complete(&self, peer: PeerId, id: u64, payload: Bytes) -> bool {
        match self.waiting.lock().remove(&(peer, id)) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Fail every request waiting on `peer`.
    pub fn abort_peer(&self, peer: &PeerId) -> usize {
        let mut waiting = self.waiting.lock();
        let before = waiting.len();
        waiting.retain(|(p, _), _| p != peer);
        before - waiting.len()
    }

    pub fn abort_all(&self) {
        self.waiting.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One slot in [`PendingRequests`].
pub struct PendingResponse {
    peer: PeerId,
    id: u64,
    rx: oneshot::Receiver<Bytes>,
    table: Arc<PendingRequests>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait up to `timeout` for the response.
    pub async fn wait(mut self, timeout: Duration) -> Result<Bytes, PalantirError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(PalantirError::RequestAborted(self.peer)),
            Err(_) => Err(PalantirError::RequestTimedOut {
                peer: self.peer,
                after: timeout,
            }),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.waiting.lock().remove(&(self.peer, self.id));
    }
}

/// A request received from a peer. Answer it with [`Request::respond`].
pub struct Request {
    pub peer: PeerId,
    pub channel: ChannelId,
    pub payload: Bytes,
    id: u64,
    stack: Arc<Stack>,
}

impl Request {
    pub(crate) fn new(
        peer: PeerId,
        channel: ChannelId,
        id: u64,
        payload: Bytes,
        stack: Arc<Stack>,
    ) -> Self {
        Self {
            peer,
            channel,
            payload,
            id,
            stack,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send `response` back on the channel the request came in on.
    pub async fn respond(self, response: impl Into<Bytes>) -> Result<(), PalantirError> {
        let frame = AppMessage::Response {
            id: self.id,
            payload: response.into(),
        };
        self.stack
            .send(Envelope::new(self.peer, self.channel, frame.encode()))
            .await
            .map_err(PalantirError::SendFailed)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("peer", &self.peer)
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
