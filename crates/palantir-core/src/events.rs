//! Event sequences handed to the application.
//!
//! All sequences are fed by the instance's driver task, preserve the order
//! in which events were produced, and end once the instance shuts down.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use palantir_crypto::PeerId;
use palantir_transport::ChannelId;
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::errors::PalantirError;
use crate::request::Request;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Joined(PeerId),
    Left(PeerId),
}

impl PeerEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            PeerEvent::Joined(p) | PeerEvent::Left(p) => *p,
        }
    }
}

/// A message received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub peer: PeerId,
    pub channel: ChannelId,
    pub payload: Bytes,
}

/// Received messages, in arrival order per channel.
pub struct Inbox {
    rx: mpsc::Receiver<Delivery>,
}

impl Inbox {
    pub(crate) fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Wait for the next message. Returns `Closed` once the instance is gone
    /// and every buffered message has been taken.
    pub async fn next(&mut self) -> Result<Delivery, PalantirError> {
        self.rx.recv().await.ok_or(PalantirError::Closed)
    }
}

impl Stream for Inbox {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Requests from peers, in arrival order per channel.
pub struct Requests {
    rx: mpsc::Receiver<Request>,
}

impl Requests {
    pub(crate) fn new(rx: mpsc::Receiver<Request>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Result<Request, PalantirError> {
        self.rx.recv().await.ok_or(PalantirError::Closed)
    }
}

impl Stream for Requests {
    type Item = Request;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Peer arrivals and departures.
pub struct PeerEvents {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl PeerEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<PeerEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Result<PeerEvent, PalantirError> {
        self.rx.recv().await.ok_or(PalantirError::Closed)
    }

    /// Non-blocking poll, for draining events that are already queued.
    pub fn try_next(&mut self) -> Option<PeerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for PeerEvents {
    type Item = PeerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
