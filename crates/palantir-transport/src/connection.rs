//! Connection over any async byte stream.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::TransportError;
use crate::traits::Connection;

const READ_CHUNK: usize = 16 * 1024;

/// [`Connection`] backed by a split async stream.
///
/// The read and write halves sit behind separate locks, so a pending `recv`
/// never blocks a `send`. Writes are serialized by the writer lock.
pub struct StreamConnection<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    remote: String,
    closed: AtomicBool,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, remote: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote: remote.into(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        // read_buf is cancellation safe: nothing is consumed unless it returns.
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        trace!(remote = %self.remote, bytes = n, "recv");
        Ok(buf.freeze())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        // The remote may already be gone; shutdown errors carry no information.
        let _ = writer.shutdown().await;
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }
}
