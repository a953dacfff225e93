//! TCP transport.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::connection::StreamConnection;
use crate::error::TransportError;
use crate::traits::{Connection, Listener, Transport};

/// Reference transport over tokio TCP sockets with `TCP_NODELAY` set.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

fn wrap(stream: TcpStream) -> Result<Box<dyn Connection>, TransportError> {
    stream.set_nodelay(true)?;
    let remote = stream.peer_addr()?.to_string();
    Ok(Box::new(StreamConnection::new(stream, remote)))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        debug!(%addr, "tcp connected");
        wrap(stream)
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "tcp accepted");
        wrap(stream)
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}
