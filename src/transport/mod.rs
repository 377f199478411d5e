//! Transport Layer
//!
//! A transport stack is an ordered composition of layers: a leaf that
//! owns real sockets (TCP, UDP) and zero or more wrappers (TLS, Caesar,
//! Trojan) that transform the byte stream of their underlying layer.
//! Each layer exposes the same two capabilities:
//!
//! - [`TransportServer`]: `listen` + `accept` + `close`
//! - [`TransportClient`]: `dial`
//!
//! Wrappers hold an `Arc` to their underlying layer and delegate; the
//! stack is assembled from configuration by [`stack::build_server`] /
//! [`stack::build_client`].
//!
//! This layer moves bytes. It knows nothing about peers, framing, or
//! routing.

mod caesar;
pub mod stack;
mod tcp;
mod tls;
pub mod trojan;
mod udp;

pub use caesar::{CaesarClient, CaesarServer};
pub use tcp::{TcpClient, TcpServer};
pub use tls::{TlsClient, TlsClientConfig, TlsServer, TlsServerConfig};
pub use trojan::{TrojanClient, TrojanServer};
pub use udp::{UdpClient, UdpServer};

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::{Result, Stream, StreamIo};

/// Depth of the accept backlog channel inside each server layer.
pub const ACCEPT_BACKLOG: usize = 1024;

/// A reliable, ordered byte-stream connection with its endpoint addresses.
///
/// Wrappers replace the stream and keep the addresses of the leaf socket.
pub struct Connection {
    stream: Stream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: Stream, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            stream,
            local_addr,
            remote_addr,
        }
    }

    /// Wrap a concrete socket, erasing its type.
    pub fn from_io<T: StreamIo + 'static>(
        io: T,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self::new(Box::new(io), local_addr, remote_addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Rewrap the inner stream, keeping the endpoint addresses.
    pub fn map_stream(self, f: impl FnOnce(Stream) -> Stream) -> Self {
        Self {
            stream: f(self.stream),
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
        }
    }

    pub fn into_stream(self) -> Stream {
        self.stream
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Server side of a transport layer.
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// Bind and start accepting. Must be called once before `accept`.
    async fn listen(&self, host: IpAddr, port: u16) -> Result<()>;

    /// Wait for the next fully established connection.
    async fn accept(&self) -> Result<Connection>;

    /// Stop accepting and release the socket.
    async fn close(&self) -> Result<()>;
}

/// Client side of a transport layer.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Open a connection to `endpoint` (`host:port`).
    async fn dial(&self, endpoint: &str) -> Result<Connection>;
}
