//! UDP transport leaf
//!
//! UDP is connectionless, so the server demultiplexes incoming datagrams
//! by source address into logical connections. Each logical connection
//! gets its own bounded datagram channel; `read` delivers one datagram at
//! a time and `write` sends on the bound 4-tuple. Not used on the primary
//! forwarding path, which needs an ordered stream.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::common::{Error, Result};

use super::{Connection, TransportClient, TransportServer, ACCEPT_BACKLOG};

/// Datagrams buffered per logical connection before the pump drops them.
const DATAGRAM_BACKLOG: usize = 1024;

/// A datagram flow masquerading as a stream: one datagram per read.
pub struct UdpStream {
    socket: Arc<UdpSocket>,
    /// Peer this flow is bound to; `None` when the socket is connected.
    remote: Option<SocketAddr>,
    datagram_rx: Option<mpsc::Receiver<Vec<u8>>>,
    /// Tail of a datagram larger than the caller's read buffer.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl UdpStream {
    fn connected(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            remote: None,
            datagram_rx: None,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn demuxed(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        datagram_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            socket,
            remote: Some(remote),
            datagram_rx: Some(datagram_rx),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn copy_out(&mut self, buf: &mut ReadBuf<'_>) {
        let remaining = &self.pending[self.pending_pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.pending_pos += n;
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pending_pos < self.pending.len() {
            self.copy_out(buf);
            return Poll::Ready(Ok(()));
        }

        let this = self.get_mut();
        match &mut this.datagram_rx {
            // Server side: datagrams arrive through the demux channel.
            Some(rx) => match rx.poll_recv(cx) {
                Poll::Ready(Some(datagram)) => {
                    this.pending = datagram;
                    this.pending_pos = 0;
                    this.copy_out(buf);
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(None) => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "udp server closed",
                ))),
                Poll::Pending => Poll::Pending,
            },
            // Client side: read straight off the connected socket.
            None => {
                let mut scratch = [0u8; 65535];
                let mut scratch_buf = ReadBuf::new(&mut scratch);
                match this.socket.poll_recv(cx, &mut scratch_buf) {
                    Poll::Ready(Ok(())) => {
                        this.pending = scratch_buf.filled().to_vec();
                        this.pending_pos = 0;
                        this.copy_out(buf);
                        Poll::Ready(Ok(()))
                    }
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.remote {
            Some(remote) => self.socket.poll_send_to(cx, buf, remote),
            None => self.socket.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// UDP server: demultiplexes datagrams by source address.
pub struct UdpServer {
    conn_rx: AsyncMutex<Option<mpsc::Receiver<Connection>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpServer {
    pub fn new() -> Self {
        Self {
            conn_rx: AsyncMutex::new(None),
            pump_task: Mutex::new(None),
        }
    }
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportServer for UdpServer {
    async fn listen(&self, host: IpAddr, port: u16) -> Result<()> {
        let addr = SocketAddr::new(host, port);
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        debug!("udp server listening on {}", local);

        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let pump_socket = socket.clone();
        let task = tokio::spawn(async move {
            let mut flows: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
            let mut buf = vec![0u8; 65535];
            loop {
                let (n, remote) = match pump_socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!("udp recv failed: {}", e);
                        continue;
                    }
                };
                let tx = match flows.get(&remote) {
                    Some(tx) => tx.clone(),
                    None => {
                        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_BACKLOG);
                        flows.insert(remote, datagram_tx.clone());
                        let stream = UdpStream::demuxed(pump_socket.clone(), remote, datagram_rx);
                        let conn = Connection::from_io(stream, local, remote);
                        if conn_tx.send(conn).await.is_err() {
                            return;
                        }
                        datagram_tx
                    }
                };
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    flows.remove(&remote);
                }
            }
        });

        *self.conn_rx.lock().await = Some(conn_rx);
        *self.pump_task.lock() = Some(task);
        Ok(())
    }

    async fn accept(&self) -> Result<Connection> {
        let mut guard = self.conn_rx.lock().await;
        let rx = guard
            .as_mut()
            .ok_or_else(|| Error::Transport("server is not listening".into()))?;
        rx.recv().await.ok_or(Error::ConnectionClosed)
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.pump_task.lock().take() {
            task.abort();
        }
        self.conn_rx.lock().await.take();
        Ok(())
    }
}

/// UDP client: connects with an ephemeral local port.
pub struct UdpClient;

impl UdpClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UdpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportClient for UdpClient {
    async fn dial(&self, endpoint: &str) -> Result<Connection> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(endpoint).await?;
        let local = socket.local_addr()?;
        let remote = socket.peer_addr()?;
        let stream = UdpStream::connected(Arc::new(socket));
        Ok(Connection::from_io(stream, local, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn demux_by_source_address() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = UdpServer::new();
        server
            .listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap();
        let endpoint = format!("127.0.0.1:{}", port);

        let client = UdpClient::new();
        let mut a = client.dial(&endpoint).await.unwrap();
        let mut b = client.dial(&endpoint).await.unwrap();
        a.write_all(b"from-a").await.unwrap();
        b.write_all(b"from-b").await.unwrap();

        // One logical connection per source address, each delivering only
        // its own datagrams.
        let mut srv_first = server.accept().await.unwrap();
        let mut srv_second = server.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let n = srv_first.read(&mut buf).await.unwrap();
        let first = buf[..n].to_vec();
        let n = srv_second.read(&mut buf).await.unwrap();
        let second = buf[..n].to_vec();
        let mut got = vec![first, second];
        got.sort();
        assert_eq!(got, vec![b"from-a".to_vec(), b"from-b".to_vec()]);

        // Replies flow back over the bound 4-tuple.
        srv_first.write_all(b"reply").await.unwrap();
        srv_second.write_all(b"reply").await.unwrap();
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");

        server.close().await.unwrap();
    }
}
