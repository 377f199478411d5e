//! TCP transport leaf

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::common::{Error, Result};

use super::{Connection, TransportClient, TransportServer, ACCEPT_BACKLOG};

/// Socket buffer size on dialed connections (8 MiB).
const CLIENT_SOCKET_BUFFER: u32 = 8 * 1024 * 1024;

/// Socket buffer size on accepted connections (4 MiB).
const SERVER_SOCKET_BUFFER: u32 = 4 * 1024 * 1024;

/// TCP server: binds v4, pumps accepted sockets into a bounded channel.
pub struct TcpServer {
    conn_rx: AsyncMutex<Option<mpsc::Receiver<Connection>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    pub fn new() -> Self {
        Self {
            conn_rx: AsyncMutex::new(None),
            accept_task: Mutex::new(None),
        }
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportServer for TcpServer {
    async fn listen(&self, host: IpAddr, port: u16) -> Result<()> {
        let addr = SocketAddr::new(host, port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_recv_buffer_size(SERVER_SOCKET_BUFFER)?;
        socket.set_send_buffer_size(SERVER_SOCKET_BUFFER)?;
        socket.bind(addr)?;
        let listener = socket.listen(ACCEPT_BACKLOG as u32)?;
        debug!("tcp server listening on {}", addr);

        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!("tcp accept failed: {}", e);
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let local = match stream.local_addr() {
                    Ok(a) => a,
                    Err(_) => addr,
                };
                let conn = Connection::from_io(stream, local, remote);
                if conn_tx.send(conn).await.is_err() {
                    return;
                }
            }
        });

        *self.conn_rx.lock().await = Some(conn_rx);
        *self.accept_task.lock() = Some(task);
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
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.conn_rx.lock().await.take();
        Ok(())
    }
}

/// TCP client: dials with Nagle disabled and large socket buffers.
pub struct TcpClient;

impl TcpClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportClient for TcpClient {
    async fn dial(&self, endpoint: &str) -> Result<Connection> {
        let addr = lookup_host(endpoint)
            .await?
            .next()
            .ok_or_else(|| Error::Dial(format!("cannot resolve {}", endpoint)))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_recv_buffer_size(CLIENT_SOCKET_BUFFER)?;
        socket.set_send_buffer_size(CLIENT_SOCKET_BUFFER)?;

        let stream: TcpStream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        Ok(Connection::from_io(stream, local, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_accept_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = TcpServer::new();
        server
            .listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap();

        let client = TcpClient::new();
        let mut clt = client.dial(&format!("127.0.0.1:{}", port)).await.unwrap();
        let mut srv = server.accept().await.unwrap();

        clt.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        srv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.close().await.unwrap();
    }
}
