//! Trojan-style authenticated transport wrapper
//!
//! The client prepends `hex(sha224(password)) || CRLF` to its first write;
//! after that the connection is a transparent byte stream. The server
//! reads the 58-byte preamble, authenticates the digest against its user
//! table, and hands the connection up. A connection that fails
//! authentication is redirected — preamble included — to a decoy address
//! so the listener is indistinguishable from whatever runs there.

mod auth;
mod redirector;

pub use auth::{sha224_hex, Authenticator, User, HASH_LEN};
pub use redirector::{Redirection, Redirector};

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::common::{Error, Result, Stream};

use super::{Connection, TransportClient, TransportServer};

/// Authenticated connections buffered ahead of `accept`.
const CONN_BACKLOG: usize = 32;

/// Trojan server configuration
#[derive(Debug, Clone)]
pub struct TrojanServerConfig {
    pub passwords: Vec<String>,
    pub redirect_host: IpAddr,
    pub redirect_port: u16,
}

/// Trojan client configuration
#[derive(Debug, Clone)]
pub struct TrojanClientConfig {
    pub password: String,
}

/// Client-side stream: injects the credential preamble ahead of the first
/// payload write and counts traffic against the user.
struct TrojanClientStream {
    inner: Stream,
    /// Preamble bytes not yet written; empty once the header is on the wire.
    header: Vec<u8>,
    header_pos: usize,
    user: Arc<User>,
}

impl TrojanClientStream {
    fn new(inner: Stream, user: Arc<User>) -> Self {
        let mut header = Vec::with_capacity(HASH_LEN + 2);
        header.extend_from_slice(user.hash().as_bytes());
        header.extend_from_slice(b"\r\n");
        Self {
            inner,
            header,
            header_pos: 0,
            user,
        }
    }
}

impl AsyncRead for TrojanClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.user.add_traffic(0, (buf.filled().len() - before) as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for TrojanClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        while this.header_pos < this.header.len() {
            let remaining = &this.header[this.header_pos..];
            match Pin::new(&mut this.inner).poll_write(cx, remaining) {
                Poll::Ready(Ok(n)) => this.header_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.user.add_traffic(n as u64, 0);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Server-side stream: transparent after authentication, counts traffic,
/// releases the source-IP slot when dropped.
struct TrojanServerStream {
    inner: Stream,
    user: Arc<User>,
    remote_ip: IpAddr,
}

impl Drop for TrojanServerStream {
    fn drop(&mut self) {
        self.user.del_ip(self.remote_ip);
    }
}

impl AsyncRead for TrojanServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.user.add_traffic(0, (buf.filled().len() - before) as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for TrojanServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.user.add_traffic(n as u64, 0);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Consume and validate the credential preamble. On failure the bytes
/// already read come back for replay.
async fn authenticate(
    auth: &Authenticator,
    conn: &mut Connection,
) -> std::result::Result<Arc<User>, Vec<u8>> {
    let mut consumed = Vec::with_capacity(HASH_LEN + 2);
    let mut hash = [0u8; HASH_LEN];
    if conn.read_exact(&mut hash).await.is_err() {
        return Err(consumed);
    }
    consumed.extend_from_slice(&hash);

    let hash = match std::str::from_utf8(&hash) {
        Ok(s) => s,
        Err(_) => return Err(consumed),
    };
    let user = match auth.auth_user(hash, conn.remote_addr().ip()) {
        Some(user) => user,
        None => return Err(consumed),
    };

    let mut crlf = [0u8; 2];
    if conn.read_exact(&mut crlf).await.is_err() {
        user.del_ip(conn.remote_addr().ip());
        return Err(consumed);
    }
    consumed.extend_from_slice(&crlf);
    if &crlf != b"\r\n" {
        user.del_ip(conn.remote_addr().ip());
        return Err(consumed);
    }
    Ok(user)
}

/// Trojan server layer. Authentication runs in a task per accepted
/// connection so a client that stalls mid-preamble cannot hold up the
/// accept path.
pub struct TrojanServer {
    underlying: Arc<dyn TransportServer>,
    auth: Arc<Authenticator>,
    redirector: Arc<Redirector>,
    conn_rx: AsyncMutex<Option<mpsc::Receiver<Connection>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl TrojanServer {
    pub fn new(config: &TrojanServerConfig, underlying: Arc<dyn TransportServer>) -> Self {
        let redirect_to = SocketAddr::new(config.redirect_host, config.redirect_port);
        Self {
            underlying,
            auth: Arc::new(Authenticator::new(&config.passwords)),
            redirector: Arc::new(Redirector::new(redirect_to)),
            conn_rx: AsyncMutex::new(None),
            pump_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TransportServer for TrojanServer {
    async fn listen(&self, host: IpAddr, port: u16) -> Result<()> {
        self.underlying.listen(host, port).await?;

        let (conn_tx, conn_rx) = mpsc::channel(CONN_BACKLOG);
        let underlying = self.underlying.clone();
        let auth = self.auth.clone();
        let redirector = self.redirector.clone();
        let task = tokio::spawn(async move {
            loop {
                let conn = match underlying.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let auth = auth.clone();
                let redirector = redirector.clone();
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let mut conn = conn;
                    match authenticate(&auth, &mut conn).await {
                        Ok(user) => {
                            let remote_ip = conn.remote_addr().ip();
                            let conn = conn.map_stream(|stream| {
                                Box::new(TrojanServerStream {
                                    inner: stream,
                                    user,
                                    remote_ip,
                                })
                            });
                            let _ = conn_tx.send(conn).await;
                        }
                        Err(buffered) => {
                            debug!(
                                "invalid trojan preamble from {}, redirecting",
                                conn.remote_addr()
                            );
                            redirector
                                .redirect(Redirection {
                                    inbound: conn,
                                    buffered,
                                })
                                .await;
                        }
                    }
                });
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
        self.underlying.close().await
    }
}

/// Trojan client layer.
pub struct TrojanClient {
    underlying: Arc<dyn TransportClient>,
    user: Arc<User>,
}

impl TrojanClient {
    pub fn new(config: &TrojanClientConfig, underlying: Arc<dyn TransportClient>) -> Result<Self> {
        let auth = Authenticator::new(&[config.password.as_str()]);
        let user = auth
            .get_user(&sha224_hex(&config.password))
            .ok_or_else(|| Error::Config("trojan client requires a password".into()))?;
        Ok(Self { underlying, user })
    }
}

#[async_trait]
impl TransportClient for TrojanClient {
    async fn dial(&self, endpoint: &str) -> Result<Connection> {
        let conn = self.underlying.dial(endpoint).await?;
        let user = self.user.clone();
        Ok(conn.map_stream(|stream| Box::new(TrojanClientStream::new(stream, user))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TcpClient, TcpServer};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn free_port() -> u16 {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    fn server_config(redirect_port: u16) -> TrojanServerConfig {
        TrojanServerConfig {
            passwords: vec!["letmein".into()],
            redirect_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            redirect_port,
        }
    }

    #[tokio::test]
    async fn authenticated_client_passes_through() {
        let port = free_port().await;
        let server = TrojanServer::new(&server_config(9), Arc::new(TcpServer::new()));
        server
            .listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap();

        let client = TrojanClient::new(
            &TrojanClientConfig {
                password: "letmein".into(),
            },
            Arc::new(TcpClient::new()),
        )
        .unwrap();

        let mut clt = client.dial(&format!("127.0.0.1:{}", port)).await.unwrap();
        clt.write_all(b"payload").await.unwrap();

        let mut srv = server.accept().await.unwrap();
        let mut buf = [0u8; 7];
        srv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");

        srv.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        clt.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn bad_credential_is_redirected() {
        let decoy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let decoy_port = decoy.local_addr().unwrap().port();

        let port = free_port().await;
        let server = TrojanServer::new(&server_config(decoy_port), Arc::new(TcpServer::new()));
        server
            .listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .await
            .unwrap();

        // accept() must keep waiting for a valid client, so park it.
        let accept_task = tokio::spawn(async move { server.accept().await });

        let mut prober = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let bogus = sha224_hex("not-the-password");
        prober.write_all(bogus.as_bytes()).await.unwrap();
        prober.write_all(b"\r\nprobe").await.unwrap();

        // The decoy receives the replayed preamble and the trailing bytes.
        let (mut redirected, _) = decoy.accept().await.unwrap();
        let mut replay = vec![0u8; HASH_LEN + 7];
        redirected.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay[..HASH_LEN], bogus.as_bytes());
        assert_eq!(&replay[HASH_LEN..], b"\r\nprobe");

        assert!(!accept_task.is_finished());
        accept_task.abort();
    }
}
