//! Failed-auth redirection
//!
//! Connections that fail Trojan authentication are not dropped: the bytes
//! already consumed are replayed into a plain TCP connection to the
//! configured redirect address and both directions are proxied until one
//! side closes. To a prober the listener behaves like whatever lives at
//! the redirect target.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::Connection;

/// Pending redirections buffered before the worker.
const REDIRECT_BACKLOG: usize = 64;

pub struct Redirection {
    pub inbound: Connection,
    /// Bytes consumed from the inbound side before authentication failed.
    pub buffered: Vec<u8>,
}

pub struct Redirector {
    tx: mpsc::Sender<Redirection>,
}

impl Redirector {
    pub fn new(redirect_to: SocketAddr) -> Self {
        let (tx, mut rx) = mpsc::channel::<Redirection>(REDIRECT_BACKLOG);
        tokio::spawn(async move {
            while let Some(redirection) = rx.recv().await {
                tokio::spawn(handle(redirection, redirect_to));
            }
        });
        Self { tx }
    }

    pub async fn redirect(&self, redirection: Redirection) {
        if self.tx.send(redirection).await.is_err() {
            debug!("redirector worker gone, dropping connection");
        }
    }
}

async fn handle(redirection: Redirection, redirect_to: SocketAddr) {
    let mut inbound = redirection.inbound;
    debug!(
        "redirecting connection from {} to {}",
        inbound.remote_addr(),
        redirect_to
    );
    let mut outbound = match TcpStream::connect(redirect_to).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("failed to reach redirect target {}: {}", redirect_to, e);
            return;
        }
    };
    if !redirection.buffered.is_empty() {
        use tokio::io::AsyncWriteExt;
        if outbound.write_all(&redirection.buffered).await.is_err() {
            return;
        }
    }
    if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        debug!("redirection ended: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn replays_buffered_bytes_and_proxies() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let redirector = Redirector::new(target_addr);

        let (inbound_side, mut prober) = tokio::io::duplex(1024);
        let fake = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let inbound = Connection::from_io(inbound_side, fake, fake);

        redirector
            .redirect(Redirection {
                inbound,
                buffered: b"GET / ".to_vec(),
            })
            .await;

        let (mut accepted, _) = target.accept().await.unwrap();
        prober.write_all(b"HTTP/1.0\r\n\r\n").await.unwrap();

        // Target sees the replayed prefix followed by the live bytes.
        let mut request = vec![0u8; 18];
        accepted.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");

        // And the response path flows back to the prober.
        accepted.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
        let mut response = vec![0u8; 17];
        prober.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.0 200 OK\r\n");
    }
}
