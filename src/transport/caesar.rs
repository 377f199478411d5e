//! Caesar obfuscation wrapper
//!
//! Rotates every byte by a configured shift mod 256 on write and rotates
//! it back on read. This is obfuscation, not encryption: it hides nothing
//! from anyone who looks. Real confidentiality comes from the TLS layer.

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::{Result, Stream};

use super::{Connection, TransportClient, TransportServer};

fn rotate_add(data: &mut [u8], shift: u8) {
    for b in data.iter_mut() {
        *b = b.wrapping_add(shift);
    }
}

/// Byte-rotating stream wrapper. The rotation is stateless per byte, so
/// partial writes need no bookkeeping: unwritten bytes are simply
/// re-shifted on the next call.
struct CaesarStream {
    inner: Stream,
    shift: u8,
    scratch: Vec<u8>,
}

impl CaesarStream {
    fn new(inner: Stream, shift: u8) -> Self {
        Self {
            inner,
            shift,
            scratch: Vec::new(),
        }
    }
}

impl AsyncRead for CaesarStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                rotate_add(&mut buf.filled_mut()[before..], this.shift.wrapping_neg());
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for CaesarStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.scratch.clear();
        this.scratch.extend_from_slice(buf);
        let shift = this.shift;
        rotate_add(&mut this.scratch, shift);
        Pin::new(&mut this.inner).poll_write(cx, &this.scratch)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Caesar server layer.
pub struct CaesarServer {
    underlying: Arc<dyn TransportServer>,
    shift: u8,
}

impl CaesarServer {
    pub fn new(shift: u8, underlying: Arc<dyn TransportServer>) -> Self {
        Self { underlying, shift }
    }
}

#[async_trait]
impl TransportServer for CaesarServer {
    async fn listen(&self, host: IpAddr, port: u16) -> Result<()> {
        self.underlying.listen(host, port).await
    }

    async fn accept(&self) -> Result<Connection> {
        let conn = self.underlying.accept().await?;
        let shift = self.shift;
        Ok(conn.map_stream(|stream| Box::new(CaesarStream::new(stream, shift))))
    }

    async fn close(&self) -> Result<()> {
        self.underlying.close().await
    }
}

/// Caesar client layer.
pub struct CaesarClient {
    underlying: Arc<dyn TransportClient>,
    shift: u8,
}

impl CaesarClient {
    pub fn new(shift: u8, underlying: Arc<dyn TransportClient>) -> Self {
        Self { underlying, shift }
    }
}

#[async_trait]
impl TransportClient for CaesarClient {
    async fn dial(&self, endpoint: &str) -> Result<Connection> {
        let conn = self.underlying.dial(endpoint).await?;
        let shift = self.shift;
        Ok(conn.map_stream(|stream| Box::new(CaesarStream::new(stream, shift))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shifted_on_the_wire_plain_at_the_ends() {
        let (a, b) = tokio::io::duplex(256);
        let mut shifted = CaesarStream::new(Box::new(a), 3);
        let mut raw = b;

        shifted.write_all(b"abc").await.unwrap();
        let mut wire = [0u8; 3];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"def");

        raw.write_all(b"def").await.unwrap();
        let mut plain = [0u8; 3];
        shifted.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"abc");
    }

    #[tokio::test]
    async fn wraps_around_mod_256() {
        let (a, b) = tokio::io::duplex(256);
        let mut shifted = CaesarStream::new(Box::new(a), 10);
        let mut raw = b;

        shifted.write_all(&[250, 255, 0]).await.unwrap();
        let mut wire = [0u8; 3];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [4, 9, 10]);
    }
}
