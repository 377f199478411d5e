//! Frame codec for peer streams
//!
//! Frame format:
//! ```text
//! +----------------+----------------------+
//! | u16 LE length  | payload (IP packet)  |
//! +----------------+----------------------+
//! ```
//!
//! Frames are concatenated back-to-back on the stream with no other
//! delimiters, so the decoder must resynchronize across arbitrary read
//! boundaries. Lengths of 0 or above [`MAX_FRAME_PAYLOAD`] mean the
//! stream is corrupt and the session cannot continue.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result, PACKET_CAPACITY};

/// Bytes of length prefix ahead of each payload.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a frame may carry: one pool buffer.
pub const MAX_FRAME_PAYLOAD: usize = PACKET_CAPACITY;

/// Decoder read-buffer size.
const DECODE_BUFFER_LEN: usize = 64 * 1024;

/// Write one frame. The caller owns flushing policy.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
    let header = (payload.len() as u16).to_le_bytes();
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Streaming frame decoder with a fill-then-slice buffer.
pub struct FrameDecoder {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; DECODE_BUFFER_LEN].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Read until one complete frame is buffered and return its payload.
    ///
    /// Errors: [`Error::Framing`] on an invalid length field,
    /// [`Error::ConnectionClosed`] on EOF, [`Error::Io`] on read failure.
    /// All of them end the session.
    pub async fn read_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<&[u8]> {
        let (payload_start, payload_end) = loop {
            if let Some(range) = self.pop_frame()? {
                break range;
            }

            // Compact when the tail cannot hold a worst-case frame.
            if self.buf.len() - self.end < FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD && self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }

            let n = reader.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.end += n;
        };
        Ok(&self.buf[payload_start..payload_end])
    }

    /// Slice the next complete frame out of the buffer, if present.
    fn pop_frame(&mut self) -> Result<Option<(usize, usize)>> {
        let available = self.end - self.start;
        if available < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_le_bytes([self.buf[self.start], self.buf[self.start + 1]]) as usize;
        if len == 0 || len > MAX_FRAME_PAYLOAD {
            return Err(Error::Framing(format!("invalid frame length {}", len)));
        }
        if available < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let payload_start = self.start + FRAME_HEADER_LEN;
        let payload_end = payload_start + len;
        self.start = payload_end;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        Ok(Some((payload_start, payload_end)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn round_trip_preserves_bytes_and_order() {
        let (mut tx, mut rx) = duplex(DECODE_BUFFER_LEN);
        let packets: Vec<Vec<u8>> = vec![
            vec![1u8; 40],
            (0..=255u8).cycle().take(700).collect(),
            vec![9u8; 1500],
        ];

        for p in &packets {
            write_frame(&mut tx, p).await.unwrap();
        }
        tx.flush().await.unwrap();

        let mut decoder = FrameDecoder::new();
        for p in &packets {
            let got = decoder.read_frame(&mut rx).await.unwrap();
            assert_eq!(got, &p[..]);
        }
    }

    #[tokio::test]
    async fn resyncs_across_one_byte_reads() {
        // Feed the encoded stream through a 1-byte-per-read choke point.
        let mut encoded = Vec::new();
        let sizes = [40usize, 100, 1500];
        for (i, &size) in sizes.iter().enumerate() {
            let payload = vec![i as u8 + 1; size];
            encoded.extend_from_slice(&(size as u16).to_le_bytes());
            encoded.extend_from_slice(&payload);
        }

        struct OneByte {
            data: Vec<u8>,
            pos: usize,
        }
        impl AsyncRead for OneByte {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                if self.pos < self.data.len() {
                    let byte = self.data[self.pos];
                    self.pos += 1;
                    buf.put_slice(&[byte]);
                }
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut reader = OneByte {
            data: encoded,
            pos: 0,
        };
        let mut decoder = FrameDecoder::new();
        for (i, &size) in sizes.iter().enumerate() {
            let got = decoder.read_frame(&mut reader).await.unwrap();
            assert_eq!(got.len(), size);
            assert!(got.iter().all(|&b| b == i as u8 + 1));
        }
    }

    #[tokio::test]
    async fn zero_length_is_a_framing_error() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&[0, 0]).await.unwrap();
        let mut decoder = FrameDecoder::new();
        let err = decoder.read_frame(&mut rx).await.map(<[u8]>::len);
        assert!(matches!(err, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn oversized_length_is_a_framing_error() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&[0xff, 0xff, 0, 0]).await.unwrap();
        let mut decoder = FrameDecoder::new();
        let err = decoder.read_frame(&mut rx).await.map(<[u8]>::len);
        assert!(matches!(err, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn eof_maps_to_connection_closed() {
        let (tx, mut rx) = duplex(64);
        drop(tx);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.read_frame(&mut rx).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
