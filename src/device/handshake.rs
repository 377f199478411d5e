//! Peer identity handshake
//!
//! The first record on a fresh connection, dialer → accepter: the
//! dialer's VPN IPv4 address (4 bytes) followed by its 32-byte public
//! key. No confidentiality and no proof of possession — the record only
//! tells the accepting device which configured peer the stream belongs
//! to. Nodes that need authenticated peers run the stack over TLS with
//! client certificates.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::common::{Error, Result};
use crate::crypto::{PublicKey, KEY_LEN};

/// Identity record length: IPv4 address plus public key.
pub const HANDSHAKE_LEN: usize = 4 + KEY_LEN;

/// Both sides give up after this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send our identity record. Dialing side only.
pub async fn send_identity<W: AsyncWrite + Unpin>(
    conn: &mut W,
    local_ip: Ipv4Addr,
    public_key: &PublicKey,
) -> Result<()> {
    let mut record = [0u8; HANDSHAKE_LEN];
    record[..4].copy_from_slice(&local_ip.octets());
    record[4..].copy_from_slice(public_key.as_bytes());
    timeout(HANDSHAKE_TIMEOUT, async {
        conn.write_all(&record).await?;
        conn.flush().await?;
        Ok::<_, Error>(())
    })
    .await
    .map_err(|_| Error::Handshake("send timed out".into()))??;
    Ok(())
}

/// Read the dialer's identity record. Accepting side only.
pub async fn receive_identity<R: AsyncRead + Unpin>(conn: &mut R) -> Result<(Ipv4Addr, PublicKey)> {
    let mut record = [0u8; HANDSHAKE_LEN];
    timeout(HANDSHAKE_TIMEOUT, conn.read_exact(&mut record))
        .await
        .map_err(|_| Error::Handshake("receive timed out".into()))?
        .map_err(|e| Error::Handshake(format!("short read: {}", e)))?;

    let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&record[4..]);
    Ok((ip, PublicKey::from_bytes(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use tokio::io::duplex;

    #[tokio::test]
    async fn identity_round_trips() {
        let (mut dialer, mut accepter) = duplex(64);
        let key = PrivateKey::generate().public_key();
        let ip = Ipv4Addr::new(10, 0, 0, 2);

        send_identity(&mut dialer, ip, &key).await.unwrap();
        let (got_ip, got_key) = receive_identity(&mut accepter).await.unwrap();
        assert_eq!(got_ip, ip);
        assert_eq!(got_key, key);
    }

    #[tokio::test]
    async fn truncated_record_is_a_handshake_error() {
        let (mut dialer, mut accepter) = duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut dialer, &[10, 0, 0, 2])
            .await
            .unwrap();
        drop(dialer);
        assert!(matches!(
            receive_identity(&mut accepter).await,
            Err(Error::Handshake(_))
        ));
    }
}
