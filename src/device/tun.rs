//! TUN device abstraction
//!
//! The forwarding engine needs only `recv`/`send`/`close` on whole IP
//! datagrams; everything host-specific (device creation, addresses,
//! routing) stays behind [`NativeTun::create`]. Tests run against
//! [`MemoryTun`], a channel-backed pair with no host footprint.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::common::{Error, Result};

/// Interface MTU; also bounds a single TUN read.
pub const TUN_MTU: usize = 1500;

/// Host virtual interface carrying whole IP datagrams.
#[async_trait]
pub trait Tun: Send + Sync {
    /// Read one datagram into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one datagram.
    async fn send(&self, packet: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Real TUN interface via the host's tun driver.
pub struct NativeTun {
    device: Mutex<tun::AsyncDevice>,
    name: String,
}

impl NativeTun {
    /// Create and bring up a TUN interface addressed inside `address`.
    pub fn create(name: &str, address: Ipv4Network) -> Result<Self> {
        let mut config = tun::Configuration::default();
        config
            .name(name)
            .address(address.ip())
            .netmask(address.mask())
            .mtu(TUN_MTU as i32)
            .up();

        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| Error::Setup(format!("cannot create TUN device {}: {}", name, e)))?;
        info!("created TUN device {} with address {}", name, address);

        Ok(Self {
            device: Mutex::new(device),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Tun for NativeTun {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut device = self.device.lock().await;
        let n = device.read(buf).await?;
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> Result<()> {
        let mut device = self.device.lock().await;
        device.write_all(packet).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("closing TUN device {}", self.name);
        Ok(())
    }
}

/// In-memory TUN for tests: what the host stack would inject comes in
/// through [`MemoryTunHandle::inject`], what the device delivers to the
/// host comes out of [`MemoryTunHandle::next_delivered`].
pub struct MemoryTun {
    from_host: Mutex<mpsc::Receiver<Vec<u8>>>,
    to_host: mpsc::Sender<Vec<u8>>,
}

/// Test-side handle of a [`MemoryTun`].
pub struct MemoryTunHandle {
    inject_tx: mpsc::Sender<Vec<u8>>,
    delivered_rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryTun {
    pub fn pair() -> (Self, MemoryTunHandle) {
        let (inject_tx, from_host) = mpsc::channel(64);
        let (to_host, delivered_rx) = mpsc::channel(64);
        (
            Self {
                from_host: Mutex::new(from_host),
                to_host,
            },
            MemoryTunHandle {
                inject_tx,
                delivered_rx,
            },
        )
    }
}

impl MemoryTunHandle {
    /// Simulate the host writing a packet to the interface.
    pub async fn inject(&self, packet: Vec<u8>) {
        self.inject_tx.send(packet).await.expect("tun closed");
    }

    /// Next packet the device wrote back to the host.
    pub async fn next_delivered(&mut self) -> Option<Vec<u8>> {
        self.delivered_rx.recv().await
    }
}

#[async_trait]
impl Tun for MemoryTun {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let packet = self
            .from_host
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> Result<()> {
        self.to_host
            .send(packet.to_vec())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
