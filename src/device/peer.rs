//! Peer session
//!
//! One `Peer` per configured remote node. A session is a pair of routines
//! over one connection: the sender drains the peer's inbound queue into
//! framed writes, the receiver decodes frames into the device routing
//! queue. Either routine tearing down marks the peer disconnected; a new
//! connection (from `start`'s dialer or the device listener) replaces the
//! old session atomically under the session mutex.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use tokio::io::{AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::common::{Error, PacketBuffer, PacketPool, Result};
use crate::config::PeerConfig;
use crate::crypto::PublicKey;
use crate::transport::{Connection, TransportClient};

use super::framing::{write_frame, FrameDecoder};
use super::handshake;

/// Depth of the per-peer outbound packet queue.
const INBOUND_QUEUE_DEPTH: usize = 1024;

const DIAL_ATTEMPTS: u32 = 3;
const DIAL_BACKOFF: Duration = Duration::from_secs(2);
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// A receiver that sees nothing for this long assumes the session is dead.
const READ_DEADLINE: Duration = Duration::from_secs(30);

/// Sender write buffering: flush at the threshold or on the tick.
const WRITE_BUFFER_LEN: usize = 64 * 1024;
const FLUSH_THRESHOLD: usize = 32 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Running session state, guarded by the session mutex.
#[derive(Default)]
struct SessionSlot {
    stop_tx: Option<broadcast::Sender<()>>,
    /// Returns the queue receiver when the routine exits so a later
    /// session can pick the queue back up.
    sender_task: Option<JoinHandle<mpsc::Receiver<PacketBuffer>>>,
    receiver_task: Option<JoinHandle<()>>,
}

pub struct Peer {
    public_key: PublicKey,
    allowed_ips: IpNetwork,
    /// The peer's own VPN address: the base address of its prefix.
    local_ip: IpAddr,
    remote_endpoint: Option<String>,
    client: Arc<dyn TransportClient>,

    connected: AtomicBool,
    session: Mutex<SessionSlot>,

    inbound_tx: mpsc::Sender<PacketBuffer>,
    inbound_rx: Mutex<Option<mpsc::Receiver<PacketBuffer>>>,

    routing_tx: mpsc::Sender<PacketBuffer>,
    pool: Arc<PacketPool>,
}

impl Peer {
    /// Parse a peer from config. No sockets are opened here.
    pub fn new(
        config: &PeerConfig,
        client: Arc<dyn TransportClient>,
        routing_tx: mpsc::Sender<PacketBuffer>,
        pool: Arc<PacketPool>,
    ) -> Result<Self> {
        let public_key = PublicKey::from_base64(&config.public_key)?;
        let allowed_ips: IpNetwork = config
            .allowed_ips
            .parse()
            .map_err(|e| Error::Config(format!("invalid AllowedIPs {}: {}", config.allowed_ips, e)))?;
        if let Some(endpoint) = &config.endpoint {
            if !endpoint.contains(':') {
                return Err(Error::Config(format!("invalid Endpoint {}", endpoint)));
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        Ok(Self {
            public_key,
            allowed_ips,
            local_ip: allowed_ips.ip(),
            remote_endpoint: config.endpoint.clone(),
            client,
            connected: AtomicBool::new(false),
            session: Mutex::new(SessionSlot::default()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            routing_tx,
            pool,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn allowed_ips(&self) -> IpNetwork {
        self.allowed_ips
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hand a packet to this peer's sender. Gives the buffer back if the
    /// peer cannot take it (disconnected); the caller recycles it.
    pub async fn enqueue(&self, packet: PacketBuffer) -> Option<PacketBuffer> {
        if !self.is_connected() {
            return Some(packet);
        }
        match self.inbound_tx.reserve().await {
            Ok(permit) => {
                permit.send(packet);
                None
            }
            Err(_) => Some(packet),
        }
    }

    /// Dial the configured endpoint (if any), identify ourselves, and
    /// bring the session up. Passive peers return immediately.
    pub async fn start(
        self: &Arc<Self>,
        device_ip: Ipv4Addr,
        device_key: &PublicKey,
    ) -> Result<()> {
        let Some(endpoint) = self.remote_endpoint.clone() else {
            return Ok(());
        };
        debug!("connecting to peer endpoint {}", endpoint);
        let mut conn = self.dial_with_retry(&endpoint).await?;
        handshake::send_identity(&mut conn, device_ip, device_key).await?;
        self.attach(conn).await?;
        debug!("connected to peer endpoint {}", endpoint);
        Ok(())
    }

    async fn dial_with_retry(&self, endpoint: &str) -> Result<Connection> {
        let mut last_err = Error::Timeout;
        for attempt in 1..=DIAL_ATTEMPTS {
            debug!(
                "connection attempt {}/{} to {}",
                attempt, DIAL_ATTEMPTS, endpoint
            );
            match timeout(DIAL_TIMEOUT, self.client.dial(endpoint)).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => {
                    warn!("connection attempt {} failed: {}", attempt, e);
                    last_err = e;
                }
                Err(_) => {
                    warn!("connection attempt {} timed out", attempt);
                    last_err = Error::Timeout;
                }
            }
            if attempt < DIAL_ATTEMPTS {
                sleep(DIAL_BACKOFF).await;
            }
        }
        Err(Error::Dial(format!(
            "{} unreachable after {} attempts: {}",
            endpoint, DIAL_ATTEMPTS, last_err
        )))
    }

    /// Install a connection and spawn the session routines, replacing and
    /// joining any previous session. Shared by the dialer and the
    /// listener's accept path.
    pub async fn attach(self: &Arc<Self>, conn: Connection) -> Result<()> {
        let mut slot = self.session.lock().await;
        self.teardown_locked(&mut slot).await;

        let queue_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Transport("peer queue is not available".into()))?;

        let (read_half, write_half) = tokio::io::split(conn);
        let (stop_tx, _) = broadcast::channel(1);

        self.connected.store(true, Ordering::SeqCst);
        slot.sender_task = Some(tokio::spawn(run_sender(
            self.clone(),
            write_half,
            queue_rx,
            stop_tx.subscribe(),
        )));
        slot.receiver_task = Some(tokio::spawn(run_receiver(
            self.clone(),
            read_half,
            stop_tx.subscribe(),
            stop_tx.clone(),
        )));
        slot.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Stop the running session, if any, and put the queue receiver back.
    pub async fn stop(&self) {
        let mut slot = self.session.lock().await;
        self.teardown_locked(&mut slot).await;
    }

    async fn teardown_locked(&self, slot: &mut SessionSlot) {
        if let Some(stop_tx) = slot.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = slot.sender_task.take() {
            if let Ok(queue_rx) = task.await {
                *self.inbound_rx.lock().await = Some(queue_rx);
            }
        }
        if let Some(task) = slot.receiver_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Recycle packets still sitting in the queue. Call after `stop`.
    pub async fn drain_queue(&self) {
        if let Some(queue_rx) = self.inbound_rx.lock().await.as_mut() {
            while let Ok(packet) = queue_rx.try_recv() {
                self.pool.put(packet);
            }
        }
    }
}

/// Drain the peer queue into framed, buffered writes.
async fn run_sender(
    peer: Arc<Peer>,
    write_half: WriteHalf<Connection>,
    mut queue_rx: mpsc::Receiver<PacketBuffer>,
    mut stop_rx: broadcast::Receiver<()>,
) -> mpsc::Receiver<PacketBuffer> {
    debug!("routine: peer {} sender - started", peer.local_ip);
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_LEN, write_half);
    let mut flush_tick = interval(FLUSH_INTERVAL);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                let _ = writer.flush().await;
                break;
            }
            maybe_packet = queue_rx.recv() => {
                let Some(packet) = maybe_packet else {
                    let _ = writer.flush().await;
                    break;
                };
                let result = write_frame(&mut writer, packet.as_slice()).await;
                peer.pool.put(packet);
                if let Err(e) = result {
                    error!("peer {}: failed to send packet: {}", peer.local_ip, e);
                    break;
                }
                if writer.buffer().len() >= FLUSH_THRESHOLD {
                    if let Err(e) = writer.flush().await {
                        error!("peer {}: failed to flush: {}", peer.local_ip, e);
                        break;
                    }
                }
            }
            _ = flush_tick.tick() => {
                if !writer.buffer().is_empty() {
                    if let Err(e) = writer.flush().await {
                        error!("peer {}: failed to flush: {}", peer.local_ip, e);
                        break;
                    }
                }
            }
        }
    }

    peer.connected.store(false, Ordering::SeqCst);
    debug!("routine: peer {} sender - stopped", peer.local_ip);
    queue_rx
}

/// Decode frames off the stream into the device routing queue.
async fn run_receiver(
    peer: Arc<Peer>,
    mut read_half: ReadHalf<Connection>,
    mut stop_rx: broadcast::Receiver<()>,
    stop_tx: broadcast::Sender<()>,
) {
    debug!("routine: peer {} receiver - started", peer.local_ip);
    let mut decoder = FrameDecoder::new();

    loop {
        let packet = {
            let frame = tokio::select! {
                _ = stop_rx.recv() => break,
                result = timeout(READ_DEADLINE, decoder.read_frame(&mut read_half)) => {
                    match result {
                        Ok(Ok(frame)) => frame,
                        Ok(Err(e)) => {
                            error!("peer {}: failed to receive packet: {}", peer.local_ip, e);
                            break;
                        }
                        Err(_) => {
                            warn!("peer {}: read deadline exceeded", peer.local_ip);
                            break;
                        }
                    }
                }
            };
            let mut packet = peer.pool.get();
            packet.set(frame);
            packet
        };

        tokio::select! {
            _ = stop_rx.recv() => {
                peer.pool.put(packet);
                break;
            }
            permit = peer.routing_tx.reserve() => {
                match permit {
                    Ok(permit) => permit.send(packet),
                    Err(_) => {
                        peer.pool.put(packet);
                        break;
                    }
                }
            }
        }
    }

    peer.connected.store(false, Ordering::SeqCst);
    // Wake the sender so the session goes down as a unit.
    let _ = stop_tx.send(());
    debug!("routine: peer {} receiver - stopped", peer.local_ip);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use crate::transport::TcpClient;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_peer(
        endpoint: Option<String>,
        routing_tx: mpsc::Sender<PacketBuffer>,
        pool: Arc<PacketPool>,
    ) -> Arc<Peer> {
        let config = PeerConfig {
            public_key: PrivateKey::generate().public_key().to_base64(),
            allowed_ips: "10.9.0.2/32".into(),
            endpoint,
        };
        Arc::new(Peer::new(&config, Arc::new(TcpClient::new()), routing_tx, pool).unwrap())
    }

    fn loopback_conn(stream: tokio::io::DuplexStream) -> Connection {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        Connection::from_io(stream, addr, addr)
    }

    #[tokio::test]
    async fn dial_retries_until_endpoint_appears() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (routing_tx, _routing_rx) = mpsc::channel(16);
        let pool = Arc::new(PacketPool::new());
        let peer = test_peer(Some(format!("127.0.0.1:{}", port)), routing_tx, pool);

        // The endpoint only starts listening while the second backoff is
        // still running, so success needs the third attempt.
        let accept_task = tokio::spawn(async move {
            sleep(Duration::from_millis(3500)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .unwrap();
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut record = [0u8; handshake::HANDSHAKE_LEN];
            conn.read_exact(&mut record).await.unwrap();
            conn
        });

        let started = Instant::now();
        let device_key = PrivateKey::generate().public_key();
        peer.start(Ipv4Addr::new(10, 9, 0, 1), &device_key)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));

        let held_open = accept_task.await.unwrap();
        assert!(peer.is_connected());
        drop(held_open);
        peer.stop().await;
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_dial_error() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (routing_tx, _routing_rx) = mpsc::channel(16);
        let pool = Arc::new(PacketPool::new());
        let peer = test_peer(Some(format!("127.0.0.1:{}", port)), routing_tx, pool);

        let device_key = PrivateKey::generate().public_key();
        let err = peer
            .start(Ipv4Addr::new(10, 9, 0, 1), &device_key)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dial(_)));
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn sender_frames_queued_packets() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let (routing_tx, _routing_rx) = mpsc::channel(16);
        let pool = Arc::new(PacketPool::new());
        let peer = test_peer(None, routing_tx, pool.clone());

        peer.attach(loopback_conn(local)).await.unwrap();
        assert!(peer.is_connected());

        let mut packet = pool.get();
        packet.set(&[0x45, 1, 2, 3, 4]);
        assert!(peer.enqueue(packet).await.is_none());

        let mut header = [0u8; 2];
        remote.read_exact(&mut header).await.unwrap();
        assert_eq!(u16::from_le_bytes(header), 5);
        let mut payload = [0u8; 5];
        remote.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, &[0x45, 1, 2, 3, 4]);

        peer.stop().await;
        peer.drain_queue().await;
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn receiver_routes_frames_and_dies_on_bad_length() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let (routing_tx, mut routing_rx) = mpsc::channel(16);
        let pool = Arc::new(PacketPool::new());
        let peer = test_peer(None, routing_tx, pool.clone());

        peer.attach(loopback_conn(local)).await.unwrap();

        // A well-formed frame lands in the routing queue.
        remote.write_all(&3u16.to_le_bytes()).await.unwrap();
        remote.write_all(&[0x45, 9, 9]).await.unwrap();
        let routed = routing_rx.recv().await.unwrap();
        assert_eq!(routed.as_slice(), &[0x45, 9, 9]);
        pool.put(routed);

        // An oversized length field kills the session.
        remote.write_all(&[0xff, 0xff, 0, 0]).await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(!peer.is_connected());

        peer.stop().await;
        assert_eq!(pool.outstanding(), 0);

        // The queue survives teardown: a new connection can be attached.
        let (local2, _remote2) = tokio::io::duplex(1024);
        peer.attach(loopback_conn(local2)).await.unwrap();
        assert!(peer.is_connected());
        peer.stop().await;
    }

    #[tokio::test]
    async fn disconnected_peer_refuses_packets() {
        let (routing_tx, _routing_rx) = mpsc::channel(16);
        let pool = Arc::new(PacketPool::new());
        let peer = test_peer(None, routing_tx, pool.clone());

        let mut packet = pool.get();
        packet.set(&[0x45, 0]);
        let returned = peer.enqueue(packet).await.expect("must hand the packet back");
        pool.put(returned);
        assert_eq!(pool.outstanding(), 0);
    }
}
