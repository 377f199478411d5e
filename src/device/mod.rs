//! Device — the forwarding engine
//!
//! One device per virtual interface. Four long-running routines plus two
//! per peer, all communicating over bounded queues:
//!
//! ```text
//! TUN ─ reader ─► routing queue ─ classifier ─► peer inbound ─ sender ─► network
//!                      ▲              │
//!                      │              └─► outbound queue ─ writer ─► TUN
//!                      └──────── peer receivers ◄─────────────── network
//! ```
//!
//! The peers map and the allowed-IP trie are immutable once the device is
//! built; only each peer's connection slot changes at runtime.

pub mod flow;
pub mod framing;
pub mod handshake;
mod peer;
pub mod tun;

pub use peer::Peer;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::{Error, PacketBuffer, PacketPool, Result};
use crate::config::Config;
use crate::crypto::{PrivateKey, PublicKey};
use crate::router::AllowedIps;
use crate::transport::{stack, TransportServer};

use self::flow::FlowTable;
use self::tun::{Tun, TUN_MTU};

/// Depth of the routing and outbound queues.
const QUEUE_DEPTH: usize = 1024;

pub struct Device {
    public_key: PublicKey,
    local_ip: Ipv4Addr,
    tun: Arc<dyn Tun>,
    peers: HashMap<PublicKey, Arc<Peer>>,
    allowed_ips: AllowedIps<Arc<Peer>>,
    server: Arc<dyn TransportServer>,
    listen_port: u16,

    pool: Arc<PacketPool>,
    flows: Arc<FlowTable>,

    routing_tx: mpsc::Sender<PacketBuffer>,
    routing_rx: Mutex<Option<mpsc::Receiver<PacketBuffer>>>,
    outbound_tx: mpsc::Sender<PacketBuffer>,
    outbound_rx: Mutex<Option<mpsc::Receiver<PacketBuffer>>>,

    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    /// Build a device from configuration. Parses all keys and prefixes,
    /// composes the transport stack, and creates the peers and the
    /// allowed-IP trie. No sockets or routines yet.
    pub fn new(config: &Config, tun: Arc<dyn Tun>) -> Result<Arc<Self>> {
        let private_key = PrivateKey::from_base64(&config.interface.private_key)?;
        let public_key = private_key.public_key();

        let address: IpNetwork = config
            .interface
            .address
            .parse()
            .map_err(|e| Error::Config(format!("invalid Address {}: {}", config.interface.address, e)))?;
        let IpNetwork::V4(address) = address else {
            return Err(Error::Config(
                "interface Address must be IPv4 in this version".into(),
            ));
        };
        let local_ip = address.ip();
        debug!("device local IP {}", local_ip);

        let server = stack::build_server(&config.transport)?;
        let client = stack::build_client(&config.transport)?;

        let pool = Arc::new(PacketPool::new());
        let (routing_tx, routing_rx) = mpsc::channel(QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);

        let mut peers = HashMap::new();
        let mut allowed_ips = AllowedIps::new();
        for peer_config in &config.peers {
            let peer = Arc::new(Peer::new(
                peer_config,
                client.clone(),
                routing_tx.clone(),
                pool.clone(),
            )?);
            if peers.insert(*peer.public_key(), peer.clone()).is_some() {
                return Err(Error::Config(format!(
                    "duplicate peer public key {}",
                    peer.public_key()
                )));
            }
            allowed_ips.insert(peer.allowed_ips(), peer.clone());
            debug!("new peer {} ({})", peer.local_ip(), peer.public_key());
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            public_key,
            local_ip,
            tun,
            peers,
            allowed_ips,
            server,
            listen_port: config.interface.listen_port,
            pool,
            flows: Arc::new(FlowTable::new()),
            routing_tx,
            routing_rx: Mutex::new(Some(routing_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    pub fn peer(&self, key: &PublicKey) -> Option<&Arc<Peer>> {
        self.peers.get(key)
    }

    /// Bring the device up: start peers, the listener (when configured),
    /// and the forwarding routines. Dial failures are logged per peer and
    /// do not stop the device.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        debug!("starting device");

        for peer in self.peers.values() {
            if let Err(e) = peer.start(self.local_ip, &self.public_key).await {
                error!("failed to start peer {}: {}", peer.local_ip(), e);
            }
        }

        let mut tasks = self.tasks.lock().await;

        if self.listen_port > 0 {
            self.server
                .listen(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.listen_port)
                .await
                .map_err(|e| Error::Setup(format!("listen on {}: {}", self.listen_port, e)))?;
            info!("listening on port {}", self.listen_port);
            tasks.push(tokio::spawn(run_listener(
                self.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        let routing_rx = self
            .routing_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Setup("device already started".into()))?;
        let outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Setup("device already started".into()))?;

        tasks.push(tokio::spawn(run_classifier(
            self.clone(),
            routing_rx,
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(run_tun_reader(
            self.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(run_tun_writer(
            self.clone(),
            outbound_rx,
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// Cancel every routine, stop the peers, and drain the queues.
    pub async fn close(&self) {
        debug!("closing device");
        let _ = self.shutdown_tx.send(());
        let _ = self.server.close().await;

        for peer in self.peers.values() {
            peer.stop().await;
            peer.drain_queue().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }

        let _ = self.tun.close().await;
    }
}

/// Broadcast, multicast, and link-local destinations never leave the node.
fn is_broadcast_or_multicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_multicast()
                || v4.is_broadcast()
                || (octets[0] == 169 && octets[1] == 254)
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            v6.is_multicast()
                || (octets[0] == 0xfe && octets[1] & 0xc0 == 0x80)
                || (octets[0] == 0xfe && octets[1] & 0xc0 == 0xc0)
        }
    }
}

/// Destination address of the packet, or `None` when it is too short or
/// not IP at all.
fn destination(packet: &PacketBuffer) -> Option<IpAddr> {
    let data = packet.as_slice();
    match packet.ip_version() {
        4 if data.len() >= 20 => {
            let dst: [u8; 4] = data[16..20].try_into().ok()?;
            Some(IpAddr::from(dst))
        }
        6 if data.len() >= 40 => {
            let dst: [u8; 16] = data[24..40].try_into().ok()?;
            Some(IpAddr::from(dst))
        }
        _ => None,
    }
}

/// Routing classifier: every packet ends up in exactly one place — the
/// outbound queue (it is for us), one peer's inbound queue, or back in
/// the pool (dropped).
async fn run_classifier(
    device: Arc<Device>,
    mut routing_rx: mpsc::Receiver<PacketBuffer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("routine: routing classifier - started");
    loop {
        let packet = tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe = routing_rx.recv() => match maybe {
                Some(packet) => packet,
                None => break,
            },
        };

        let Some(dst) = destination(&packet) else {
            debug!("dropping packet with unknown IP version");
            device.pool.put(packet);
            continue;
        };

        if dst == IpAddr::V4(device.local_ip) {
            device.flows.record_inbound(packet.as_slice());
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    device.pool.put(packet);
                    break;
                }
                permit = device.outbound_tx.reserve() => match permit {
                    Ok(permit) => permit.send(packet),
                    Err(_) => {
                        device.pool.put(packet);
                        break;
                    }
                },
            }
            continue;
        }

        if is_broadcast_or_multicast(dst) {
            device.pool.put(packet);
            continue;
        }

        let Some(peer) = device.allowed_ips.lookup(dst) else {
            device.pool.put(packet);
            continue;
        };
        device.flows.record_outbound(packet.as_slice());
        if let Some(packet) = peer.enqueue(packet).await {
            device.pool.put(packet);
        }
    }

    // Recycle whatever is still queued.
    while let Ok(packet) = routing_rx.try_recv() {
        device.pool.put(packet);
    }
    debug!("routine: routing classifier - stopped");
}

/// TUN reader: pool buffer per datagram, straight into the routing queue.
async fn run_tun_reader(device: Arc<Device>, mut shutdown_rx: broadcast::Receiver<()>) {
    debug!("routine: TUN reader - started");
    loop {
        let mut packet = device.pool.get();
        let read = tokio::select! {
            _ = shutdown_rx.recv() => {
                device.pool.put(packet);
                break;
            }
            read = device.tun.recv(&mut packet.storage_mut()[..TUN_MTU]) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                device.pool.put(packet);
                error!("failed to read packet from TUN device: {}", e);
                break;
            }
        };
        if n < 1 {
            device.pool.put(packet);
            continue;
        }
        packet.set_len(n);

        tokio::select! {
            _ = shutdown_rx.recv() => {
                device.pool.put(packet);
                break;
            }
            permit = device.routing_tx.reserve() => match permit {
                Ok(permit) => permit.send(packet),
                Err(_) => {
                    device.pool.put(packet);
                    break;
                }
            },
        }
    }
    debug!("routine: TUN reader - stopped");
}

/// TUN writer: drains the outbound queue into the interface.
async fn run_tun_writer(
    device: Arc<Device>,
    mut outbound_rx: mpsc::Receiver<PacketBuffer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("routine: TUN writer - started");
    loop {
        let packet = tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe = outbound_rx.recv() => match maybe {
                Some(packet) => packet,
                None => break,
            },
        };
        if let Err(e) = device.tun.send(packet.as_slice()).await {
            error!("failed to write packet to TUN device: {}", e);
        }
        device.pool.put(packet);
    }

    while let Ok(packet) = outbound_rx.try_recv() {
        device.pool.put(packet);
    }
    debug!("routine: TUN writer - stopped");
}

/// Listener: accept, identify, install on the matching peer.
async fn run_listener(device: Arc<Device>, mut shutdown_rx: broadcast::Receiver<()>) {
    debug!("routine: listener - started");
    loop {
        let conn = tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = device.server.accept() => match accepted {
                Ok(conn) => conn,
                Err(Error::ConnectionClosed) => break,
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    continue;
                }
            },
        };
        debug!("accepted connection from {}", conn.remote_addr());

        let device = device.clone();
        tokio::spawn(async move {
            let mut conn = conn;
            let (peer_ip, peer_key) = match handshake::receive_identity(&mut conn).await {
                Ok(identity) => identity,
                Err(e) => {
                    error!("failed to receive handshake: {}", e);
                    return;
                }
            };
            let Some(peer) = device.peers.get(&peer_key) else {
                warn!("no peer configured for public key {}", peer_key);
                return;
            };
            if let Err(e) = peer.attach(conn).await {
                error!("failed to install connection on peer {}: {}", peer_ip, e);
                return;
            }
            debug!("connected to peer {} from inbound", peer.local_ip());
        });
    }
    debug!("routine: listener - stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::PrivateKey;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::{sleep, timeout};

    use super::tun::{MemoryTun, MemoryTunHandle};

    async fn free_port() -> u16 {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    fn icmp_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p[8] = 64;
        p[9] = 1;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p[20] = 8; // echo request
        p
    }

    fn node(
        private_key: &PrivateKey,
        address: &str,
        listen_port: u16,
        peers: &[(&PublicKey, &str, Option<String>)],
    ) -> (Arc<Device>, MemoryTunHandle) {
        let mut doc = format!(
            "[Interface]\nPrivateKey = \"{}\"\nListenPort = {}\nAddress = \"{}\"\n",
            private_key.to_base64(),
            listen_port,
            address
        );
        for (key, allowed, endpoint) in peers {
            doc.push_str(&format!(
                "\n[[Peer]]\nPublicKey = \"{}\"\nAllowedIPs = \"{}\"\n",
                key.to_base64(),
                allowed
            ));
            if let Some(endpoint) = endpoint {
                doc.push_str(&format!("Endpoint = \"{}\"\n", endpoint));
            }
        }
        let config = Config::from_toml(&doc).unwrap();
        let (tun, handle) = MemoryTun::pair();
        (Device::new(&config, Arc::new(tun)).unwrap(), handle)
    }

    #[tokio::test]
    async fn two_node_echo_over_tcp() {
        let port = free_port().await;
        let key_a = PrivateKey::generate();
        let key_b = PrivateKey::generate();
        let pub_a = key_a.public_key();
        let pub_b = key_b.public_key();

        let (device_a, mut tun_a) =
            node(&key_a, "10.0.0.1/24", port, &[(&pub_b, "10.0.0.2/32", None)]);
        device_a.start().await.unwrap();

        let (device_b, mut tun_b) = node(
            &key_b,
            "10.0.0.2/24",
            0,
            &[(&pub_a, "10.0.0.1/24", Some(format!("127.0.0.1:{}", port)))],
        );
        device_b.start().await.unwrap();

        // Request: B's host pings A's address; the packet must surface on
        // A's TUN verbatim.
        let request = icmp_packet([10, 0, 0, 2], [10, 0, 0, 1]);
        tun_b.inject(request.clone()).await;
        let delivered = timeout(Duration::from_secs(5), tun_a.next_delivered())
            .await
            .expect("request did not arrive")
            .unwrap();
        assert_eq!(delivered, request);

        // Reply flows back over the connection the listener installed.
        let reply = icmp_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        tun_a.inject(reply.clone()).await;
        let delivered = timeout(Duration::from_secs(5), tun_b.next_delivered())
            .await
            .expect("reply did not arrive")
            .unwrap();
        assert_eq!(delivered, reply);

        device_b.close().await;
        device_a.close().await;
        assert_eq!(device_a.pool().outstanding(), 0);
        assert_eq!(device_b.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn classifier_sends_each_packet_to_exactly_one_destination() {
        let key = PrivateKey::generate();
        let peer_key = PrivateKey::generate().public_key();
        let (device, mut tun) = node(&key, "10.0.0.1/24", 0, &[(&peer_key, "10.0.0.2/32", None)]);
        device.start().await.unwrap();

        // Local destination: comes back out of the TUN.
        let local = icmp_packet([10, 0, 0, 2], [10, 0, 0, 1]);
        tun.inject(local.clone()).await;
        let delivered = timeout(Duration::from_secs(2), tun.next_delivered())
            .await
            .expect("local packet not delivered")
            .unwrap();
        assert_eq!(delivered, local);

        // Peer destination while the peer is down: dropped.
        tun.inject(icmp_packet([10, 0, 0, 1], [10, 0, 0, 2])).await;
        // Outside every allowed prefix: dropped.
        tun.inject(icmp_packet([10, 0, 0, 1], [192, 0, 2, 1])).await;
        // Multicast: dropped.
        tun.inject(icmp_packet([10, 0, 0, 1], [224, 0, 0, 1])).await;
        // Not IP at all: dropped.
        tun.inject(vec![0x00, 0x01, 0x02]).await;

        sleep(Duration::from_millis(200)).await;
        device.close().await;
        assert_eq!(device.pool().outstanding(), 0);
        // The flow table saw the local delivery and the routed attempt.
        assert!(device.flows().len() >= 1);
    }

    #[tokio::test]
    async fn bad_frame_tears_down_only_that_session() {
        let port = free_port().await;
        let key = PrivateKey::generate();
        let key_b = PrivateKey::generate();
        let key_c = PrivateKey::generate();
        let pub_b = key_b.public_key();
        let pub_c = key_c.public_key();

        let (device, _tun) = node(
            &key,
            "10.0.0.1/24",
            port,
            &[(&pub_b, "10.0.0.2/32", None), (&pub_c, "10.0.0.3/32", None)],
        );
        device.start().await.unwrap();

        // Connect as both peers and identify.
        let mut conn_b = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let mut record = Vec::new();
        record.extend_from_slice(&[10, 0, 0, 2]);
        record.extend_from_slice(pub_b.as_bytes());
        conn_b.write_all(&record).await.unwrap();

        let mut conn_c = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let mut record = Vec::new();
        record.extend_from_slice(&[10, 0, 0, 3]);
        record.extend_from_slice(pub_c.as_bytes());
        conn_c.write_all(&record).await.unwrap();

        sleep(Duration::from_millis(300)).await;
        assert!(device.peer(&pub_b).unwrap().is_connected());
        assert!(device.peer(&pub_c).unwrap().is_connected());

        // A frame claiming 65535 bytes kills B's session.
        conn_b.write_all(&[0xff, 0xff, 0x00, 0x00]).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        assert!(!device.peer(&pub_b).unwrap().is_connected());
        assert!(device.peer(&pub_c).unwrap().is_connected());

        device.close().await;
        assert_eq!(device.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn duplicate_peer_key_is_rejected() {
        let key = PrivateKey::generate();
        let peer_key = PrivateKey::generate().public_key();
        let doc = format!(
            "[Interface]\nPrivateKey = \"{}\"\nAddress = \"10.0.0.1/24\"\n\
             \n[[Peer]]\nPublicKey = \"{}\"\nAllowedIPs = \"10.0.0.2/32\"\n\
             \n[[Peer]]\nPublicKey = \"{}\"\nAllowedIPs = \"10.0.0.3/32\"\n",
            key.to_base64(),
            peer_key.to_base64(),
            peer_key.to_base64(),
        );
        let config = Config::from_toml(&doc).unwrap();
        let (tun, _handle) = MemoryTun::pair();
        assert!(Device::new(&config, Arc::new(tun)).is_err());
    }

    #[tokio::test]
    async fn ipv6_interface_address_is_rejected() {
        let key = PrivateKey::generate();
        let doc = format!(
            "[Interface]\nPrivateKey = \"{}\"\nAddress = \"fd00::1/64\"\n",
            key.to_base64(),
        );
        let config = Config::from_toml(&doc).unwrap();
        let (tun, _handle) = MemoryTun::pair();
        assert!(Device::new(&config, Arc::new(tun)).is_err());
    }
}
