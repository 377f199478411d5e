//! Per-flow connection metadata
//!
//! Observability only: a concurrent table keyed by (source, destination,
//! protocol) recording timestamps, packet/byte counters, and the TCP/UDP
//! ports seen on the flow. Forwarding decisions never read this.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::RwLock;

/// IPv4 header protocol field / IPv6 next-header.
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
}

#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowRecord {
    fn new(now: Instant) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            packets_in: 0,
            packets_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            src_port: 0,
            dst_port: 0,
        }
    }
}

/// Parsed view of one IP packet, enough to key and annotate a flow.
struct PacketInfo {
    key: FlowKey,
    len: u64,
    src_port: u16,
    dst_port: u16,
}

fn parse(packet: &[u8]) -> Option<PacketInfo> {
    if packet.is_empty() {
        return None;
    }
    let (src, dst, protocol, transport_offset) = match packet[0] >> 4 {
        4 => {
            if packet.len() < 20 {
                return None;
            }
            let ihl = usize::from(packet[0] & 0x0f) * 4;
            if ihl < 20 {
                return None;
            }
            let src: [u8; 4] = packet[12..16].try_into().ok()?;
            let dst: [u8; 4] = packet[16..20].try_into().ok()?;
            (IpAddr::from(src), IpAddr::from(dst), packet[9], ihl)
        }
        6 => {
            if packet.len() < 40 {
                return None;
            }
            let src: [u8; 16] = packet[8..24].try_into().ok()?;
            let dst: [u8; 16] = packet[24..40].try_into().ok()?;
            (IpAddr::from(src), IpAddr::from(dst), packet[6], 40)
        }
        _ => return None,
    };

    let (src_port, dst_port) = match protocol {
        PROTO_TCP | PROTO_UDP if packet.len() >= transport_offset + 4 => (
            u16::from_be_bytes([packet[transport_offset], packet[transport_offset + 1]]),
            u16::from_be_bytes([packet[transport_offset + 2], packet[transport_offset + 3]]),
        ),
        _ => (0, 0),
    };

    Some(PacketInfo {
        key: FlowKey { src, dst, protocol },
        len: packet.len() as u64,
        src_port,
        dst_port,
    })
}

/// Concurrent flow table.
pub struct FlowTable {
    flows: RwLock<HashMap<FlowKey, FlowRecord>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }

    fn record(&self, packet: &[u8], inbound: bool) {
        let Some(info) = parse(packet) else {
            return;
        };
        let now = Instant::now();
        let mut flows = self.flows.write();
        let record = flows
            .entry(info.key)
            .or_insert_with(|| FlowRecord::new(now));
        record.last_seen = now;
        if inbound {
            record.packets_in += 1;
            record.bytes_in += info.len;
        } else {
            record.packets_out += 1;
            record.bytes_out += info.len;
        }
        if info.src_port != 0 {
            record.src_port = info.src_port;
            record.dst_port = info.dst_port;
        }
    }

    /// Account a packet leaving through a peer.
    pub fn record_outbound(&self, packet: &[u8]) {
        self.record(packet, false);
    }

    /// Account a packet arriving from a peer.
    pub fn record_inbound(&self, packet: &[u8]) {
        self.record(packet, true);
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowRecord> {
        self.flows.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p[9] = PROTO_UDP;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p[20..22].copy_from_slice(&src_port.to_be_bytes());
        p[22..24].copy_from_slice(&dst_port.to_be_bytes());
        p
    }

    #[test]
    fn counts_both_directions_per_flow() {
        let table = FlowTable::new();
        let out = udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 5000, 53);
        table.record_outbound(&out);
        table.record_outbound(&out);
        table.record_inbound(&udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 5000, 53));

        let key = FlowKey {
            src: IpAddr::from([10, 0, 0, 1]),
            dst: IpAddr::from([10, 0, 0, 2]),
            protocol: PROTO_UDP,
        };
        let record = table.get(&key).unwrap();
        assert_eq!(record.packets_out, 2);
        assert_eq!(record.packets_in, 1);
        assert_eq!(record.bytes_out, 56);
        assert_eq!(record.src_port, 5000);
        assert_eq!(record.dst_port, 53);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn garbage_is_ignored() {
        let table = FlowTable::new();
        table.record_outbound(&[0x00, 0x01]);
        table.record_outbound(&[]);
        assert!(table.is_empty());
    }
}
