//! Packet record: an immutable view over one captured frame with layer
//! pointers resolved once at ingest.
//!
//! The capture collaborator hands the engine `(timestamp, wire length,
//! bytes)` tuples. VLAN unwinding, IPv4/IPv6 header and extension walking,
//! L4 classification and per-layer snap accounting all happen here. Parsing
//! never fails: a frame the parser cannot resolve keeps the layers it could
//! and flags the rest.

use nom::number::complete::{be_u16, be_u32};
use nom_derive::{Nom, Parse};
use serde::Serialize;

use crate::time::Timeval;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_RARP: u16 = 0x8035;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

// Packet-level status bits, folded into the owning flow's status.
pub const PKT_SNAP_L2: u16 = 0x0001; // Ethernet header truncated
pub const PKT_SNAP_L3: u16 = 0x0002; // L3 header truncated
pub const PKT_SNAP_L4: u16 = 0x0004; // L4 header truncated
pub const PKT_FRAG: u16 = 0x0008; // IP fragment
pub const PKT_FRAG_NOT_FIRST: u16 = 0x0010; // fragment with non-zero offset
pub const PKT_VLAN: u16 = 0x0020; // 802.1Q tag(s) present
pub const PKT_L3_UNKNOWN: u16 = 0x0040; // ethertype not dissected

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum L3Kind {
    Ipv4,
    Ipv6,
    Arp,
    Rarp,
    Other(u16),
    None,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EthInfo {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
    /// Innermost VLAN id when 802.1Q/Q-in-Q tags were unwound.
    pub vlan: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Ipv4Info {
    pub off: usize,
    pub hdr_len: usize,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    /// Raw fragment field in host order: flags in the top 3 bits,
    /// offset (8-byte units) in the low 13.
    pub frag: u16,
    pub ttl: u8,
    pub proto: u8,
    pub checksum: u16,
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4Info {
    pub fn more_frags(&self) -> bool {
        self.frag & 0x2000 != 0
    }

    pub fn dont_frag(&self) -> bool {
        self.frag & 0x4000 != 0
    }

    pub fn frag_offset(&self) -> u16 {
        self.frag & 0x1fff
    }

    pub fn is_fragment(&self) -> bool {
        self.more_frags() || self.frag_offset() != 0
    }

    pub fn is_first_fragment(&self) -> bool {
        self.frag_offset() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Ipv6Frag {
    pub more: bool,
    pub offset: u16,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Ipv6Info {
    pub off: usize,
    /// Fixed header plus every extension header walked.
    pub hdr_len: usize,
    pub tclass: u8,
    pub payload_len: u16,
    pub hop_limit: u8,
    /// Final next-header value after extension walking.
    pub proto: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub frag: Option<Ipv6Frag>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct L4Info {
    pub proto: u8,
    pub off: usize,
    pub hdr_len: usize,
}

/// TCP header, fixed part.
#[derive(Debug, Clone, Copy, Nom, Serialize)]
pub struct TcpWire {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub off_flags: u16,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpWire {
    pub fn header_len(&self) -> usize {
        ((self.off_flags >> 12) as usize & 0x0f) * 4
    }

    pub fn flags(&self) -> u8 {
        (self.off_flags & 0x00ff) as u8
    }
}

#[derive(Debug, Clone, Copy, Nom, Serialize)]
pub struct UdpWire {
    pub sport: u16,
    pub dport: u16,
    pub len: u16,
    pub checksum: u16,
}

/// One captured frame with pre-computed layer pointers.
#[derive(Debug)]
pub struct PacketRecord<'a> {
    pub ts: Timeval,
    pub wire_len: u32,
    pub data: &'a [u8],
    pub eth: Option<EthInfo>,
    pub l3_kind: L3Kind,
    pub l3_off: usize,
    pub ipv4: Option<Ipv4Info>,
    pub ipv6: Option<Ipv6Info>,
    pub l4: Option<L4Info>,
    pub l7_off: usize,
    /// On-wire L7 length derived from the L3 length fields, which may
    /// exceed what was captured.
    pub l7_len: u16,
    pub status: u16,
}

impl<'a> PacketRecord<'a> {
    /// Resolve layer pointers for one frame. Never fails; missing or
    /// truncated layers are flagged in `status`.
    pub fn parse(ts: Timeval, wire_len: u32, data: &'a [u8]) -> PacketRecord<'a> {
        let mut pkt = PacketRecord {
            ts,
            wire_len,
            data,
            eth: None,
            l3_kind: L3Kind::None,
            l3_off: 0,
            ipv4: None,
            ipv6: None,
            l4: None,
            l7_off: data.len(),
            l7_len: 0,
            status: 0,
        };

        if data.len() < 14 {
            pkt.status |= PKT_SNAP_L2;
            return pkt;
        }

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        src.copy_from_slice(&data[6..12]);
        let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
        let mut off = 14usize;
        let mut vlan = None;

        // Unwind up to two VLAN tags; the innermost id wins.
        for _ in 0..2 {
            if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
                break;
            }
            if data.len() < off + 4 {
                pkt.status |= PKT_SNAP_L2;
                pkt.eth = Some(EthInfo { dst, src, ethertype, vlan });
                return pkt;
            }
            vlan = Some(u16::from_be_bytes([data[off], data[off + 1]]) & 0x0fff);
            ethertype = u16::from_be_bytes([data[off + 2], data[off + 3]]);
            off += 4;
            pkt.status |= PKT_VLAN;
        }

        pkt.eth = Some(EthInfo { dst, src, ethertype, vlan });
        pkt.l3_off = off;

        match ethertype {
            ETHERTYPE_IPV4 => pkt.parse_ipv4(off),
            ETHERTYPE_IPV6 => pkt.parse_ipv6(off),
            ETHERTYPE_ARP => {
                pkt.l3_kind = L3Kind::Arp;
                pkt.l7_off = off;
                pkt.l7_len = (data.len() - off) as u16;
            }
            ETHERTYPE_RARP => {
                pkt.l3_kind = L3Kind::Rarp;
                pkt.l7_off = off;
                pkt.l7_len = (data.len() - off) as u16;
            }
            other => {
                pkt.l3_kind = L3Kind::Other(other);
                pkt.status |= PKT_L3_UNKNOWN;
            }
        }

        pkt
    }

    fn parse_ipv4(&mut self, off: usize) {
        self.l3_kind = L3Kind::Ipv4;
        let data = self.data;
        if data.len() < off + 20 {
            self.status |= PKT_SNAP_L3;
            return;
        }
        let hdr = &data[off..];
        let hdr_len = ((hdr[0] & 0x0f) as usize) * 4;
        if hdr[0] >> 4 != 4 || hdr_len < 20 {
            self.status |= PKT_SNAP_L3;
            return;
        }
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        src.copy_from_slice(&hdr[12..16]);
        dst.copy_from_slice(&hdr[16..20]);
        let info = Ipv4Info {
            off,
            hdr_len,
            tos: hdr[1],
            total_len: u16::from_be_bytes([hdr[2], hdr[3]]),
            id: u16::from_be_bytes([hdr[4], hdr[5]]),
            frag: u16::from_be_bytes([hdr[6], hdr[7]]),
            ttl: hdr[8],
            proto: hdr[9],
            checksum: u16::from_be_bytes([hdr[10], hdr[11]]),
            src,
            dst,
        };
        if data.len() < off + hdr_len {
            self.status |= PKT_SNAP_L3;
            self.ipv4 = Some(info);
            return;
        }
        if info.is_fragment() {
            self.status |= PKT_FRAG;
        }
        let l4_off = off + hdr_len;
        let l3_payload = (info.total_len as usize).saturating_sub(hdr_len);
        if info.is_first_fragment() {
            self.classify_l4(info.proto, l4_off, l3_payload);
        } else {
            // Non-first fragments carry no L4 header.
            self.status |= PKT_FRAG_NOT_FIRST;
            self.l7_off = l4_off;
            self.l7_len = l3_payload as u16;
        }
        self.ipv4 = Some(info);
    }

    fn parse_ipv6(&mut self, off: usize) {
        self.l3_kind = L3Kind::Ipv6;
        let data = self.data;
        if data.len() < off + 40 {
            self.status |= PKT_SNAP_L3;
            return;
        }
        let hdr = &data[off..];
        if hdr[0] >> 4 != 6 {
            self.status |= PKT_SNAP_L3;
            return;
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&hdr[8..24]);
        dst.copy_from_slice(&hdr[24..40]);
        let payload_len = u16::from_be_bytes([hdr[4], hdr[5]]);
        let mut next = hdr[6];
        let mut ext_off = off + 40;
        let mut frag = None;

        // Bounded extension-header walk.
        for _ in 0..8 {
            match next {
                // Hop-by-hop, routing, destination options.
                0 | 43 | 60 => {
                    if data.len() < ext_off + 8 {
                        self.status |= PKT_SNAP_L3;
                        return;
                    }
                    next = data[ext_off];
                    ext_off += (data[ext_off + 1] as usize + 1) * 8;
                }
                // Fragment header, fixed 8 bytes.
                44 => {
                    if data.len() < ext_off + 8 {
                        self.status |= PKT_SNAP_L3;
                        return;
                    }
                    let raw = u16::from_be_bytes([data[ext_off + 2], data[ext_off + 3]]);
                    frag = Some(Ipv6Frag {
                        more: raw & 0x0001 != 0,
                        offset: raw >> 3,
                        id: match be_u32::<_, nom::error::Error<&[u8]>>(&data[ext_off + 4..]) {
                            Ok((_, id)) => id,
                            Err(_) => 0,
                        },
                    });
                    next = data[ext_off];
                    ext_off += 8;
                    self.status |= PKT_FRAG;
                }
                _ => break,
            }
            if ext_off > data.len() {
                self.status |= PKT_SNAP_L3;
                return;
            }
        }

        let hdr_len = ext_off - off;
        let info = Ipv6Info {
            off,
            hdr_len,
            tclass: ((u16::from_be_bytes([hdr[0], hdr[1]]) >> 4) & 0xff) as u8,
            payload_len,
            hop_limit: hdr[7],
            proto: next,
            src,
            dst,
            frag,
        };
        let l3_payload = (payload_len as usize + 40).saturating_sub(hdr_len);
        match frag {
            Some(f) if f.offset != 0 => {
                self.status |= PKT_FRAG_NOT_FIRST;
                self.l7_off = ext_off;
                self.l7_len = l3_payload as u16;
            }
            _ => self.classify_l4(next, ext_off, l3_payload),
        }
        self.ipv6 = Some(info);
    }

    fn classify_l4(&mut self, proto: u8, l4_off: usize, l3_payload: usize) {
        let data = self.data;
        let hdr_len = match proto {
            6 => {
                if data.len() < l4_off + 20 {
                    self.status |= PKT_SNAP_L4;
                    self.l4 = Some(L4Info { proto, off: l4_off, hdr_len: 20 });
                    self.l7_off = data.len();
                    self.l7_len = l3_payload.saturating_sub(20) as u16;
                    return;
                }
                let doff = ((data[l4_off + 12] >> 4) as usize) * 4;
                doff.max(20)
            }
            17 | 136 => 8,
            1 | 2 | 58 => 8,
            132 => 12,
            _ => 0,
        };
        self.l4 = Some(L4Info { proto, off: l4_off, hdr_len });
        self.l7_off = l4_off + hdr_len;
        self.l7_len = l3_payload.saturating_sub(hdr_len) as u16;
        if data.len() < self.l7_off {
            self.status |= PKT_SNAP_L4;
        }
    }

    pub fn cap_len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_ipv6(&self) -> bool {
        self.l3_kind == L3Kind::Ipv6
    }

    pub fn l4_proto(&self) -> Option<u8> {
        self.l4.map(|l4| l4.proto)
    }

    /// Captured bytes of the L3 layer onward.
    pub fn snap_l3_len(&self) -> usize {
        self.data.len().saturating_sub(self.l3_off)
    }

    pub fn snap_l4_len(&self) -> usize {
        match self.l4 {
            Some(l4) => self.data.len().saturating_sub(l4.off),
            None => 0,
        }
    }

    /// Captured L7 bytes, bounded by both the snap and the wire length.
    pub fn snap_l7_len(&self) -> usize {
        self.data
            .len()
            .saturating_sub(self.l7_off)
            .min(self.l7_len as usize)
    }

    pub fn l3_bytes(&self) -> &'a [u8] {
        &self.data[self.l3_off.min(self.data.len())..]
    }

    pub fn l4_bytes(&self) -> &'a [u8] {
        match self.l4 {
            Some(l4) if l4.off <= self.data.len() => &self.data[l4.off..],
            _ => &[],
        }
    }

    pub fn l7_bytes(&self) -> &'a [u8] {
        let start = self.l7_off.min(self.data.len());
        let end = (start + self.snap_l7_len()).min(self.data.len());
        &self.data[start..end]
    }

    pub fn tcp(&self) -> Option<TcpWire> {
        let l4 = self.l4?;
        if l4.proto != 6 {
            return None;
        }
        let bytes = &self.data[l4.off.min(self.data.len())..];
        TcpWire::parse(bytes).ok().map(|(_, t)| t)
    }

    pub fn udp(&self) -> Option<UdpWire> {
        let l4 = self.l4?;
        if l4.proto != 17 && l4.proto != 136 {
            return None;
        }
        let bytes = &self.data[l4.off.min(self.data.len())..];
        UdpWire::parse(bytes).ok().map(|(_, u)| u)
    }

    /// Source and destination port, 0 for non-port protocols.
    pub fn ports(&self) -> (u16, u16) {
        let Some(l4) = self.l4 else { return (0, 0) };
        if !crate::protocol::is_port_based(l4.proto) {
            return (0, 0);
        }
        let bytes = &self.data[l4.off.min(self.data.len())..];
        match (
            be_u16::<_, nom::error::Error<&[u8]>>(bytes),
            bytes.get(2..4),
        ) {
            (Ok((_, sp)), Some(dp)) => (sp, u16::from_be_bytes([dp[0], dp[1]])),
            _ => (0, 0),
        }
    }

    pub fn ip_ttl(&self) -> Option<u8> {
        match (self.ipv4, self.ipv6) {
            (Some(v4), _) => Some(v4.ttl),
            (_, Some(v6)) => Some(v6.hop_limit),
            _ => None,
        }
    }

    pub fn vlan_id(&self) -> u16 {
        self.eth.and_then(|e| e.vlan).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2];
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn ipv4_packet(proto: u8, payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut p = vec![
            0x45, 0x00, (total >> 8) as u8, total as u8, 0x12, 0x34, 0x40, 0x00, 64, proto, 0, 0,
            10, 0, 0, 1, 10, 0, 0, 2,
        ];
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn resolves_udp_layers() {
        let udp = [0x13, 0x88, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef];
        let frame = eth_frame(ETHERTYPE_IPV4, &ipv4_packet(17, &udp));
        let pkt = PacketRecord::parse(Timeval::ZERO, frame.len() as u32, &frame);
        assert_eq!(pkt.l3_kind, L3Kind::Ipv4);
        assert_eq!(pkt.l4_proto(), Some(17));
        assert_eq!(pkt.ports(), (5000, 53));
        assert_eq!(pkt.l7_len, 4);
        assert_eq!(pkt.l7_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn vlan_tag_is_unwound() {
        let udp = [0x00, 0x07, 0x00, 0x08, 0x00, 0x08, 0x00, 0x00];
        let inner = ipv4_packet(17, &udp);
        let mut tagged = vec![0u8; 0];
        tagged.extend_from_slice(&[0x00, 0x2a]); // VLAN 42
        tagged.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        tagged.extend_from_slice(&inner);
        let frame = eth_frame(ETHERTYPE_VLAN, &tagged);
        let pkt = PacketRecord::parse(Timeval::ZERO, frame.len() as u32, &frame);
        assert_eq!(pkt.vlan_id(), 42);
        assert_eq!(pkt.l3_kind, L3Kind::Ipv4);
        assert!(pkt.status & PKT_VLAN != 0);
    }

    #[test]
    fn non_first_fragment_suppresses_l4() {
        let mut ip = ipv4_packet(6, &[0u8; 8]);
        ip[6] = 0x00;
        ip[7] = 0x08; // offset 8 * 8 bytes
        let frame = eth_frame(ETHERTYPE_IPV4, &ip);
        let pkt = PacketRecord::parse(Timeval::ZERO, frame.len() as u32, &frame);
        assert!(pkt.l4.is_none());
        assert!(pkt.status & PKT_FRAG_NOT_FIRST != 0);
        assert_eq!(pkt.l7_len, 8);
    }

    #[test]
    fn truncated_header_sets_snap_flag() {
        let frame = eth_frame(ETHERTYPE_IPV4, &[0x45, 0x00, 0x00]);
        let pkt = PacketRecord::parse(Timeval::ZERO, 60, &frame);
        assert!(pkt.status & PKT_SNAP_L3 != 0);
        assert!(pkt.ipv4.is_none());
    }

    #[test]
    fn arp_body_is_l7() {
        let frame = eth_frame(ETHERTYPE_ARP, &[0u8; 28]);
        let pkt = PacketRecord::parse(Timeval::ZERO, frame.len() as u32, &frame);
        assert_eq!(pkt.l3_kind, L3Kind::Arp);
        assert_eq!(pkt.l7_off, 14);
        assert_eq!(pkt.l7_len, 28);
    }
}
