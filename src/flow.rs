//! Flow demultiplexing: keys, records and the aging table.
//!
//! A flow is one direction of a conversation. The table is queried with the
//! packet's key and its reverse; when only the reverse exists the new flow is
//! created as direction B and the two records cross-reference through
//! `opposite`. Aging order is an LRU list keyed by slot index, so the oldest
//! idle flow is always one peek away.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;

use crate::packet::{L3Kind, PacketRecord};
use crate::time::Timeval;

/// Flow status register. Bits are only ever OR'd in, with the single
/// documented exception of [`FlowStatus::DIR_INVERT`], which a protocol may
/// toggle (DHCP flips reply flows to direction B).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowStatus(pub u32);

impl FlowStatus {
    pub const IPV4: u32 = 0x0000_0001;
    pub const IPV6: u32 = 0x0000_0002;
    pub const L2_FLOW: u32 = 0x0000_0004; // keyed by Ethernet addresses
    pub const VLAN: u32 = 0x0000_0008;
    pub const FRAGMENT: u32 = 0x0000_0010;
    pub const SNAPPED: u32 = 0x0000_0020; // at least one truncated packet
    pub const TIMEJUMP: u32 = 0x0000_0040; // capture clock ran backwards
    /// Direction-invert: the flow's roles are swapped relative to arrival
    /// order. The only non-monotonic bit.
    pub const DIR_INVERT: u32 = 0x0000_0080;
    pub const NATURAL_END: u32 = 0x0000_0100; // TCP teardown / ICMP unreachable
    pub const FORCED_END: u32 = 0x0000_0200; // removed by a dissector or eviction

    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn clear_dir_invert(&mut self) {
        self.0 &= !Self::DIR_INVERT;
    }
}

/// Direction of a flow relative to its conversation: A initiated, B responded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowDir {
    A,
    B,
}

/// Immutable flow identity. A flow and its reverse share every field
/// pairwise-swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub vlan: u16,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    /// SCTP verification tag and stream id when the flow is SCTP.
    pub sctp: Option<(u32, u16)>,
    /// Ethernet addresses, present only for L2-keyed flows (ARP et al.).
    pub eth: Option<([u8; 6], [u8; 6])>,
}

impl FlowKey {
    pub fn reversed(&self) -> FlowKey {
        FlowKey {
            vlan: self.vlan,
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
            sctp: self.sctp,
            eth: self.eth.map(|(s, d)| (d, s)),
        }
    }

    /// Derive the key for a parsed packet. Returns `None` for frames the
    /// engine does not track (unknown ethertype without L2 flows enabled).
    pub fn from_packet(pkt: &PacketRecord<'_>, l2_flows: bool) -> Option<FlowKey> {
        let vlan = pkt.vlan_id();
        // SCTP common header carries the verification tag after the ports.
        let sctp = match pkt.l4 {
            Some(l4) if l4.proto == 132 => pkt.l4_bytes().get(4..8).map(|v| {
                (u32::from_be_bytes([v[0], v[1], v[2], v[3]]), 0u16)
            }),
            _ => None,
        };
        match pkt.l3_kind {
            L3Kind::Ipv4 => {
                let v4 = pkt.ipv4?;
                let (sp, dp) = pkt.ports();
                Some(FlowKey {
                    vlan,
                    src: IpAddr::V4(Ipv4Addr::from(v4.src)),
                    dst: IpAddr::V4(Ipv4Addr::from(v4.dst)),
                    src_port: sp,
                    dst_port: dp,
                    proto: v4.proto,
                    sctp,
                    eth: None,
                })
            }
            L3Kind::Ipv6 => {
                let v6 = pkt.ipv6?;
                let (sp, dp) = pkt.ports();
                Some(FlowKey {
                    vlan,
                    src: IpAddr::V6(Ipv6Addr::from(v6.src)),
                    dst: IpAddr::V6(Ipv6Addr::from(v6.dst)),
                    src_port: sp,
                    dst_port: dp,
                    proto: v6.proto,
                    sctp,
                    eth: None,
                })
            }
            L3Kind::Arp | L3Kind::Rarp | L3Kind::Other(_) if l2_flows => {
                let eth = pkt.eth?;
                Some(FlowKey {
                    vlan,
                    src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    src_port: 0,
                    dst_port: 0,
                    proto: 0,
                    sctp: None,
                    eth: Some((eth.src, eth.dst)),
                })
            }
            _ => None,
        }
    }
}

/// Per-flow metadata owned by the table.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRecord {
    pub findex: u64,
    pub key: FlowKey,
    pub first_seen: Timeval,
    pub last_seen: Timeval,
    pub dir: FlowDir,
    pub status: FlowStatus,
    pub opposite: Option<usize>,
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
    pub packets: u64,
}

impl FlowRecord {
    pub fn duration(&self) -> Timeval {
        self.last_seen.saturating_sub(self.first_seen)
    }
}

/// Outcome of demultiplexing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLookup {
    Existing(usize),
    Created(usize),
}

pub struct FlowTable {
    slots: Vec<Option<FlowRecord>>,
    free: Vec<usize>,
    lookup: HashMap<FlowKey, usize>,
    /// Aging order; least-recently-touched slot is the eviction candidate.
    order: LruCache<usize, ()>,
    next_findex: u64,
    timeout_secs: f64,
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("flows", &self.lookup.len())
            .field("capacity", &self.slots.len())
            .field("next_findex", &self.next_findex)
            .finish()
    }
}

impl FlowTable {
    pub fn new(capacity: usize, timeout_secs: f64) -> Option<FlowTable> {
        let cap = NonZeroUsize::new(capacity)?;
        Some(FlowTable {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            lookup: HashMap::with_capacity(capacity),
            order: LruCache::new(cap),
            next_findex: 1,
            timeout_secs,
        })
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&FlowRecord> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut FlowRecord> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    pub fn find(&self, key: &FlowKey) -> Option<usize> {
        self.lookup.get(key).copied()
    }

    /// Look the packet's key up, forward then reverse, creating a new flow
    /// when neither exists. Returns `None` when the table is full; the
    /// caller must make room first (`lru_victim` + `remove`).
    pub fn lookup_or_create(&mut self, key: FlowKey, ts: Timeval) -> Option<FlowLookup> {
        if let Some(&idx) = self.lookup.get(&key) {
            self.touch(idx, ts);
            return Some(FlowLookup::Existing(idx));
        }

        let reverse_idx = self.lookup.get(&key.reversed()).copied();
        let dir = if reverse_idx.is_some() { FlowDir::B } else { FlowDir::A };

        let idx = self.free.pop()?;
        let findex = self.next_findex;
        self.next_findex += 1;

        let mut status = FlowStatus::default();
        match key.src {
            IpAddr::V4(_) if key.eth.is_none() => status.set(FlowStatus::IPV4),
            IpAddr::V6(_) => status.set(FlowStatus::IPV6),
            _ => status.set(FlowStatus::L2_FLOW),
        }
        if key.vlan != 0 {
            status.set(FlowStatus::VLAN);
        }

        self.slots[idx] = Some(FlowRecord {
            findex,
            key,
            first_seen: ts,
            last_seen: ts,
            dir,
            status,
            opposite: reverse_idx,
            eth_src: [0; 6],
            eth_dst: [0; 6],
            packets: 0,
        });
        self.lookup.insert(key, idx);
        self.order.put(idx, ());

        if let Some(rev) = reverse_idx
            && let Some(Some(rec)) = self.slots.get_mut(rev)
        {
            rec.opposite = Some(idx);
        }

        Some(FlowLookup::Created(idx))
    }

    pub fn touch(&mut self, idx: usize, ts: Timeval) {
        if let Some(Some(rec)) = self.slots.get_mut(idx) {
            if ts > rec.last_seen {
                rec.last_seen = ts;
            }
            rec.packets += 1;
            self.order.put(idx, ());
        }
    }

    /// Oldest flow whose idle time exceeded the timeout, if any.
    pub fn oldest_expired(&mut self, now: Timeval) -> Option<usize> {
        let (&idx, _) = self.order.peek_lru()?;
        let rec = self.slots.get(idx)?.as_ref()?;
        if now.diff_secs(rec.last_seen) > self.timeout_secs {
            Some(idx)
        } else {
            None
        }
    }

    /// Eviction candidate when the table is full: the least recently
    /// touched flow.
    pub fn lru_victim(&mut self) -> Option<usize> {
        self.order.peek_lru().map(|(&idx, _)| idx)
    }

    /// Unlink a flow. The opposite flow, if alive, loses its back-reference;
    /// it stays in the table with its own lifetime.
    pub fn remove(&mut self, idx: usize) -> Option<FlowRecord> {
        let rec = self.slots.get_mut(idx)?.take()?;
        self.lookup.remove(&rec.key);
        self.order.pop(&idx);
        self.free.push(idx);
        if let Some(opp) = rec.opposite
            && let Some(Some(o)) = self.slots.get_mut(opp)
        {
            o.opposite = None;
        }
        Some(rec)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (usize, &FlowRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sp: u16, dp: u16) -> FlowKey {
        FlowKey {
            vlan: 0,
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: sp,
            dst_port: dp,
            proto: 6,
            sctp: None,
            eth: None,
        }
    }

    #[test]
    fn reverse_flow_links_opposites() {
        let mut t = FlowTable::new(8, 60.0).unwrap();
        let a = match t.lookup_or_create(key(1000, 80), Timeval::new(1, 0)).unwrap() {
            FlowLookup::Created(i) => i,
            _ => panic!("expected creation"),
        };
        let b = match t.lookup_or_create(key(1000, 80).reversed(), Timeval::new(1, 100)).unwrap() {
            FlowLookup::Created(i) => i,
            _ => panic!("expected creation"),
        };
        assert_eq!(t.get(a).unwrap().dir, FlowDir::A);
        assert_eq!(t.get(b).unwrap().dir, FlowDir::B);
        assert_eq!(t.get(a).unwrap().opposite, Some(b));
        assert_eq!(t.get(b).unwrap().opposite, Some(a));
        assert_eq!(t.get(a).unwrap().findex + 1, t.get(b).unwrap().findex);
    }

    #[test]
    fn aging_finds_oldest_idle_flow() {
        let mut t = FlowTable::new(8, 10.0).unwrap();
        t.lookup_or_create(key(1, 2), Timeval::new(0, 0));
        t.lookup_or_create(key(3, 4), Timeval::new(5, 0));
        assert_eq!(t.oldest_expired(Timeval::new(9, 0)), None);
        let idx = t.oldest_expired(Timeval::new(11, 0)).unwrap();
        assert_eq!(t.get(idx).unwrap().key.src_port, 1);
        t.remove(idx);
        assert_eq!(t.oldest_expired(Timeval::new(11, 0)), None);
    }

    #[test]
    fn removal_clears_opposite_backref() {
        let mut t = FlowTable::new(4, 60.0).unwrap();
        t.lookup_or_create(key(1, 2), Timeval::ZERO);
        t.lookup_or_create(key(1, 2).reversed(), Timeval::ZERO);
        t.remove(0);
        assert_eq!(t.get(1).unwrap().opposite, None);
        // Slot is reusable and gets a fresh findex.
        let again = t.lookup_or_create(key(9, 9), Timeval::ZERO);
        assert!(matches!(again, Some(FlowLookup::Created(_))));
    }

    #[test]
    fn full_table_nominates_lru_victim() {
        let mut t = FlowTable::new(2, 60.0).unwrap();
        t.lookup_or_create(key(1, 2), Timeval::new(0, 0));
        t.lookup_or_create(key(3, 4), Timeval::new(1, 0));
        assert!(t.is_full());
        let victim = t.lru_victim().unwrap();
        assert_eq!(t.get(victim).unwrap().key.src_port, 1);
    }
}
