//! ARP/RARP learner and spoofing detector.
//!
//! Learns IP-to-MAC bindings into a process-wide table (first binding wins;
//! a conflicting later MAC sets the spoof bit and is reported through the
//! flow's pair list instead of overwriting the table, so the evidence that
//! raised the alarm survives in the output).

use std::collections::HashMap;

use nom::number::complete::be_u16;
use serde::Serialize;

use crate::AnalyzerError;
use crate::config::AnalyzerConfig;
use crate::dispatcher::Dissector;
use crate::flow::FlowRecord;
use crate::output::{ColumnType, MonitoringState, OutputBuffer, PacketFile, Report, Schema};
use crate::packet::{L3Kind, PacketRecord};

const PLUGIN: &str = "arpDecode";

pub const ARP_STAT_DET: u8 = 0x01; // ARP detected
pub const ARP_STAT_GRAT: u8 = 0x02; // gratuitous ARP
pub const ARP_STAT_PROBE: u8 = 0x04; // ARP probe
pub const ARP_STAT_ANNOUNCE: u8 = 0x08; // ARP announcement
pub const ARP_STAT_FULL: u8 = 0x20; // MAC/IP list truncated
pub const ARP_STAT_SPOOF: u8 = 0x80; // same IP bound to different MACs

const OPCODE_REQ: u16 = 1;
const OPCODE_REP: u16 = 2;
const RARP_OPCODE_REP: u16 = 4;

/// Opcodes whose sender/target pairs feed the learning table.
const SUPPORTED_OPCODES: u16 = (1 << OPCODE_REQ) | (1 << OPCODE_REP) | (1 << RARP_OPCODE_REP);

#[derive(Debug, Clone, Copy)]
struct ArpWire {
    hw_type: u16,
    opcode: u16,
    hw_size: u8,
    proto_size: u8,
    src_mac: [u8; 6],
    src_ip: [u8; 4],
    dst_mac: [u8; 6],
    dst_ip: [u8; 4],
}

impl ArpWire {
    fn parse(data: &[u8]) -> Option<ArpWire> {
        if data.len() < 28 {
            return None;
        }
        let (_, hw_type) = be_u16::<_, nom::error::Error<&[u8]>>(data).ok()?;
        let mut w = ArpWire {
            hw_type,
            opcode: u16::from_be_bytes([data[6], data[7]]),
            hw_size: data[4],
            proto_size: data[5],
            src_mac: [0; 6],
            src_ip: [0; 4],
            dst_mac: [0; 6],
            dst_ip: [0; 4],
        };
        w.src_mac.copy_from_slice(&data[8..14]);
        w.src_ip.copy_from_slice(&data[14..18]);
        w.dst_mac.copy_from_slice(&data[18..24]);
        w.dst_ip.copy_from_slice(&data[24..28]);
        Some(w)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MacIpPair {
    pub mac: [u8; 6],
    pub ip: [u8; 4],
    pub count: u16,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    stat: u8,
    hw_type: u16,
    opcode: u16, // bit per opcode seen
    cnt: u16,    // pairs seen, may exceed the stored list
    pairs: Vec<MacIpPair>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArpRecord {
    pub stat: u8,
    pub hw_type: u16,
    pub opcode: u16,
    pub ip_mac_cnt: u16,
    pub pairs: Vec<MacIpPair>,
}

impl ArpRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u8(self.stat);
        buf.append_u16(self.hw_type);
        buf.append_u16(self.opcode);
        buf.append_u16(self.ip_mac_cnt);
        buf.append_rep_count(self.pairs.len() as u32);
        for p in &self.pairs {
            buf.append_mac(p.mac);
            buf.append_ip4(p.ip);
            buf.append_u16(p.count);
        }
    }
}

#[derive(Debug)]
pub struct ArpDissector {
    slots: Vec<Slot>,
    max_pairs: usize,
    table_size: usize,
    /// Process-wide IPv4 -> first learned MAC.
    mac_table: HashMap<[u8; 4], [u8; 6]>,
    table_full_warned: bool,
    arp_stat: u8, // aggregate of all flows
    arp_pkts: u64,
}

impl ArpDissector {
    pub fn new(cfg: &AnalyzerConfig) -> ArpDissector {
        ArpDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            max_pairs: cfg.arp_max_ip,
            table_size: cfg.aux_table_size,
            mac_table: HashMap::new(),
            table_full_warned: false,
            arp_stat: 0,
            arp_pkts: 0,
        }
    }

    pub fn reset_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
        }
    }

    pub fn on_new_flow(&mut self, pkt: &PacketRecord<'_>, idx: usize) {
        if !matches!(pkt.l3_kind, L3Kind::Arp | L3Kind::Rarp) {
            return;
        }
        let Some(arp) = ArpWire::parse(pkt.l7_bytes()) else { return };
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.stat |= ARP_STAT_DET;
            slot.hw_type = arp.hw_type;
        }
    }

    pub fn on_layer2(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        pkt_file: Option<&mut PacketFile>,
    ) {
        let detected = self.slots.get(idx).map(|s| s.stat != 0).unwrap_or(false);
        if !detected {
            if let Some(pf) = pkt_file {
                pf.push_empty(7);
            }
            return;
        }
        let Some(arp) = ArpWire::parse(pkt.l7_bytes()) else {
            if let Some(pf) = pkt_file {
                pf.push_empty(7);
            }
            return;
        };

        self.arp_pkts += 1;
        let opcode = arp.opcode;
        if let Some(slot) = self.slots.get_mut(idx)
            && opcode < 16
        {
            slot.opcode |= 1 << opcode;
        }

        let dst_mac_zero = arp.dst_mac == [0; 6];
        let dst_mac_bcast = arp.dst_mac == [0xff; 6];
        let src_ip_zero = arp.src_ip == [0; 4];

        if arp.src_ip == arp.dst_ip && (opcode == OPCODE_REQ || opcode == OPCODE_REP) {
            if let Some(slot) = self.slots.get_mut(idx) {
                slot.stat |= ARP_STAT_GRAT;
                if opcode == OPCODE_REQ && (dst_mac_zero || dst_mac_bcast) {
                    slot.stat |= ARP_STAT_ANNOUNCE;
                }
            }
        } else if opcode == OPCODE_REQ && dst_mac_zero && src_ip_zero
            && let Some(slot) = self.slots.get_mut(idx)
        {
            slot.stat |= ARP_STAT_PROBE;
        }

        if opcode < 16
            && (1u16 << opcode) & SUPPORTED_OPCODES != 0
            && arp.hw_size == 6
            && arp.proto_size == 4
        {
            // Requests carry one authoritative pair, replies two.
            let naddr = if opcode == OPCODE_REQ { 1 } else { 2 };
            let pairs = [(arp.src_mac, arp.src_ip), (arp.dst_mac, arp.dst_ip)];
            for &(mac, ip) in pairs.iter().take(naddr) {
                self.learn(idx, mac, ip);
            }
        }

        if let Some(pf) = pkt_file {
            let stat = self.slots.get(idx).map(|s| s.stat).unwrap_or(0);
            pf.push(format!("0x{stat:02x}"));
            pf.push(format!("{}", arp.hw_type));
            pf.push(format!("{opcode}"));
            pf.push(super::basic_stats::fmt_mac(&arp.src_mac));
            pf.push(format!("{}.{}.{}.{}", arp.src_ip[0], arp.src_ip[1], arp.src_ip[2], arp.src_ip[3]));
            pf.push(super::basic_stats::fmt_mac(&arp.dst_mac));
            pf.push(format!("{}.{}.{}.{}", arp.dst_ip[0], arp.dst_ip[1], arp.dst_ip[2], arp.dst_ip[3]));
        }
    }

    fn learn(&mut self, idx: usize, mac: [u8; 6], ip: [u8; 4]) {
        match self.mac_table.get(&ip).copied() {
            None => {
                if self.mac_table.len() >= self.table_size {
                    if !self.table_full_warned {
                        log::warn!("[{PLUGIN}] IP/MAC table full, new bindings are no longer learned");
                        self.table_full_warned = true;
                    }
                } else {
                    self.mac_table.insert(ip, mac);
                }
                self.append_pair(idx, mac, ip, true);
            }
            Some(prev) if prev == mac => {
                self.append_pair(idx, mac, ip, true);
            }
            Some(prev) => {
                // Conflict. 0.0.0.0 never spoofs (probes bind it freely),
                // and the table keeps the first binding.
                if ip != [0; 4]
                    && let Some(slot) = self.slots.get_mut(idx)
                {
                    slot.stat |= ARP_STAT_SPOOF;
                }
                self.append_pair(idx, mac, ip, true);
                self.append_conflict_pair(idx, prev, ip);
            }
        }
    }

    /// Count a (MAC, IP) sighting into the flow list, appending when new.
    fn append_pair(&mut self, idx: usize, mac: [u8; 6], ip: [u8; 4], count_it: bool) {
        let max_pairs = self.max_pairs;
        let Some(slot) = self.slots.get_mut(idx) else { return };
        if let Some(p) = slot.pairs.iter_mut().find(|p| p.mac == mac && p.ip == ip) {
            if count_it {
                p.count = p.count.saturating_add(1);
            }
            return;
        }
        if slot.pairs.len() >= max_pairs {
            slot.stat |= ARP_STAT_FULL;
            slot.cnt = slot.cnt.saturating_add(1);
            if self.arp_stat & ARP_STAT_FULL == 0 {
                log::warn!("[{PLUGIN}] MAC/IP list full, raise the pair bound");
                self.arp_stat |= ARP_STAT_FULL;
            }
            return;
        }
        slot.pairs.push(MacIpPair { mac, ip, count: u16::from(count_it) });
        slot.cnt = slot.cnt.saturating_add(1);
    }

    /// Report the previously bound MAC alongside the conflicting one,
    /// with a zero count: it was not seen in this flow.
    fn append_conflict_pair(&mut self, idx: usize, mac: [u8; 6], ip: [u8; 4]) {
        let Some(slot) = self.slots.get(idx) else { return };
        if slot.pairs.iter().any(|p| p.mac == mac && p.ip == ip) {
            return;
        }
        self.append_pair(idx, mac, ip, false);
    }

    pub fn on_flow_terminate(&mut self, idx: usize, _flow: &FlowRecord) -> ArpRecord {
        let slot = self.slots.get(idx).cloned().unwrap_or_default();
        self.arp_stat |= slot.stat;
        ArpRecord {
            stat: slot.stat,
            hw_type: slot.hw_type,
            opcode: slot.opcode,
            ip_mac_cnt: slot.cnt,
            pairs: slot.pairs,
        }
    }

    pub fn aggregate_stat(&self) -> u8 {
        self.arp_stat
    }
}

impl Dissector for ArpDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("arpStat", ColumnType::H8, "ARP status")
            .push("arpHwType", ColumnType::U16, "ARP hardware type")
            .push("arpOpcode", ColumnType::H16, "ARP opcode bitfield")
            .push("arpIpMacCnt", ColumnType::U16, "ARP number of distinct MAC/IP pairs")
            .push(
                "arpMac_Ip_Cnt",
                ColumnType::Rep(vec![ColumnType::Mac, ColumnType::Ip4, ColumnType::U16]),
                "ARP MAC/IP pairs and their appearance counts",
            );
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        if self.arp_stat != 0 {
            report.line(PLUGIN, &format!("Aggregated arpStat=0x{:02x}", self.arp_stat))?;
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "arpStat\tarpPkts".into(),
            MonitoringState::Value => format!("0x{:02x}\t{}", self.arp_stat, self.arp_pkts),
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "arpStat", self.arp_stat as u64);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "arpStat") {
            self.arp_stat |= v as u8;
        }
    }
}

pub const ARP_PKT_COLUMNS: [&str; 7] = [
    "arpStat",
    "arpHwType",
    "arpOpcode",
    "arpSenderMAC",
    "arpSenderIP",
    "arpTargetMAC",
    "arpTargetIP",
];
