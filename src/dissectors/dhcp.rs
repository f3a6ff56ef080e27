//! DHCPv4 (BOOTP) and DHCPv6 decoder.
//!
//! Besides per-flow option extraction this dissector maintains a
//! process-wide client-IP to MAC binding table (bound on ACK, released on
//! DECLINE/RELEASE) and links a REQUEST flow to the OFFER flow it answers by
//! probing the main flow table with a synthesized parent key.

use std::collections::HashMap;

use serde::Serialize;

use crate::AnalyzerError;
use crate::config::AnalyzerConfig;
use crate::dispatcher::Dissector;
use crate::flow::{FlowKey, FlowStatus, FlowTable};
use crate::output::{ColumnType, MonitoringState, OutputBuffer, PacketFile, Report, Schema, pct};
use crate::packet::PacketRecord;

const PLUGIN: &str = "dhcpDecode";

pub const DHCP_STAT_DET: u16 = 0x0001; // DHCP detected
pub const DHCP_STAT_REQUEST: u16 = 0x0002; // boot request opcode seen
pub const DHCP_STAT_REPLY: u16 = 0x0004; // boot reply opcode seen
pub const DHCP_STAT_BCAST: u16 = 0x0008; // broadcast flag
pub const DHCP_STAT_SECEL_ENDIAN: u16 = 0x0010; // little-endian seconds-elapsed
pub const DHCP_STAT_NON_ETH_HW: u16 = 0x0020; // hardware address is not a MAC
pub const DHCP_STAT_NM_TRUNC: u16 = 0x0040; // a bounded list overflowed
pub const DHCP_STAT_MAGIC_ERR: u16 = 0x0080; // bad option magic cookie
pub const DHCP_STAT_OPT_CORRUPT: u16 = 0x0100; // option field truncated or unterminated
pub const DHCP_STAT_OPT_OVERLOAD: u16 = 0x0200; // option overload (52)
pub const DHCP_STAT_MSGT_UNK: u16 = 0x0400; // unknown message type
pub const DHCP_STAT_CLID_MISMATCH: u16 = 0x0800; // client id differs from client MAC
pub const DHCP_STAT_INVALID_LEN: u16 = 0x1000; // DHCPv6 option length inconsistency
pub const DHCP_STAT_MALFORMED: u16 = 0x2000; // invalid opcode

pub const MSGT_DISCOVER: u8 = 1;
pub const MSGT_OFFER: u8 = 2;
pub const MSGT_REQUEST: u8 = 3;
pub const MSGT_DECLINE: u8 = 4;
pub const MSGT_ACK: u8 = 5;
pub const MSGT_NAK: u8 = 6;
pub const MSGT_RELEASE: u8 = 7;
pub const MSGT_INFORM: u8 = 8;

const NUM_MSGT_V4: usize = 18;
const NUM_MSGT_V6: usize = 23;
const MAGIC_COOKIE: u32 = 0x6353_8263; // network-order 99.130.83.99
const HDR_LEN: usize = 240; // BOOTP fixed header plus magic cookie
const OPT_END: u8 = 0xff;

#[derive(Debug, Clone, Default)]
struct Slot {
    stat: u16,
    hw_type: u64,
    hop_cnt: u32,
    msg_types: u32,
    opts: [u64; 3],
    opt_cnt: u16,
    hw_addrs: Vec<[u8; 6]>,
    host_names: Vec<String>,
    domain_names: Vec<String>,
    server_name: String,
    boot_file: String,
    message: String,
    max_sec_el: u16,
    lease_t: u32,
    renew_t: u32,
    rebind_t: u32,
    net_mask: [u8; 4],
    gateway: [u8; 4],
    dns: [u8; 4],
    cli_ip: [u8; 4],
    your_ip: [u8; 4],
    next_srv: [u8; 4],
    relay: [u8; 4],
    req_ip: [u8; 4],
    srv_id: [u8; 4],
    lflow: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DhcpRecord {
    pub stat: u16,
    pub msg_types: u32,
    pub hw_type: u64,
    pub hop_cnt: u32,
    pub hw_addrs: Vec<[u8; 6]>,
    pub server_name: String,
    pub boot_file: String,
    pub opt_cnt: u16,
    pub opts: [u64; 3],
    pub host_names: Vec<String>,
    pub domain_names: Vec<String>,
    pub max_sec_el: u16,
    pub lease_t: u32,
    pub renew_t: u32,
    pub rebind_t: u32,
    pub net_mask: [u8; 4],
    pub gateway: [u8; 4],
    pub dns: [u8; 4],
    pub cli_ip: [u8; 4],
    pub your_ip: [u8; 4],
    pub next_srv: [u8; 4],
    pub relay: [u8; 4],
    pub req_ip: [u8; 4],
    pub srv_id: [u8; 4],
    pub message: String,
    pub lflow: u64,
}

impl DhcpRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u16(self.stat);
        buf.append_u32(self.msg_types);
        buf.append_u64(self.hw_type);
        buf.append_u32(self.hop_cnt);
        buf.append_rep_count(self.hw_addrs.len() as u32);
        for mac in &self.hw_addrs {
            buf.append_mac(*mac);
        }
        buf.append_str(&self.server_name);
        buf.append_str(&self.boot_file);
        buf.append_u16(self.opt_cnt);
        buf.append_rep_count(self.opts.len() as u32);
        for bf in self.opts {
            buf.append_u64(bf);
        }
        buf.append_rep_count(self.host_names.len() as u32);
        for n in &self.host_names {
            buf.append_str(n);
        }
        buf.append_rep_count(self.domain_names.len() as u32);
        for n in &self.domain_names {
            buf.append_str(n);
        }
        buf.append_u16(self.max_sec_el);
        buf.append_u32(self.lease_t);
        buf.append_u32(self.renew_t);
        buf.append_u32(self.rebind_t);
        buf.append_ip4(self.net_mask);
        buf.append_ip4(self.gateway);
        buf.append_ip4(self.dns);
        buf.append_ip4(self.cli_ip);
        buf.append_ip4(self.your_ip);
        buf.append_ip4(self.next_srv);
        buf.append_ip4(self.relay);
        buf.append_ip4(self.req_ip);
        buf.append_ip4(self.srv_id);
        buf.append_str(&self.message);
        buf.append_u64(self.lflow);
    }
}

#[derive(Debug)]
pub struct DhcpDissector {
    slots: Vec<Slot>,
    nm_max: usize,
    table_size: usize,
    /// Client IP -> MAC, bound by ACK, released by DECLINE/RELEASE.
    mac_table: HashMap<[u8; 4], [u8; 6]>,
    table_full_warned: bool,
    agg_stat: u16,
    num_qr: [u64; 2],
    num_msgt_v4: [u64; NUM_MSGT_V4],
    num_msgt_v6: [u64; NUM_MSGT_V6],
    num_pkts_v4: u64,
    num_pkts_v6: u64,
}

impl DhcpDissector {
    pub fn new(cfg: &AnalyzerConfig) -> DhcpDissector {
        DhcpDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            nm_max: cfg.dhcp_nm_max,
            table_size: cfg.aux_table_size,
            mac_table: HashMap::new(),
            table_full_warned: false,
            agg_stat: 0,
            num_qr: [0; 2],
            num_msgt_v4: [0; NUM_MSGT_V4],
            num_msgt_v6: [0; NUM_MSGT_V6],
            num_pkts_v4: 0,
            num_pkts_v6: 0,
        }
    }

    pub fn reset_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
        }
    }

    pub fn on_layer4(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        table: &mut FlowTable,
        mut pkt_file: Option<&mut PacketFile>,
    ) {
        let Some(udp) = pkt.udp() else {
            if let Some(pf) = pkt_file.as_deref_mut() {
                pf.push_empty(2);
            }
            return;
        };
        let v4_ports = matches!((udp.sport, udp.dport), (67 | 68, 67 | 68));
        let v6_ports = matches!((udp.sport, udp.dport), (546 | 547, 546 | 547));
        if v4_ports && pkt.ipv4.is_some() {
            self.process_v4(pkt, idx, table, pkt_file);
        } else if v6_ports && pkt.ipv6.is_some() {
            self.process_v6(pkt, idx, pkt_file);
        } else if let Some(pf) = pkt_file.as_deref_mut() {
            pf.push_empty(2);
        }
    }

    fn process_v4(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        table: &mut FlowTable,
        mut pkt_file: Option<&mut PacketFile>,
    ) {
        let payload = pkt.l7_bytes();
        if payload.len() < HDR_LEN {
            self.pkt_row(&mut pkt_file, idx, 0);
            return;
        }
        if idx >= self.slots.len() {
            return;
        }
        self.num_pkts_v4 += 1;

        let opcode = payload[0];
        let (own_findex, own_key, has_opposite) = match table.get(idx) {
            Some(f) => (f.findex, f.key, f.opposite.is_some()),
            None => return,
        };

        // A reply without an opposite flow means the capture starts at the
        // server side: flip the direction so consumers see the reply as B.
        // Applied to unicast OFFERs as well.
        if !has_opposite
            && let Some(flow) = table.get_mut(idx)
        {
            if opcode == 2 {
                flow.status.set(FlowStatus::DIR_INVERT);
            } else if opcode == 1 {
                flow.status.clear_dir_invert();
            }
        }

        {
            let slot = &mut self.slots[idx];
            slot.stat |= DHCP_STAT_DET;
            match opcode {
                1 => {
                    slot.stat |= DHCP_STAT_REQUEST;
                    self.num_qr[0] += 1;
                }
                2 => {
                    slot.stat |= DHCP_STAT_REPLY;
                    self.num_qr[1] += 1;
                }
                _ => slot.stat |= DHCP_STAT_MALFORMED,
            }

            let hw_type = payload[1];
            slot.hw_type |= 1u64 << hw_type.min(63);
            let hops = payload[3];
            if hops <= 16 {
                slot.hop_cnt |= 1 << hops;
            } else {
                slot.hop_cnt |= 1 << 31;
            }

            if payload[10] & 0x80 != 0 {
                slot.stat |= DHCP_STAT_BCAST;
            }

            // Most Windows versions encode seconds-elapsed little-endian.
            let sec_be = u16::from_be_bytes([payload[8], payload[9]]);
            let sec_le = u16::from_le_bytes([payload[8], payload[9]]);
            let sec = if sec_be > sec_le {
                slot.stat |= DHCP_STAT_SECEL_ENDIAN;
                sec_le
            } else {
                sec_be
            };
            slot.max_sec_el = slot.max_sec_el.max(sec);

            slot.cli_ip.copy_from_slice(&payload[12..16]);
            slot.your_ip.copy_from_slice(&payload[16..20]);
            slot.next_srv.copy_from_slice(&payload[20..24]);
            slot.relay.copy_from_slice(&payload[24..28]);

            // Client hardware address, deduplicated.
            let hw_len = payload[2];
            if hw_type != 1 || hw_len != 6 {
                slot.stat |= DHCP_STAT_NON_ETH_HW;
            } else {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&payload[28..34]);
                Self::push_unique_mac(slot, mac, self.nm_max);
            }

            slot.server_name = super::bounded_str(&payload[44..108]);
            slot.boot_file = super::bounded_str(&payload[108..236]);
        }

        let magic = u32::from_le_bytes([payload[236], payload[237], payload[238], payload[239]]);
        if magic != MAGIC_COOKIE {
            self.slots[idx].stat |= DHCP_STAT_MAGIC_ERR;
            self.pkt_row(&mut pkt_file, idx, 0);
            return;
        }

        // Option field length from the UDP header, bounded by the snap.
        let udp_len = pkt.udp().map(|u| u.len as usize).unwrap_or(0);
        let opt_len = udp_len.saturating_sub(8 + HDR_LEN);
        if payload.len() < HDR_LEN + opt_len {
            self.slots[idx].stat |= DHCP_STAT_OPT_CORRUPT;
            self.pkt_row(&mut pkt_file, idx, 0);
            return;
        }

        let opts = &payload[HDR_LEN..HDR_LEN + opt_len];
        let mut msg_t: u8 = 0;
        let mut i = 0usize;
        while i < opts.len() && opts[i] != 0 && opts[i] != OPT_END {
            let code = opts[i];
            let Some(&olen) = opts.get(i + 1) else { break };
            let Some(val) = opts.get(i + 2..i + 2 + olen as usize) else { break };
            let slot = &mut self.slots[idx];
            match code {
                1 => copy4(&mut slot.net_mask, val),
                3 => copy4(&mut slot.gateway, val),
                6 => copy4(&mut slot.dns, val),
                12 => Self::push_unique_name(slot, val, self.nm_max, false),
                15 => Self::push_unique_name(slot, val, self.nm_max, true),
                50 => copy4(&mut slot.req_ip, val),
                51 => slot.lease_t = be32(val),
                52 => slot.stat |= DHCP_STAT_OPT_OVERLOAD,
                53 => {
                    msg_t = val.first().copied().unwrap_or(0);
                    if msg_t == 0 || msg_t as usize > NUM_MSGT_V4 {
                        slot.stat |= DHCP_STAT_MSGT_UNK;
                        msg_t = 0;
                    } else {
                        self.num_msgt_v4[msg_t as usize - 1] += 1;
                        slot.msg_types |= 1 << msg_t;
                    }
                }
                54 => copy4(&mut slot.srv_id, val),
                56 => slot.message = String::from_utf8_lossy(val).into_owned(),
                58 => slot.renew_t = be32(val),
                59 => slot.rebind_t = be32(val),
                61 => {
                    // Client identifier should repeat hw type plus MAC.
                    if let Some(&id_type) = val.first()
                        && id_type != 0
                        && id_type != 254
                        && (id_type != payload[1]
                            || val.get(1..) != payload.get(28..28 + olen as usize - 1))
                    {
                        slot.stat |= DHCP_STAT_CLID_MISMATCH;
                    }
                }
                _ => {}
            }
            let slot = &mut self.slots[idx];
            if code < 64 {
                slot.opts[2] |= 1u64 << (code & 0x3f);
            } else if code < 128 {
                slot.opts[1] |= 1u64 << ((code - 64) & 0x3f);
            } else {
                slot.opts[0] |= 1u64 << ((code - 128) & 0x3f);
            }
            slot.opt_cnt = slot.opt_cnt.saturating_add(1);
            i += olen as usize + 2;
        }
        if opt_len > 0 && opts.get(i) != Some(&OPT_END) {
            self.slots[idx].stat |= DHCP_STAT_OPT_CORRUPT;
        }

        match msg_t {
            MSGT_REQUEST => {
                // Link the REQUEST to the OFFER flow it answers: the parent
                // key is (server-id -> requested-IP) with swapped ports.
                let slot = &self.slots[idx];
                let parent = FlowKey {
                    vlan: own_key.vlan,
                    src: std::net::IpAddr::V4(slot.srv_id.into()),
                    dst: std::net::IpAddr::V4(slot.req_ip.into()),
                    src_port: own_key.dst_port,
                    dst_port: own_key.src_port,
                    proto: own_key.proto,
                    sctp: own_key.sctp,
                    eth: None,
                };
                if let Some(parent_idx) = table.find(&parent)
                    && let Some(parent_flow) = table.get(parent_idx)
                {
                    let parent_findex = parent_flow.findex;
                    if parent_idx != idx {
                        self.slots[idx].lflow = parent_findex;
                        self.slots[parent_idx].lflow = own_findex;
                    }
                }
            }
            MSGT_ACK => {
                let slot = &self.slots[idx];
                let ip = if slot.your_ip != [0; 4] { slot.your_ip } else { slot.cli_ip };
                let mac = slot.hw_addrs.first().copied();
                if let Some(mac) = mac {
                    if self.mac_table.len() >= self.table_size && !self.mac_table.contains_key(&ip)
                    {
                        if !self.table_full_warned {
                            log::warn!("[{PLUGIN}] IP/MAC table full, bindings no longer added");
                            self.table_full_warned = true;
                        }
                    } else {
                        self.mac_table.insert(ip, mac);
                    }
                }
            }
            MSGT_DECLINE | MSGT_RELEASE => {
                let slot = &self.slots[idx];
                let ip = if slot.your_ip != [0; 4] { slot.your_ip } else { slot.cli_ip };
                self.mac_table.remove(&ip);
            }
            _ => {}
        }

        self.pkt_row(&mut pkt_file, idx, msg_t);
    }

    fn process_v6(&mut self, pkt: &PacketRecord<'_>, idx: usize, mut pkt_file: Option<&mut PacketFile>) {
        let payload = pkt.l7_bytes();
        if payload.len() < 4 || idx >= self.slots.len() {
            self.pkt_row(&mut pkt_file, idx, 0);
            return;
        }
        self.num_pkts_v6 += 1;

        let msg_t = payload[0];
        {
            let slot = &mut self.slots[idx];
            slot.stat |= DHCP_STAT_DET;
            if msg_t > 0 && (msg_t as usize) <= NUM_MSGT_V6 {
                slot.msg_types |= 1 << msg_t.min(31);
                self.num_msgt_v6[msg_t as usize - 1] += 1;
            }
        }

        // Options: type16, len16 TLVs after the 4-byte header.
        let mut i = 4usize;
        while i + 4 <= payload.len() {
            let opt = u16::from_be_bytes([payload[i], payload[i + 1]]);
            let olen = u16::from_be_bytes([payload[i + 2], payload[i + 3]]) as usize;
            let Some(val) = payload.get(i + 4..i + 4 + olen) else {
                self.slots[idx].stat |= DHCP_STAT_INVALID_LEN;
                break;
            };
            let slot = &mut self.slots[idx];
            match opt {
                // Status Code
                13 => {
                    if olen < 2 {
                        slot.stat |= DHCP_STAT_INVALID_LEN;
                    } else {
                        slot.message = String::from_utf8_lossy(&val[2..]).into_owned();
                    }
                }
                // Client / Server Identifier: DUID types 1 and 3 carry a MAC.
                1 | 2 => {
                    if olen >= 4 {
                        let duid_type = u16::from_be_bytes([val[0], val[1]]);
                        if duid_type == 1 || duid_type == 3 {
                            let hw_type = u16::from_be_bytes([val[2], val[3]]);
                            slot.hw_type |= 1u64 << (hw_type.min(63) as u64);
                            let mac_off = if duid_type == 1 { 8 } else { 4 };
                            if hw_type != 1 {
                                slot.stat |= DHCP_STAT_NON_ETH_HW;
                            } else if let Some(raw) = val.get(mac_off..mac_off + 6) {
                                let mut mac = [0u8; 6];
                                mac.copy_from_slice(raw);
                                Self::push_unique_mac(slot, mac, self.nm_max);
                            }
                        }
                    }
                }
                // FQDN: length-prefixed labels joined with dots.
                39 => {
                    if olen < 2 {
                        slot.stat |= DHCP_STAT_INVALID_LEN;
                    } else {
                        let mut name = String::new();
                        let mut p = 1usize; // skip flags byte
                        while p < val.len() {
                            let llen = val[p] as usize;
                            if llen == 0 || p + 1 + llen > val.len() {
                                break;
                            }
                            if !name.is_empty() {
                                name.push('.');
                            }
                            name.push_str(&String::from_utf8_lossy(&val[p + 1..p + 1 + llen]));
                            p += 1 + llen;
                        }
                        if !name.is_empty() {
                            Self::push_unique_name(slot, name.as_bytes(), self.nm_max, true);
                        }
                    }
                }
                _ => {}
            }
            i += 4 + olen;
        }

        self.pkt_row(&mut pkt_file, idx, msg_t);
    }

    fn push_unique_mac(slot: &mut Slot, mac: [u8; 6], max: usize) {
        if slot.hw_addrs.iter().any(|m| *m == mac) {
            return;
        }
        if slot.hw_addrs.len() >= max {
            slot.stat |= DHCP_STAT_NM_TRUNC;
            return;
        }
        slot.hw_addrs.push(mac);
    }

    /// Deduplicate against stored names, tolerating an optional trailing NUL.
    fn push_unique_name(slot: &mut Slot, raw: &[u8], max: usize, domain: bool) {
        let trimmed = match raw.split_last() {
            Some((0, rest)) => rest,
            _ => raw,
        };
        let name = String::from_utf8_lossy(trimmed).into_owned();
        let list = if domain { &mut slot.domain_names } else { &mut slot.host_names };
        if list.iter().any(|n| *n == name) {
            return;
        }
        if list.len() >= max {
            slot.stat |= DHCP_STAT_NM_TRUNC;
            return;
        }
        list.push(name);
    }

    fn pkt_row(&self, pkt_file: &mut Option<&mut PacketFile>, idx: usize, msg_t: u8) {
        let Some(pf) = pkt_file else { return };
        let stat = self.slots.get(idx).map(|s| s.stat).unwrap_or(0);
        if stat == 0 {
            pf.push_empty(2);
            return;
        }
        pf.push(format!("0x{stat:04x}"));
        pf.push(if msg_t > 0 { msg_t.to_string() } else { String::new() });
    }

    pub fn on_flow_terminate(&mut self, idx: usize) -> DhcpRecord {
        let slot = self.slots.get(idx).cloned().unwrap_or_default();
        self.agg_stat |= slot.stat;
        DhcpRecord {
            stat: slot.stat,
            msg_types: slot.msg_types,
            hw_type: slot.hw_type,
            hop_cnt: slot.hop_cnt,
            hw_addrs: slot.hw_addrs,
            server_name: slot.server_name,
            boot_file: slot.boot_file,
            opt_cnt: slot.opt_cnt,
            opts: slot.opts,
            host_names: slot.host_names,
            domain_names: slot.domain_names,
            max_sec_el: slot.max_sec_el,
            lease_t: slot.lease_t,
            renew_t: slot.renew_t,
            rebind_t: slot.rebind_t,
            net_mask: slot.net_mask,
            gateway: slot.gateway,
            dns: slot.dns,
            cli_ip: slot.cli_ip,
            your_ip: slot.your_ip,
            next_srv: slot.next_srv,
            relay: slot.relay,
            req_ip: slot.req_ip,
            srv_id: slot.srv_id,
            message: slot.message,
            lflow: slot.lflow,
        }
    }

    pub fn mac_for_ip(&self, ip: [u8; 4]) -> Option<[u8; 6]> {
        self.mac_table.get(&ip).copied()
    }

    pub fn linked_flow(&self, idx: usize) -> u64 {
        self.slots.get(idx).map(|s| s.lflow).unwrap_or(0)
    }
}

fn copy4(dst: &mut [u8; 4], val: &[u8]) {
    if val.len() >= 4 {
        dst.copy_from_slice(&val[..4]);
    }
}

fn be32(val: &[u8]) -> u32 {
    match val.get(..4) {
        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

impl Dissector for DhcpDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("dhcpStat", ColumnType::H16, "DHCP status")
            .push("dhcpMType", ColumnType::H32, "DHCP message type bitfield")
            .push("dhcpHWType", ColumnType::U64, "DHCP hardware type bitfield")
            .push("dhcpHopCnt", ColumnType::H32, "DHCP hop count bitfield")
            .push(
                "dhcpCHWAdd",
                ColumnType::Rep(vec![ColumnType::Mac]),
                "DHCP client hardware addresses",
            )
            .push("dhcpSrvName", ColumnType::Str, "DHCP server host name")
            .push("dhcpBootFile", ColumnType::Str, "DHCP boot file name")
            .push("dhcpOptCnt", ColumnType::U16, "DHCP options count")
            .push("dhcpOptBF", ColumnType::Rep(vec![ColumnType::U64]), "DHCP option bitfields")
            .push("dhcpHosts", ColumnType::Rep(vec![ColumnType::Str]), "DHCP host names")
            .push("dhcpDomains", ColumnType::Rep(vec![ColumnType::Str]), "DHCP domain names")
            .push("dhcpMaxSecEl", ColumnType::U16, "DHCP maximum seconds elapsed")
            .push("dhcpLeaseT", ColumnType::U32, "DHCP lease time")
            .push("dhcpRenewT", ColumnType::U32, "DHCP renewal time")
            .push("dhcpRebindT", ColumnType::U32, "DHCP rebinding time")
            .push("dhcpNetmask", ColumnType::Ip4, "DHCP subnet mask")
            .push("dhcpGWIP", ColumnType::Ip4, "DHCP router address")
            .push("dhcpDNSIP", ColumnType::Ip4, "DHCP DNS address")
            .push("dhcpCliIP", ColumnType::Ip4, "DHCP client address")
            .push("dhcpYourIP", ColumnType::Ip4, "DHCP offered address")
            .push("dhcpNextSrvIP", ColumnType::Ip4, "DHCP next server address")
            .push("dhcpRelayIP", ColumnType::Ip4, "DHCP relay address")
            .push("dhcpReqIP", ColumnType::Ip4, "DHCP requested address")
            .push("dhcpSrvIdIP", ColumnType::Ip4, "DHCP server identifier")
            .push("dhcpMsg", ColumnType::Str, "DHCP message (option 56 / v6 status)")
            .push("dhcpLFlow", ColumnType::U64, "DHCP linked flow index");
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        if self.agg_stat != 0 {
            report.line(PLUGIN, &format!("Aggregated dhcpStat=0x{:04x}", self.agg_stat))?;
        }
        if self.num_pkts_v4 > 0 {
            report.line(
                PLUGIN,
                &format!(
                    "Number of DHCPv4 requests, replies: {}, {}",
                    self.num_qr[0], self.num_qr[1]
                ),
            )?;
            let names = [
                "DISCOVER", "OFFER", "REQUEST", "DECLINE", "ACK", "NAK", "RELEASE", "INFORM",
            ];
            for (i, name) in names.iter().enumerate() {
                if self.num_msgt_v4[i] > 0 {
                    report.line(
                        PLUGIN,
                        &format!(
                            "Number of DHCPv4 {} messages: {} [{:.2}%]",
                            name,
                            self.num_msgt_v4[i],
                            pct(self.num_msgt_v4[i], self.num_pkts_v4)
                        ),
                    )?;
                }
            }
        }
        if self.num_pkts_v6 > 0 {
            report.line(PLUGIN, &format!("Number of DHCPv6 packets: {}", self.num_pkts_v6))?;
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "dhcpStat\tdhcpPkts".into(),
            MonitoringState::Value => {
                format!("0x{:04x}\t{}", self.agg_stat, self.num_pkts_v4 + self.num_pkts_v6)
            }
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "dhcpStat", self.agg_stat as u64);
        crate::state::push_entry(out, "dhcpPkts4", self.num_pkts_v4);
        crate::state::push_entry(out, "dhcpPkts6", self.num_pkts_v6);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "dhcpStat") {
            self.agg_stat |= v as u16;
        }
        if let Some(v) = crate::state::lookup(blob, "dhcpPkts4") {
            self.num_pkts_v4 = v;
        }
        if let Some(v) = crate::state::lookup(blob, "dhcpPkts6") {
            self.num_pkts_v6 = v;
        }
    }
}

pub const DHCP_PKT_COLUMNS: [&str; 2] = ["dhcpStat", "dhcpMsgT"];

#[cfg(test)]
mod tests {
    #[test]
    fn bounded_str_never_overruns() {
        assert_eq!(crate::dissectors::bounded_str(b"host\0garbage"), "host");
        assert_eq!(crate::dissectors::bounded_str(b"nonul"), "nonul");
        assert_eq!(crate::dissectors::bounded_str(b""), "");
    }
}
