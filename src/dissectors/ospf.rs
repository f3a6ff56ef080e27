//! OSPFv2/OSPFv3 decoder.
//!
//! Validates the common header (version, per-type minimum lengths, the
//! TTL=1 rule for the well-known multicast destinations), walks HELLO
//! neighbor lists, database descriptions and every LSA of an LS UPDATE with
//! strict bounds, and feeds per-packet rows into the hello/DBD/message side
//! files plus an end-of-run statistics file.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Serialize;

use crate::AnalyzerError;
use crate::config::AnalyzerConfig;
use crate::dispatcher::Dissector;
use crate::output::{ColumnType, FileManager, MonitoringState, OutputBuffer, Report, Schema, pct};
use crate::packet::PacketRecord;

const PLUGIN: &str = "ospfDecode";

pub const OSPF_STAT_DET: u8 = 0x01;
pub const OSPF_STAT_MALFORMED: u8 = 0x02;
pub const OSPF_STAT_WRNG_VER: u8 = 0x04;
pub const OSPF_STAT_BAD_TTL: u8 = 0x08;
pub const OSPF_STAT_BAD_DST: u8 = 0x10;
pub const OSPF_STAT_BAD_TYPE: u8 = 0x20;
pub const OSPF_STAT_NEIGH_FULL: u8 = 0x40;

pub const OSPF_HELLO: u8 = 1;
pub const OSPF_DB_DESCR: u8 = 2;
pub const OSPF_LS_REQ: u8 = 3;
pub const OSPF_LS_UPDATE: u8 = 4;
pub const OSPF_LS_ACK: u8 = 5;
const OSPF_TYPE_N: usize = 6;

pub const OSPF_AUTH_NULL: u16 = 0;
pub const OSPF_AUTH_PASSWD: u16 = 1;
pub const OSPF_AUTH_CRYPTO: u16 = 2;
const OSPF_AUTH_N: usize = 3;

const OSPF_LSTYPE_N: usize = 12;

const OSPF2_HDR_LEN: usize = 24;
const OSPF3_HDR_LEN: usize = 16;
const LSA_HDR_LEN: usize = 20;

const ALL_SPF_ROUTERS: [u8; 4] = [224, 0, 0, 5];
const ALL_D_ROUTERS: [u8; 4] = [224, 0, 0, 6];

#[derive(Debug, Clone, Default)]
struct Slot {
    stat: u8,
    version: u8,
    area: u32,
    router_id: [u8; 4],
    backup_rtr: [u8; 4],
    designated_rtr: [u8; 4],
    netmask: [u8; 4],
    types: u8,
    ls_types: u16,
    au_type: u16,
    au_pass: String,
    neighbors: Vec<[u8; 4]>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OspfRecord {
    pub stat: u8,
    pub version: u8,
    pub area: u32,
    pub router_id: [u8; 4],
    pub backup_rtr: [u8; 4],
    pub designated_rtr: [u8; 4],
    pub netmask: [u8; 4],
    pub types: u8,
    pub ls_types: u16,
    pub au_type: u16,
    pub au_pass: String,
    pub neighbors: Vec<[u8; 4]>,
}

impl OspfRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u8(self.stat);
        buf.append_u8(self.version);
        buf.append_u32(self.area);
        buf.append_ip4(self.router_id);
        buf.append_ip4(self.backup_rtr);
        buf.append_ip4(self.designated_rtr);
        buf.append_ip4(self.netmask);
        buf.append_u8(self.types);
        buf.append_u16(self.ls_types);
        buf.append_u16(self.au_type);
        buf.append_str(&self.au_pass);
        buf.append_rep_count(self.neighbors.len() as u32);
        for n in &self.neighbors {
            buf.append_ip4(*n);
        }
    }
}

#[derive(Debug)]
pub struct OspfDissector {
    slots: Vec<Slot>,
    neigh_max: usize,
    dir: Option<PathBuf>,
    agg_stat: u8,
    num_v2: [u64; OSPF_TYPE_N],
    num_v3: [u64; OSPF_TYPE_N],
    num_ls_type: [u64; OSPF_LSTYPE_N],
    num_au_type: [u64; OSPF_AUTH_N + 1],
    num_bad_ttl: u64,
    num_bad_dest: u64,
    num_bad_type: u64,
    num_mcast: u64,
}

impl OspfDissector {
    pub fn new(cfg: &AnalyzerConfig) -> OspfDissector {
        OspfDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            neigh_max: cfg.ospf_neigh_max,
            dir: cfg.ospf_dir.clone(),
            agg_stat: 0,
            num_v2: [0; OSPF_TYPE_N],
            num_v3: [0; OSPF_TYPE_N],
            num_ls_type: [0; OSPF_LSTYPE_N],
            num_au_type: [0; OSPF_AUTH_N + 1],
            num_bad_ttl: 0,
            num_bad_dest: 0,
            num_bad_type: 0,
            num_mcast: 0,
        }
    }

    pub fn reset_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
        }
    }

    pub fn on_new_flow(&mut self, pkt: &PacketRecord<'_>, idx: usize) {
        if pkt.l4_proto() == Some(crate::protocol::L3_OSPF)
            && let Some(slot) = self.slots.get_mut(idx)
        {
            slot.stat |= OSPF_STAT_DET;
        }
    }

    pub fn on_layer4(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        pkt_no: u64,
        files: &mut FileManager,
    ) {
        if idx >= self.slots.len() || self.slots[idx].stat == 0 {
            return;
        }
        let data = pkt.l4_bytes();
        if data.len() <= OSPF3_HDR_LEN {
            return;
        }

        let ver = data[0];
        self.slots[idx].version = ver;
        match ver {
            2 => self.num_v2[0] += 1,
            3 => self.num_v3[0] += 1,
            _ => {
                self.slots[idx].stat |= OSPF_STAT_WRNG_VER;
                return;
            }
        }

        let msg_type = data[1];
        if msg_type == 0 || msg_type as usize >= OSPF_TYPE_N {
            self.slots[idx].stat |= OSPF_STAT_BAD_TYPE;
            self.num_bad_type += 1;
            return;
        }
        if ver == 2 {
            self.num_v2[msg_type as usize] += 1;
        } else {
            self.num_v3[msg_type as usize] += 1;
        }
        if msg_type <= 5 {
            self.slots[idx].types |= 1 << msg_type;
        }

        // Multicast destinations require TTL 1.
        if let Some(v4) = pkt.ipv4
            && (v4.dst == ALL_SPF_ROUTERS || v4.dst == ALL_D_ROUTERS)
        {
            self.num_mcast += 1;
            if v4.ttl != 1 {
                self.slots[idx].stat |= OSPF_STAT_BAD_TTL;
                self.num_bad_ttl += 1;
            }
        }

        let pkt_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let mut router_id = [0u8; 4];
        router_id.copy_from_slice(&data[4..8]);
        let area = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        self.slots[idx].router_id = router_id;
        self.slots[idx].area = area;

        let hdr_len = if ver == 2 { OSPF2_HDR_LEN } else { OSPF3_HDR_LEN };
        if data.len() < hdr_len || pkt_len < hdr_len {
            self.slots[idx].stat |= OSPF_STAT_MALFORMED;
            return;
        }

        if ver == 2 {
            let au_type = u16::from_be_bytes([data[14], data[15]]);
            self.slots[idx].au_type |= 1 << au_type.min(15);
            let au_idx = (au_type as usize).min(OSPF_AUTH_N);
            self.num_au_type[au_idx] += 1;
            match au_type {
                OSPF_AUTH_NULL => {
                    if data[16..24].iter().any(|&b| b != 0) {
                        // Non-zero auth field under null auth: covert channel?
                        self.slots[idx].stat |= OSPF_STAT_MALFORMED;
                    }
                }
                OSPF_AUTH_PASSWD => {
                    self.slots[idx].au_pass = super::bounded_str(&data[16..24]);
                }
                _ => {}
            }
        }

        // Per-type minimum lengths against the declared packet length.
        let min_len = match msg_type {
            OSPF_HELLO => hdr_len + if ver == 2 { 20 } else { 16 },
            OSPF_DB_DESCR => hdr_len + 8,
            OSPF_LS_UPDATE => hdr_len + 4,
            _ => hdr_len,
        };
        if pkt_len < min_len {
            self.slots[idx].stat |= OSPF_STAT_MALFORMED;
            return;
        }

        // Never walk beyond the declared packet length or the snap.
        let body_end = pkt_len.min(data.len());
        let body = &data[hdr_len..body_end.max(hdr_len)];
        let src = pkt
            .ipv4
            .map(|v4| Ipv4Addr::from(v4.src).to_string())
            .or_else(|| pkt.ipv6.map(|v6| std::net::Ipv6Addr::from(v6.src).to_string()))
            .unwrap_or_default();

        match msg_type {
            OSPF_HELLO => self.hello(pkt, idx, ver, body, pkt_no, area, router_id, &src, files),
            OSPF_DB_DESCR => self.db_descr(idx, ver, body, pkt_no, area, router_id, files),
            OSPF_LS_REQ => {
                // Fixed 12-byte request entries.
                for entry in body.chunks_exact(12) {
                    let ls_type = entry[3];
                    self.note_ls_type(idx, ls_type as u16);
                    self.msg_row(
                        files,
                        ver,
                        &format!(
                            "{pkt_no}\t{ver}\t{area}\tLS_REQ\t{}\t{}\t{}",
                            ls_type,
                            Ipv4Addr::from([entry[4], entry[5], entry[6], entry[7]]),
                            Ipv4Addr::from([entry[8], entry[9], entry[10], entry[11]]),
                        ),
                    );
                }
            }
            OSPF_LS_UPDATE => self.ls_update(idx, ver, body, pkt_no, area, files),
            OSPF_LS_ACK => {
                // A sequence of bare LSA headers.
                for lsa in body.chunks_exact(LSA_HDR_LEN) {
                    let ls_type = if ver == 2 { lsa[3] as u16 } else { u16::from_be_bytes([lsa[2], lsa[3]]) };
                    self.note_ls_type(idx, ls_type);
                    self.msg_row(
                        files,
                        ver,
                        &format!(
                            "{pkt_no}\t{ver}\t{area}\tLS_ACK\t{}\t{}\t{}",
                            ls_type,
                            Ipv4Addr::from([lsa[4], lsa[5], lsa[6], lsa[7]]),
                            Ipv4Addr::from([lsa[8], lsa[9], lsa[10], lsa[11]]),
                        ),
                    );
                }
            }
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn hello(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        ver: u8,
        body: &[u8],
        pkt_no: u64,
        area: u32,
        router_id: [u8; 4],
        src: &str,
        files: &mut FileManager,
    ) {
        let fixed = if ver == 2 { 20 } else { 16 };
        if body.len() < fixed {
            self.slots[idx].stat |= OSPF_STAT_MALFORMED;
            return;
        }

        // Hellos must go to AllSPFRouters.
        if let Some(v4) = pkt.ipv4
            && v4.dst != ALL_SPF_ROUTERS
        {
            self.num_bad_dest += 1;
            self.slots[idx].stat |= OSPF_STAT_BAD_DST;
        }

        let (designated, backup, neigh_off) = if ver == 2 {
            self.slots[idx].netmask.copy_from_slice(&body[0..4]);
            (&body[12..16], &body[16..20], 20)
        } else {
            (&body[8..12], &body[12..16], 16)
        };
        self.slots[idx].designated_rtr.copy_from_slice(designated);
        self.slots[idx].backup_rtr.copy_from_slice(backup);

        let mut neighbors = String::new();
        for raw in body[neigh_off..].chunks_exact(4) {
            let mut n = [0u8; 4];
            n.copy_from_slice(raw);
            if !neighbors.is_empty() {
                neighbors.push(';');
            }
            neighbors.push_str(&Ipv4Addr::from(n).to_string());
            let slot = &mut self.slots[idx];
            if !slot.neighbors.contains(&n) {
                if slot.neighbors.len() >= self.neigh_max {
                    slot.stat |= OSPF_STAT_NEIGH_FULL;
                } else {
                    slot.neighbors.push(n);
                }
            }
        }

        if let Some(dir) = self.dir.clone() {
            let row = format!(
                "{pkt_no}\t{ver}\t{area}\t{}\t{src}\t{}\t{}\t{}\t{neighbors}",
                Ipv4Addr::from(router_id),
                Ipv4Addr::from(self.slots[idx].netmask),
                Ipv4Addr::from(self.slots[idx].designated_rtr),
                Ipv4Addr::from(self.slots[idx].backup_rtr),
            );
            let _ = files.append_line(&dir.join("ospfHello.txt"), &row);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn db_descr(
        &mut self,
        idx: usize,
        ver: u8,
        body: &[u8],
        pkt_no: u64,
        area: u32,
        router_id: [u8; 4],
        files: &mut FileManager,
    ) {
        let fixed = if ver == 2 { 8 } else { 12 };
        if body.len() < fixed {
            self.slots[idx].stat |= OSPF_STAT_MALFORMED;
            return;
        }
        let (flags, dd_seq) = if ver == 2 {
            (body[3], u32::from_be_bytes([body[4], body[5], body[6], body[7]]))
        } else {
            (body[7], u32::from_be_bytes([body[8], body[9], body[10], body[11]]))
        };
        // I without M, or I without MS, is an invalid triplet.
        if matches!(flags & 0x07, 4 | 5 | 6) {
            self.slots[idx].stat |= OSPF_STAT_MALFORMED;
        }

        if let Some(dir) = self.dir.clone() {
            let row = format!(
                "{pkt_no}\t{ver}\t{area}\t{}\t0x{flags:02x}\t{dd_seq}",
                Ipv4Addr::from(router_id)
            );
            let _ = files.append_line(&dir.join("ospfDBD.txt"), &row);
        }

        // Summarized database contents: a run of LSA headers.
        for lsa in body[fixed..].chunks_exact(LSA_HDR_LEN) {
            let ls_type = if ver == 2 { lsa[3] as u16 } else { u16::from_be_bytes([lsa[2], lsa[3]]) };
            self.note_ls_type(idx, ls_type);
        }
    }

    fn ls_update(
        &mut self,
        idx: usize,
        ver: u8,
        body: &[u8],
        pkt_no: u64,
        area: u32,
        files: &mut FileManager,
    ) {
        if body.len() < 4 {
            self.slots[idx].stat |= OSPF_STAT_MALFORMED;
            return;
        }
        let num_lsa = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let mut off = 4usize;

        for _ in 0..num_lsa {
            let Some(hdr) = body.get(off..off + LSA_HDR_LEN) else {
                self.slots[idx].stat |= OSPF_STAT_MALFORMED;
                return;
            };
            let ls_type = if ver == 2 { hdr[3] as u16 } else { u16::from_be_bytes([hdr[2], hdr[3]]) };
            let ls_len = u16::from_be_bytes([hdr[18], hdr[19]]) as usize;
            let ls_id = Ipv4Addr::from([hdr[4], hdr[5], hdr[6], hdr[7]]);
            let adv_rtr = Ipv4Addr::from([hdr[8], hdr[9], hdr[10], hdr[11]]);
            self.note_ls_type(idx, ls_type);

            if ls_len < LSA_HDR_LEN || off + ls_len > body.len() {
                self.slots[idx].stat |= OSPF_STAT_MALFORMED;
                return;
            }
            let lsa_body = &body[off + LSA_HDR_LEN..off + ls_len];
            // v3 LS types carry flooding-scope bits above the function code.
            let code = if ver == 2 { ls_type } else { ls_type & 0x1fff };
            // The per-type body layouts differ between OSPFv2 and OSPFv3,
            // so dispatch is on (version, function code).
            match (ver, code) {
                // v2 Router-LSA: flags, zero, link count, 12-byte links.
                (2, 1) => {
                    if lsa_body.len() >= 4 {
                        for link in lsa_body[4..].chunks_exact(12) {
                            let link_type = link[8];
                            let metric = u16::from_be_bytes([link[10], link[11]]);
                            self.msg_row(
                                files,
                                ver,
                                &format!(
                                    "{pkt_no}\t{ver}\t{area}\tROUTER\t{ls_id}\t{adv_rtr}\t{}\t{}\t{}\t{metric}",
                                    Ipv4Addr::from([link[0], link[1], link[2], link[3]]),
                                    Ipv4Addr::from([link[4], link[5], link[6], link[7]]),
                                    link_type,
                                ),
                            );
                        }
                    }
                }
                // v3 Router-LSA: flags and options word, then 16-byte
                // interface entries (type, metric, interface ids, neighbor).
                (3, 1) => {
                    if lsa_body.len() >= 4 {
                        for link in lsa_body[4..].chunks_exact(16) {
                            let link_type = link[0];
                            let metric = u16::from_be_bytes([link[2], link[3]]);
                            let int_id =
                                u32::from_be_bytes([link[4], link[5], link[6], link[7]]);
                            let neigh_int_id =
                                u32::from_be_bytes([link[8], link[9], link[10], link[11]]);
                            self.msg_row(
                                files,
                                ver,
                                &format!(
                                    "{pkt_no}\t{ver}\t{area}\tROUTER\t{ls_id}\t{adv_rtr}\t{int_id}\t{neigh_int_id}\t{}\t{link_type}\t{metric}",
                                    Ipv4Addr::from([link[12], link[13], link[14], link[15]]),
                                ),
                            );
                        }
                    }
                }
                // v2 Network-LSA: netmask plus attached routers.
                (2, 2) => {
                    if lsa_body.len() >= 4 {
                        let mask = Ipv4Addr::from([lsa_body[0], lsa_body[1], lsa_body[2], lsa_body[3]]);
                        for rtr in lsa_body[4..].chunks_exact(4) {
                            self.msg_row(
                                files,
                                ver,
                                &format!(
                                    "{pkt_no}\t{ver}\t{area}\tNETWORK\t{ls_id}\t{adv_rtr}\t{mask}\t{}",
                                    Ipv4Addr::from([rtr[0], rtr[1], rtr[2], rtr[3]]),
                                ),
                            );
                        }
                    }
                }
                // v3 Network-LSA has no netmask: an options word, then the
                // attached router ids.
                (3, 2) => {
                    if lsa_body.len() >= 4 {
                        let opts = u32::from_be_bytes([
                            0, lsa_body[1], lsa_body[2], lsa_body[3],
                        ]);
                        for rtr in lsa_body[4..].chunks_exact(4) {
                            self.msg_row(
                                files,
                                ver,
                                &format!(
                                    "{pkt_no}\t{ver}\t{area}\tNETWORK\t{ls_id}\t{adv_rtr}\t0x{opts:06x}\t{}",
                                    Ipv4Addr::from([rtr[0], rtr[1], rtr[2], rtr[3]]),
                                ),
                            );
                        }
                    }
                }
                // v2 Summary-LSA (IP network or ASBR): netmask, TOS metric.
                (2, 3) | (2, 4) => {
                    if lsa_body.len() >= 8 {
                        let mask = Ipv4Addr::from([lsa_body[0], lsa_body[1], lsa_body[2], lsa_body[3]]);
                        let metric =
                            u32::from_be_bytes([0, lsa_body[5], lsa_body[6], lsa_body[7]]);
                        self.msg_row(
                            files,
                            ver,
                            &format!(
                                "{pkt_no}\t{ver}\t{area}\tSUMMARY\t{ls_id}\t{adv_rtr}\t{mask}\t{metric}"
                            ),
                        );
                    }
                }
                // v3 Inter-Area-Prefix-LSA: metric, then one address prefix.
                (3, 3) => {
                    if lsa_body.len() >= 12 {
                        let metric =
                            u32::from_be_bytes([0, lsa_body[1], lsa_body[2], lsa_body[3]]);
                        let pref_len = lsa_body[4];
                        let pref_opt = lsa_body[5];
                        let prefix = Ipv4Addr::from([
                            lsa_body[8], lsa_body[9], lsa_body[10], lsa_body[11],
                        ]);
                        self.msg_row(
                            files,
                            ver,
                            &format!(
                                "{pkt_no}\t{ver}\t{area}\tINTER_AREA_PREFIX\t{ls_id}\t{adv_rtr}\t{prefix}/{pref_len}\t0x{pref_opt:02x}\t{metric}"
                            ),
                        );
                    }
                }
                // v3 Inter-Area-Router-LSA: options, metric, destination
                // router id. No netmask in this body.
                (3, 4) => {
                    if lsa_body.len() >= 12 {
                        let opts = u32::from_be_bytes([
                            0, lsa_body[1], lsa_body[2], lsa_body[3],
                        ]);
                        let metric =
                            u32::from_be_bytes([0, lsa_body[5], lsa_body[6], lsa_body[7]]);
                        let dest_rtr = Ipv4Addr::from([
                            lsa_body[8], lsa_body[9], lsa_body[10], lsa_body[11],
                        ]);
                        self.msg_row(
                            files,
                            ver,
                            &format!(
                                "{pkt_no}\t{ver}\t{area}\tINTER_AREA_ROUTER\t{ls_id}\t{adv_rtr}\t{dest_rtr}\t0x{opts:06x}\t{metric}"
                            ),
                        );
                    }
                }
                // v2 AS-External and NSSA LSAs.
                (2, 5) | (2, 7) => {
                    if lsa_body.len() >= 16 {
                        let mask = Ipv4Addr::from([lsa_body[0], lsa_body[1], lsa_body[2], lsa_body[3]]);
                        let e_bit = lsa_body[4] >> 7;
                        let metric =
                            u32::from_be_bytes([0, lsa_body[5], lsa_body[6], lsa_body[7]]);
                        let fwd =
                            Ipv4Addr::from([lsa_body[8], lsa_body[9], lsa_body[10], lsa_body[11]]);
                        self.msg_row(
                            files,
                            ver,
                            &format!(
                                "{pkt_no}\t{ver}\t{area}\tEXTERNAL\t{ls_id}\t{adv_rtr}\t{mask}\tE{e_bit}\t{metric}\t{fwd}"
                            ),
                        );
                    }
                }
                // v3 AS-External and NSSA LSAs: flags and metric in one
                // word, then an address prefix.
                (3, 5) | (3, 7) => {
                    if lsa_body.len() >= 12 {
                        let e_bit = (lsa_body[0] >> 2) & 1;
                        let metric =
                            u32::from_be_bytes([0, lsa_body[1], lsa_body[2], lsa_body[3]]);
                        let pref_len = lsa_body[4];
                        let pref_opt = lsa_body[5];
                        let prefix = Ipv4Addr::from([
                            lsa_body[8], lsa_body[9], lsa_body[10], lsa_body[11],
                        ]);
                        self.msg_row(
                            files,
                            ver,
                            &format!(
                                "{pkt_no}\t{ver}\t{area}\tEXTERNAL\t{ls_id}\t{adv_rtr}\t{prefix}/{pref_len}\t0x{pref_opt:02x}\tE{e_bit}\t{metric}"
                            ),
                        );
                    }
                }
                // v3 Link-LSA: router priority and options, the link-local
                // address, then one row per listed prefix.
                (3, 8) => {
                    if lsa_body.len() >= 24 {
                        let prio = lsa_body[0];
                        let opts = u32::from_be_bytes([
                            0, lsa_body[1], lsa_body[2], lsa_body[3],
                        ]);
                        let mut ll = [0u8; 16];
                        ll.copy_from_slice(&lsa_body[4..20]);
                        let ll_addr = std::net::Ipv6Addr::from(ll);
                        let num_pref =
                            u32::from_be_bytes([
                                lsa_body[20], lsa_body[21], lsa_body[22], lsa_body[23],
                            ]) as usize;
                        for pref in lsa_body[24..].chunks_exact(8).take(num_pref) {
                            let pref_len = pref[0];
                            let pref_opt = pref[1];
                            let prefix =
                                Ipv4Addr::from([pref[4], pref[5], pref[6], pref[7]]);
                            self.msg_row(
                                files,
                                ver,
                                &format!(
                                    "{pkt_no}\t{ver}\t{area}\tLINK\t{ls_id}\t{adv_rtr}\t{prio}\t0x{opts:06x}\t{ll_addr}\t{prefix}/{pref_len}\t0x{pref_opt:02x}"
                                ),
                            );
                        }
                    }
                }
                // v3 Intra-Area-Prefix-LSA: referenced LSA header fields,
                // then one row per listed prefix.
                (3, 9) => {
                    if lsa_body.len() >= 12 {
                        let num_pref =
                            u16::from_be_bytes([lsa_body[0], lsa_body[1]]) as usize;
                        let ref_ls_type =
                            u16::from_be_bytes([lsa_body[2], lsa_body[3]]);
                        let ref_ls_id = Ipv4Addr::from([
                            lsa_body[4], lsa_body[5], lsa_body[6], lsa_body[7],
                        ]);
                        let ref_adv_rtr = Ipv4Addr::from([
                            lsa_body[8], lsa_body[9], lsa_body[10], lsa_body[11],
                        ]);
                        for pref in lsa_body[12..].chunks_exact(8).take(num_pref) {
                            let pref_len = pref[0];
                            let pref_opt = pref[1];
                            let metric = u16::from_be_bytes([pref[2], pref[3]]);
                            let prefix =
                                Ipv4Addr::from([pref[4], pref[5], pref[6], pref[7]]);
                            self.msg_row(
                                files,
                                ver,
                                &format!(
                                    "{pkt_no}\t{ver}\t{area}\tINTRA_AREA_PREFIX\t{ls_id}\t{adv_rtr}\t0x{ref_ls_type:04x}\t{ref_ls_id}\t{ref_adv_rtr}\t{prefix}/{pref_len}\t0x{pref_opt:02x}\t{metric}"
                                ),
                            );
                        }
                    }
                }
                _ => {}
            }
            off += ls_len;
        }
    }

    fn note_ls_type(&mut self, idx: usize, ls_type: u16) {
        let code = (ls_type & 0x1fff).min(15);
        self.slots[idx].ls_types |= 1 << code;
        let tally = (code as usize).min(OSPF_LSTYPE_N - 1);
        self.num_ls_type[tally] += 1;
    }

    fn msg_row(&self, files: &mut FileManager, ver: u8, row: &str) {
        if let Some(dir) = &self.dir {
            let name = if ver == 2 { "ospf2Msg.txt" } else { "ospf3Msg.txt" };
            let _ = files.append_line(&dir.join(name), row);
        }
    }

    pub fn on_flow_terminate(&mut self, idx: usize) -> OspfRecord {
        let slot = self.slots.get(idx).cloned().unwrap_or_default();
        self.agg_stat |= slot.stat;
        OspfRecord {
            stat: slot.stat,
            version: slot.version,
            area: slot.area,
            router_id: slot.router_id,
            backup_rtr: slot.backup_rtr,
            designated_rtr: slot.designated_rtr,
            netmask: slot.netmask,
            types: slot.types,
            ls_types: slot.ls_types,
            au_type: slot.au_type,
            au_pass: slot.au_pass,
            neighbors: slot.neighbors,
        }
    }

    /// Write the end-of-capture statistics file.
    pub fn finalize(&mut self, files: &mut FileManager) {
        let Some(dir) = self.dir.clone() else { return };
        let path = dir.join("ospfStats.txt");
        let type_names = ["total", "HELLO", "DB_DESCR", "LS_REQ", "LS_UPDATE", "LS_ACK"];
        for (i, name) in type_names.iter().enumerate() {
            if self.num_v2[i] > 0 {
                let _ = files.append_line(&path, &format!("OSPFv2\t{name}\t{}", self.num_v2[i]));
            }
            if self.num_v3[i] > 0 {
                let _ = files.append_line(&path, &format!("OSPFv3\t{name}\t{}", self.num_v3[i]));
            }
        }
        for (i, n) in self.num_ls_type.iter().enumerate() {
            if *n > 0 {
                let _ = files.append_line(&path, &format!("LSType\t{i}\t{n}"));
            }
        }
        let upd = self.num_v2[OSPF_LS_UPDATE as usize] + self.num_v3[OSPF_LS_UPDATE as usize];
        let req = self.num_v2[OSPF_LS_REQ as usize] + self.num_v3[OSPF_LS_REQ as usize];
        let ack = self.num_v2[OSPF_LS_ACK as usize] + self.num_v3[OSPF_LS_ACK as usize];
        if upd > 0 {
            let _ = files.append_line(
                &path,
                &format!("LSReq/LSUpdate\t{:.4}", req as f64 / upd as f64),
            );
            let _ = files.append_line(
                &path,
                &format!("LSUpdate/LSAck\t{:.4}", if ack > 0 { upd as f64 / ack as f64 } else { 0.0 }),
            );
        }
    }
}

impl Dissector for OspfDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("ospfStat", ColumnType::H8, "OSPF status")
            .push("ospfVersion", ColumnType::U8, "OSPF version")
            .push("ospfArea", ColumnType::U32, "OSPF area id")
            .push("ospfRouterID", ColumnType::Ip4, "OSPF router id")
            .push("ospfBackupRtr", ColumnType::Ip4, "OSPF backup designated router")
            .push("ospfDesignatedRtr", ColumnType::Ip4, "OSPF designated router")
            .push("ospfNetmask", ColumnType::Ip4, "OSPF interface netmask")
            .push("ospfType", ColumnType::H8, "OSPF message type bitfield")
            .push("ospfLSType", ColumnType::H16, "OSPF LS type bitfield")
            .push("ospfAuType", ColumnType::H16, "OSPF authentication type bitfield")
            .push("ospfAuPass", ColumnType::Str, "OSPF cleartext password")
            .push(
                "ospfNeighbors",
                ColumnType::Rep(vec![ColumnType::Ip4]),
                "OSPF neighbors seen in hello messages",
            );
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        if self.agg_stat != 0 {
            report.line(PLUGIN, &format!("Aggregated ospfStat=0x{:02x}", self.agg_stat))?;
        }
        let total2 = self.num_v2[0];
        let total3 = self.num_v3[0];
        if total2 > 0 {
            report.line(PLUGIN, &format!("Number of OSPFv2 packets: {total2}"))?;
            let names = ["", "HELLO", "DB_DESCR", "LS_REQ", "LS_UPDATE", "LS_ACK"];
            for i in 1..OSPF_TYPE_N {
                if self.num_v2[i] > 0 {
                    report.line(
                        PLUGIN,
                        &format!(
                            "Number of OSPFv2 {} messages: {} [{:.2}%]",
                            names[i],
                            self.num_v2[i],
                            pct(self.num_v2[i], total2)
                        ),
                    )?;
                }
            }
        }
        if total3 > 0 {
            report.line(PLUGIN, &format!("Number of OSPFv3 packets: {total3}"))?;
        }
        if self.num_bad_ttl > 0 {
            report.line(
                PLUGIN,
                &format!(
                    "Number of multicast packets with invalid TTL: {} / {}",
                    self.num_bad_ttl, self.num_mcast
                ),
            )?;
        }
        if self.num_bad_dest > 0 {
            report.line(PLUGIN, &format!("Number of hellos to a bad destination: {}", self.num_bad_dest))?;
        }
        if self.num_bad_type > 0 {
            report.line(PLUGIN, &format!("Number of invalid message types: {}", self.num_bad_type))?;
        }
        let auth_names = ["null", "password", "cryptographic", "unknown"];
        for (i, name) in auth_names.iter().enumerate() {
            if self.num_au_type[i] > 0 {
                report.line(
                    PLUGIN,
                    &format!("Number of packets with {} authentication: {}", name, self.num_au_type[i]),
                )?;
            }
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "ospfStat\tospfV2Pkts\tospfV3Pkts".into(),
            MonitoringState::Value => {
                format!("0x{:02x}\t{}\t{}", self.agg_stat, self.num_v2[0], self.num_v3[0])
            }
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "ospfStat", self.agg_stat as u64);
        crate::state::push_entry(out, "ospfV2Pkts", self.num_v2[0]);
        crate::state::push_entry(out, "ospfV3Pkts", self.num_v3[0]);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "ospfStat") {
            self.agg_stat |= v as u8;
        }
        if let Some(v) = crate::state::lookup(blob, "ospfV2Pkts") {
            self.num_v2[0] = v;
        }
        if let Some(v) = crate::state::lookup(blob, "ospfV3Pkts") {
            self.num_v3[0] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbd_flag_triplet_validation() {
        // I alone or with a single companion bit is invalid; the full
        // Init+More+MasterSlave triplet is fine.
        for flags in [4u8, 5, 6] {
            assert!(matches!(flags & 0x07, 4 | 5 | 6));
        }
        assert!(!matches!(7u8 & 0x07, 4 | 5 | 6));
        assert!(!matches!(3u8 & 0x07, 4 | 5 | 6));
    }
}
