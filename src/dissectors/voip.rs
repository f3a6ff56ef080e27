//! VoIP dissector: SIP/SDP over UDP or TCP, RTP/RTCP on high UDP ports,
//! and the correlation between them.
//!
//! A process-wide map from announced (address, port) pairs to RTP flows is
//! filled when an RTP flow is created; when a SIP flow terminates, every
//! media address its SDP bodies announced is looked up so the SIP record
//! points at the RTP flows that carried the call, and the RTP payload files
//! can be attributed. G.711 silence suppression is undone on request by
//! padding the saved payload with the codec's silence byte.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::Serialize;

use crate::AnalyzerError;
use crate::config::AnalyzerConfig;
use crate::dispatcher::Dissector;
use crate::flow::{FlowDir, FlowRecord};
use crate::output::{ColumnType, FileManager, MonitoringState, OutputBuffer, Report, Schema};
use crate::packet::PacketRecord;
use crate::protocol::{L3_TCP, L3_UDP};

const PLUGIN: &str = "voipDetector";

pub const VOIP_RTP: u16 = 0x0001;
pub const VOIP_RTCP: u16 = 0x0002;
pub const VOIP_SIP: u16 = 0x0004;
pub const VOIP_STUN: u16 = 0x0008;
pub const VOIP_RTP_X: u16 = 0x0010; // RTP extension header
pub const VOIP_RTP_P: u16 = 0x0020; // RT(C)P padding
pub const VOIP_SDP: u16 = 0x0040;
pub const VOIP_RTP_M: u16 = 0x0080; // RTP marker
pub const VOIP_WROP: u16 = 0x0100; // payload write occurred
pub const VOIP_SIP_AUDFP: u16 = 0x0200; // audio flow announced
pub const VOIP_SIP_VIDFP: u16 = 0x0400; // video flow announced
pub const VOIP_SIP_OVRN: u16 = 0x0800; // announcement list truncated
pub const VOIP_RTP_PKTLSS: u16 = 0x1000; // RTP packet loss
pub const VOIP_RTP_SEQPJ: u16 = 0x2000; // RTP sequence jumped backwards
pub const VOIP_SIL_REST: u16 = 0x4000; // silence was restored
pub const VOIP_ERRMD: u16 = 0x8000; // RTP detection error

const PT_PCMU: u8 = 0;
const PT_PCMA: u8 = 8;
const SILENCE_ULAW: u8 = 0xff;
const SILENCE_ALAW: u8 = 0xd5;
const SIP_NAME_MAX: usize = 35;
const MIN_RTP_VALID: u32 = 2;

const SIP_METHODS: [&str; 15] = [
    "", "INVITE", "ACK", "BYE", "CANCEL", "REGISTER", "OPTIONS", "PRACK", "SUBSCRIBE", "NOTIFY",
    "PUBLISH", "INFO", "REFER", "MESSAGE", "UPDATE",
];

#[derive(Debug, Clone, Default)]
struct Slot {
    stat: u16,
    // SIP
    sip_methods: u16,
    sip_requests: Vec<String>,
    sip_status: Vec<u16>,
    sip_from: Vec<String>,
    sip_to: Vec<String>,
    sip_callid: Vec<String>,
    sip_contact: Vec<String>,
    sip_user_agent: String,
    sip_real_ip: String,
    // SDP announcements: (address, audio port, video port)
    sdp_addrs: Vec<(IpAddr, u16, u16)>,
    rtpmaps: Vec<String>,
    // correlation results, filled at termination
    linked_findex: Vec<u64>,
    linked_ssrc: Vec<u32>,
    // RTP
    rtp_seq: u16,
    rtp_pkt_cnt: u32,
    rtp_good_cnt: u32,
    ssrcs: Vec<u32>,
    csrcs: Vec<u32>,
    next_timestamp: u32,
    fname: String,
    // RTCP sender/receiver aggregates
    rtcp_pkt_cnt: u32,
    rtcp_byte_cnt: u32,
    rtcp_frac_lost: u8,
    rtcp_lost: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VoipRecord {
    pub stat: u16,
    pub sip_methods: u16,
    pub sip_requests: Vec<String>,
    pub sip_status: Vec<u16>,
    pub sip_from: Vec<String>,
    pub sip_to: Vec<String>,
    pub sip_callid: Vec<String>,
    pub sip_contact: Vec<String>,
    pub sip_user_agent: String,
    pub sip_real_ip: String,
    pub sdp_addrs: Vec<(IpAddr, u16, u16)>,
    pub rtpmaps: Vec<String>,
    pub linked_findex: Vec<u64>,
    pub linked_ssrc: Vec<u32>,
    pub rtp_pkt_cnt: u32,
    pub rtp_good_cnt: u32,
    pub ssrcs: Vec<u32>,
    pub csrcs: Vec<u32>,
    pub rtcp_pkt_cnt: u32,
    pub rtcp_byte_cnt: u32,
    pub rtcp_frac_lost: u8,
    pub rtcp_lost: u32,
    pub fname: String,
}

impl VoipRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u16(self.stat);
        buf.append_u16(self.sip_methods);
        buf.append_rep_count(self.sip_requests.len() as u32);
        for r in &self.sip_requests {
            buf.append_str(r);
        }
        buf.append_rep_count(self.sip_status.len() as u32);
        for s in &self.sip_status {
            buf.append_u16(*s);
        }
        buf.append_rep_count(self.sip_from.len() as u32);
        for s in &self.sip_from {
            buf.append_str(s);
        }
        buf.append_rep_count(self.sip_to.len() as u32);
        for s in &self.sip_to {
            buf.append_str(s);
        }
        buf.append_rep_count(self.sip_callid.len() as u32);
        for s in &self.sip_callid {
            buf.append_str(s);
        }
        buf.append_rep_count(self.sip_contact.len() as u32);
        for s in &self.sip_contact {
            buf.append_str(s);
        }
        buf.append_str(&self.sip_user_agent);
        buf.append_str(&self.sip_real_ip);
        buf.append_rep_count(self.sdp_addrs.len() as u32);
        for (ip, ap, vp) in &self.sdp_addrs {
            match ip {
                IpAddr::V4(v4) => buf.append_ip4(v4.octets()),
                IpAddr::V6(v6) => buf.append_ip6(v6.octets()),
            }
            buf.append_u16(*ap);
            buf.append_u16(*vp);
        }
        buf.append_rep_count(self.rtpmaps.len() as u32);
        for m in &self.rtpmaps {
            buf.append_str(m);
        }
        buf.append_rep_count(self.linked_findex.len() as u32);
        for f in &self.linked_findex {
            buf.append_u64(*f);
        }
        buf.append_rep_count(self.linked_ssrc.len() as u32);
        for s in &self.linked_ssrc {
            buf.append_u32(*s);
        }
        buf.append_u32(self.rtp_pkt_cnt);
        buf.append_u32(self.rtp_good_cnt);
        buf.append_rep_count(self.ssrcs.len() as u32);
        for s in &self.ssrcs {
            buf.append_u32(*s);
        }
        buf.append_rep_count(self.csrcs.len() as u32);
        for c in &self.csrcs {
            buf.append_u32(*c);
        }
        buf.append_u32(self.rtcp_pkt_cnt);
        buf.append_u32(self.rtcp_byte_cnt);
        buf.append_u8(self.rtcp_frac_lost);
        buf.append_u32(self.rtcp_lost);
        buf.append_str(&self.fname);
    }
}

#[derive(Debug, Clone, Copy)]
struct RtpEndpoint {
    findex: u64,
    flow_idx: usize,
    ssrc: u32,
}

#[derive(Debug)]
pub struct VoipDissector {
    slots: Vec<Slot>,
    stat_max: usize,
    rfx_max: usize,
    rtp_f_max: usize,
    table_size: usize,
    save_dir: Option<PathBuf>,
    flow_timeout_secs: f64,
    /// (destination address, destination port) of every RTP flow.
    endpoints: HashMap<(IpAddr, u16), RtpEndpoint>,
    agg_stat: u16,
    agg_methods: u16,
    sip_pkts: u64,
    rtp_pkts: u64,
    rtcp_pkts: u64,
}

impl VoipDissector {
    pub fn new(cfg: &AnalyzerConfig) -> VoipDissector {
        VoipDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            stat_max: cfg.sip_stat_max,
            rfx_max: cfg.sip_rfx_max,
            rtp_f_max: cfg.rtp_f_max,
            table_size: cfg.aux_table_size,
            save_dir: cfg.voip_save_dir.clone(),
            flow_timeout_secs: cfg.flow_timeout_secs,
            endpoints: HashMap::new(),
            agg_stat: 0,
            agg_methods: 0,
            sip_pkts: 0,
            rtp_pkts: 0,
            rtcp_pkts: 0,
        }
    }

    pub fn reset_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
        }
    }

    pub fn on_new_flow(&mut self, pkt: &PacketRecord<'_>, idx: usize, flow: &FlowRecord) {
        if idx >= self.slots.len() {
            return;
        }
        let proto = flow.key.proto;
        let (sp, dp) = (flow.key.src_port, flow.key.dst_port);
        if (proto != L3_UDP && proto != L3_TCP) || sp < 1024 || dp < 1024 {
            return;
        }

        let mut payload = pkt.l7_bytes();
        let mut stat = 0u16;

        // STUN-wrapped SIP on the Slingbox port.
        if (sp == 3483 || dp == 3483) && payload.len() > 12 {
            stat |= VOIP_STUN;
            payload = &payload[12..];
        }

        let is_sip = sp == 5060 || dp == 5060 || sp == 5070 || dp == 5070
            || find(payload, b"SIP/2.0").is_some();
        if is_sip {
            stat |= VOIP_SIP;
        } else if proto == L3_UDP && payload.len() >= 12 && payload[0] & 0xc0 == 0x80 {
            // Version 2 on a high UDP port: RTP on even, RTCP on odd
            // destination ports. Register the endpoint for correlation.
            stat |= if dp & 1 == 0 { VOIP_RTP } else { VOIP_RTCP };
            if self.endpoints.len() < self.table_size {
                self.endpoints.insert(
                    (flow.key.dst, dp),
                    RtpEndpoint { findex: flow.findex, flow_idx: idx, ssrc: 0 },
                );
            } else {
                log::warn!("[{PLUGIN}] endpoint table full, correlation disabled for new flows");
            }
        }
        self.slots[idx].stat |= stat;
    }

    pub fn on_layer4(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        flow: &FlowRecord,
        files: &mut FileManager,
    ) {
        if idx >= self.slots.len() || self.slots[idx].stat == 0 {
            return;
        }
        let mut payload = pkt.l7_bytes();
        if payload.is_empty() {
            return;
        }
        if self.slots[idx].stat & VOIP_STUN != 0 && payload.len() > 12 {
            payload = &payload[12..];
        }

        if self.slots[idx].stat & VOIP_SIP != 0 {
            self.process_sip(idx, payload);
        } else if self.slots[idx].stat & (VOIP_RTP | VOIP_RTCP) != 0 {
            self.process_rtp(pkt, idx, flow, payload, files);
        }
    }

    fn process_sip(&mut self, idx: usize, payload: &[u8]) {
        self.sip_pkts += 1;
        let stat_max = self.stat_max;

        if payload.starts_with(b"SIP/2.0") {
            // Response: SIP/2.0 <code> <reason>
            if let Some(code) = payload
                .get(8..11)
                .and_then(|c| std::str::from_utf8(c).ok())
                .and_then(|c| c.parse::<u16>().ok())
            {
                let slot = &mut self.slots[idx];
                if !slot.sip_status.contains(&code) && slot.sip_status.len() < stat_max {
                    slot.sip_status.push(code);
                }
            }
        } else if payload.first().is_some_and(|b| b.is_ascii_uppercase()) {
            // Request: METHOD URI SIP/2.0
            let mut method_idx = 0;
            for (i, name) in SIP_METHODS.iter().enumerate().skip(1) {
                if payload.starts_with(name.as_bytes()) {
                    method_idx = i;
                    break;
                }
            }
            let slot = &mut self.slots[idx];
            slot.sip_methods |= 1 << method_idx;
            let req: String = String::from_utf8_lossy(&payload[..payload.len().min(3)]).into_owned();
            if !slot.sip_requests.contains(&req) && slot.sip_requests.len() < stat_max {
                slot.sip_requests.push(req);
            }
        }

        // Header fields, deduplicated, bounded.
        for (prefix, angle) in [
            ("From: ", true),
            ("To: ", true),
            ("Call-ID: ", false),
            ("Contact: ", true),
        ] {
            if let Some(value) = header_value(payload, prefix, angle) {
                let slot = &mut self.slots[idx];
                let list = match prefix {
                    "From: " => &mut slot.sip_from,
                    "To: " => &mut slot.sip_to,
                    "Call-ID: " => &mut slot.sip_callid,
                    _ => &mut slot.sip_contact,
                };
                if !list.contains(&value) {
                    if list.len() < stat_max {
                        list.push(value);
                    } else {
                        slot.stat |= VOIP_SIP_OVRN;
                    }
                }
            }
        }
        if let Some(ua) = header_value(payload, "User-Agent: ", false) {
            self.slots[idx].sip_user_agent = ua;
        }
        if let Some(ip) = header_value(payload, "X-Real-IP: ", false) {
            self.slots[idx].sip_real_ip = ip;
        }

        self.process_sdp(idx, payload);
    }

    /// SDP body: connection address plus audio/video media ports.
    fn process_sdp(&mut self, idx: usize, payload: &[u8]) {
        let Some(cpos) = find(payload, b"c=IN IP") else { return };
        self.slots[idx].stat |= VOIP_SDP;

        let addr: Option<IpAddr> = line_field(&payload[cpos..], 9).and_then(|s| s.parse().ok());
        let audio = find(payload, b"m=audio ").and_then(|p| {
            line_field(&payload[p..], 8).and_then(|s| s.parse::<u16>().ok())
        });
        let video = find(payload, b"m=video ").and_then(|p| {
            line_field(&payload[p..], 8).and_then(|s| s.parse::<u16>().ok())
        });

        if audio.is_some() {
            self.slots[idx].stat |= VOIP_SIP_AUDFP;
        }
        if video.is_some() {
            self.slots[idx].stat |= VOIP_SIP_VIDFP;
        }

        if let Some(ip) = addr {
            let triple = (ip, audio.unwrap_or(0), video.unwrap_or(0));
            let rfx_max = self.rfx_max;
            let slot = &mut self.slots[idx];
            if !slot.sdp_addrs.contains(&triple) {
                if slot.sdp_addrs.len() < rfx_max {
                    slot.sdp_addrs.push(triple);
                } else {
                    slot.stat |= VOIP_SIP_OVRN;
                }
            }
        }

        // a=rtpmap:<pt> <encoding>/<clock>
        let mut search = payload;
        let rfx_max = self.rfx_max;
        while let Some(p) = find(search, b"a=rtpmap:") {
            if let Some(map) = line_field(&search[p..], 9) {
                let slot = &mut self.slots[idx];
                if !slot.rtpmaps.contains(&map) && slot.rtpmaps.len() < rfx_max {
                    slot.rtpmaps.push(map);
                }
            }
            search = &search[p + 9..];
        }
    }

    fn process_rtp(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        flow: &FlowRecord,
        payload: &[u8],
        files: &mut FileManager,
    ) {
        if payload.len() < 12 {
            return;
        }
        let vpr = payload[0];
        if vpr & 0xc0 != 0x80 {
            // Not version 2 after all.
            self.slots[idx].stat |= VOIP_ERRMD;
            return;
        }
        let typ = payload[1];
        let seq = u16::from_be_bytes([payload[2], payload[3]]);
        let ts = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let ssrc = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);

        // RTCP packet types 200..210 share the port parity split.
        if (200..211).contains(&typ) {
            self.rtcp_pkts += 1;
            self.slots[idx].stat |= VOIP_RTCP;
            self.process_rtcp(idx, typ, payload);
            return;
        }

        self.rtp_pkts += 1;
        let marker = typ & 0x80 != 0;
        let pt = typ & 0x7f;
        {
            let rtp_f_max = self.rtp_f_max;
            let slot = &mut self.slots[idx];
            slot.stat |= VOIP_RTP;
            if marker {
                slot.stat |= VOIP_RTP_M;
            }
            if vpr & 0x10 != 0 {
                slot.stat |= VOIP_RTP_X;
            }
            if vpr & 0x20 != 0 {
                slot.stat |= VOIP_RTP_P;
            }
            slot.rtp_pkt_cnt += 1;

            if !slot.ssrcs.contains(&ssrc) && slot.ssrcs.len() < rtp_f_max {
                slot.ssrcs.push(ssrc);
            }

            // Sequence continuity.
            if slot.rtp_pkt_cnt > 1 {
                let diff = seq.wrapping_sub(slot.rtp_seq) as i16;
                if diff < 1 {
                    slot.stat |= VOIP_RTP_SEQPJ;
                } else if diff == 1 {
                    slot.rtp_good_cnt += 1;
                } else {
                    slot.stat |= VOIP_RTP_PKTLSS;
                }
                if slot.rtp_good_cnt < MIN_RTP_VALID {
                    slot.stat |= VOIP_ERRMD;
                }
            }
            slot.rtp_seq = seq;
        }

        // Record the live SSRC for the correlator.
        if let Some(ep) = self.endpoints.get_mut(&(flow.key.dst, flow.key.dst_port)) {
            ep.ssrc = ssrc;
        }

        // CSRC list.
        let num_csrc = (vpr & 0x0f) as usize;
        let mut off = 12 + num_csrc * 4;
        if payload.len() >= off {
            for c in payload[12..off].chunks_exact(4) {
                let csrc = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                let slot = &mut self.slots[idx];
                if !slot.csrcs.contains(&csrc) {
                    if slot.csrcs.len() < 15 {
                        slot.csrcs.push(csrc);
                    } else {
                        break;
                    }
                }
            }
        }

        // Payload extraction.
        let Some(dir) = self.save_dir.clone() else { return };
        if payload.len() < off {
            return;
        }
        // Extension header: 4 bytes of id/length, then length words.
        if vpr & 0x10 != 0 {
            if payload.len() < off + 4 {
                return;
            }
            let ext_words = u16::from_be_bytes([payload[off + 2], payload[off + 3]]) as usize;
            off += 4 + ext_words * 4;
        }
        let pad = if vpr & 0x20 != 0 && pkt.l7_len as usize == payload.len() {
            *payload.last().unwrap_or(&0) as usize
        } else {
            0
        };
        if off >= payload.len().saturating_sub(pad) {
            return;
        }
        let data = &payload[off..payload.len() - pad];

        let dir_tag = if flow.dir == FlowDir::A { "A" } else { "B" };
        let fname = format!("rtp_{}_{}_{}", flow.findex, pt, dir_tag);
        let path = dir.join(&fname);

        // Silence restoration for G.711 marker events.
        if marker && (pt == PT_PCMU || pt == PT_PCMA) {
            let next = self.slots[idx].next_timestamp;
            if next != 0 && ts > next {
                let gap = (ts - next) as usize;
                if gap <= (8000.0 * self.flow_timeout_secs) as usize {
                    let byte = if pt == PT_PCMU { SILENCE_ULAW } else { SILENCE_ALAW };
                    let silence = vec![byte; gap];
                    let _ = files.append_bytes(&path, &silence);
                    self.slots[idx].stat |= VOIP_SIL_REST;
                }
            }
        }

        let _ = files.append_bytes(&path, data);
        let slot = &mut self.slots[idx];
        slot.stat |= VOIP_WROP;
        slot.next_timestamp = ts.wrapping_add(data.len() as u32);
        slot.fname = fname;
    }

    fn process_rtcp(&mut self, idx: usize, typ: u8, payload: &[u8]) {
        // Sender report: NTP(8), RTP ts(4), packet count(4), byte count(4).
        if typ == 200 && payload.len() >= 28 {
            let slot = &mut self.slots[idx];
            slot.rtcp_pkt_cnt = slot.rtcp_pkt_cnt.wrapping_add(u32::from_be_bytes([
                payload[20], payload[21], payload[22], payload[23],
            ]));
            slot.rtcp_byte_cnt = slot.rtcp_byte_cnt.wrapping_add(u32::from_be_bytes([
                payload[24], payload[25], payload[26], payload[27],
            ]));
            // First report block, if present.
            if payload.len() >= 52 {
                slot.rtcp_frac_lost = payload[32];
                slot.rtcp_lost = u32::from_be_bytes([0, payload[33], payload[34], payload[35]]);
            }
        } else if typ == 201 && payload.len() >= 32 {
            let slot = &mut self.slots[idx];
            slot.rtcp_frac_lost = payload[12];
            slot.rtcp_lost = u32::from_be_bytes([0, payload[13], payload[14], payload[15]]);
        }
    }

    /// SIP termination resolves announced media endpoints to RTP flows.
    pub fn on_flow_terminate(&mut self, idx: usize, flow: &FlowRecord) -> VoipRecord {
        if idx < self.slots.len() && self.slots[idx].stat & VOIP_SIP != 0 {
            let addrs = self.slots[idx].sdp_addrs.clone();
            for (ip, audio, video) in addrs {
                for port in [audio, video] {
                    if port == 0 {
                        continue;
                    }
                    if let Some(ep) = self.endpoints.get(&(ip, port)).copied() {
                        let slot = &mut self.slots[idx];
                        if !slot.linked_findex.contains(&ep.findex) {
                            slot.linked_findex.push(ep.findex);
                            slot.linked_ssrc.push(ep.ssrc);
                        }
                        // The RTP flow learns the paired SSRC set too, but
                        // only while its slot is still alive.
                        let sip_ssrcs: Vec<u32> = self.slots[idx].ssrcs.clone();
                        if ep.flow_idx != usize::MAX
                            && let Some(rtp_slot) = self.slots.get_mut(ep.flow_idx)
                        {
                            for s in sip_ssrcs {
                                if !rtp_slot.ssrcs.contains(&s) && rtp_slot.ssrcs.len() < 20 {
                                    rtp_slot.ssrcs.push(s);
                                }
                            }
                        }
                    }
                }
            }
        }

        // The endpoint map lives for the whole process so a SIP flow can
        // still resolve RTP flows that terminated earlier; only the slot
        // reference goes stale.
        for ep in self.endpoints.values_mut() {
            if ep.findex == flow.findex {
                ep.flow_idx = usize::MAX;
            }
        }

        let slot = self.slots.get(idx).cloned().unwrap_or_default();
        self.agg_stat |= slot.stat;
        self.agg_methods |= slot.sip_methods;
        VoipRecord {
            stat: slot.stat,
            sip_methods: slot.sip_methods,
            sip_requests: slot.sip_requests,
            sip_status: slot.sip_status,
            sip_from: slot.sip_from,
            sip_to: slot.sip_to,
            sip_callid: slot.sip_callid,
            sip_contact: slot.sip_contact,
            sip_user_agent: slot.sip_user_agent,
            sip_real_ip: slot.sip_real_ip,
            sdp_addrs: slot.sdp_addrs,
            rtpmaps: slot.rtpmaps,
            linked_findex: slot.linked_findex,
            linked_ssrc: slot.linked_ssrc,
            rtp_pkt_cnt: slot.rtp_pkt_cnt,
            rtp_good_cnt: slot.rtp_good_cnt,
            ssrcs: slot.ssrcs,
            csrcs: slot.csrcs,
            rtcp_pkt_cnt: slot.rtcp_pkt_cnt,
            rtcp_byte_cnt: slot.rtcp_byte_cnt,
            rtcp_frac_lost: slot.rtcp_frac_lost,
            rtcp_lost: slot.rtcp_lost,
            fname: slot.fname,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Value of a SIP header line: after the prefix, up to CR, optionally
/// narrowed to the part between `<`/`:` and `>`/`;`.
fn header_value(payload: &[u8], prefix: &str, angle: bool) -> Option<String> {
    let start = find(payload, prefix.as_bytes())? + prefix.len();
    let rest = &payload[start..];
    let end = rest.iter().position(|&b| b == b'\r')?;
    let mut line = &rest[..end];
    if angle {
        if let Some(lt) = line.iter().position(|&b| b == b'<') {
            line = &line[lt + 1..];
        }
        if let Some(gt) = line.iter().position(|&b| b == b'>' || b == b';') {
            line = &line[..gt];
        }
    }
    if line.is_empty() {
        return None;
    }
    let line = &line[..line.len().min(SIP_NAME_MAX)];
    Some(String::from_utf8_lossy(line).into_owned())
}

/// First whitespace/CR-delimited token at `offset` into the current line.
fn line_field(data: &[u8], offset: usize) -> Option<String> {
    let rest = data.get(offset..)?;
    let end = rest
        .iter()
        .position(|&b| b == b'\r' || b == b'\n' || b == b' ')
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

impl Dissector for VoipDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("voipStat", ColumnType::H16, "VoIP status")
            .push("sipMethods", ColumnType::H16, "SIP methods bitfield")
            .push("sipRq", ColumnType::Rep(vec![ColumnType::Str]), "SIP request methods")
            .push("sipStatCode", ColumnType::Rep(vec![ColumnType::U16]), "SIP status codes")
            .push("sipFrom", ColumnType::Rep(vec![ColumnType::Str]), "SIP From fields")
            .push("sipTo", ColumnType::Rep(vec![ColumnType::Str]), "SIP To fields")
            .push("sipCallID", ColumnType::Rep(vec![ColumnType::Str]), "SIP Call-ID fields")
            .push("sipContact", ColumnType::Rep(vec![ColumnType::Str]), "SIP Contact fields")
            .push("sipUsrAgnt", ColumnType::Str, "SIP User-Agent")
            .push("sipRealIP", ColumnType::Str, "SIP X-Real-IP")
            .push(
                "sdpAddr",
                ColumnType::Rep(vec![ColumnType::Ip4, ColumnType::U16, ColumnType::U16]),
                "SDP announced address, audio and video ports",
            )
            .push("sdpRTPMap", ColumnType::Rep(vec![ColumnType::Str]), "SDP rtpmap entries")
            .push("sipRTPFindex", ColumnType::Rep(vec![ColumnType::U64]), "Linked RTP flow indices")
            .push("sipRTPSSRC", ColumnType::Rep(vec![ColumnType::U32]), "Linked RTP SSRCs")
            .push("rtpPktCnt", ColumnType::U32, "RTP packet count")
            .push("rtpScnt", ColumnType::U32, "RTP packets in sequence")
            .push("rtpSSRC", ColumnType::Rep(vec![ColumnType::U32]), "RTP SSRC list")
            .push("rtpCSRC", ColumnType::Rep(vec![ColumnType::U32]), "RTP CSRC list")
            .push("rtcpTPCnt", ColumnType::U32, "RTCP cumulated transmitter packet count")
            .push("rtcpTBCnt", ColumnType::U32, "RTCP cumulated transmitter byte count")
            .push("rtcpFracLst", ColumnType::U8, "RTCP fraction lost")
            .push("rtcpCPMCnt", ColumnType::U32, "RTCP cumulative packet miss count")
            .push("voipFname", ColumnType::Str, "RTP content file name");
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        if self.agg_stat != 0 {
            report.line(PLUGIN, &format!("Aggregated voipStat=0x{:04x}", self.agg_stat))?;
        }
        if self.agg_methods != 0 {
            report.line(PLUGIN, &format!("Aggregated sipMethods=0x{:04x}", self.agg_methods))?;
        }
        if self.sip_pkts + self.rtp_pkts + self.rtcp_pkts > 0 {
            report.line(
                PLUGIN,
                &format!(
                    "Number of SIP, RTP, RTCP packets: {}, {}, {}",
                    self.sip_pkts, self.rtp_pkts, self.rtcp_pkts
                ),
            )?;
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "voipStat\tsipPkts\trtpPkts".into(),
            MonitoringState::Value => {
                format!("0x{:04x}\t{}\t{}", self.agg_stat, self.sip_pkts, self.rtp_pkts)
            }
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "voipStat", self.agg_stat as u64);
        crate::state::push_entry(out, "sipMethods", self.agg_methods as u64);
        crate::state::push_entry(out, "sipPkts", self.sip_pkts);
        crate::state::push_entry(out, "rtpPkts", self.rtp_pkts);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "voipStat") {
            self.agg_stat |= v as u16;
        }
        if let Some(v) = crate::state::lookup(blob, "sipMethods") {
            self.agg_methods |= v as u16;
        }
        if let Some(v) = crate::state::lookup(blob, "sipPkts") {
            self.sip_pkts = v;
        }
        if let Some(v) = crate::state::lookup(blob, "rtpPkts") {
            self.rtp_pkts = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sip_header_extraction_strips_angles() {
        let msg = b"INVITE sip:bob@example.com SIP/2.0\r\nFrom: Alice <sip:alice@example.com>;tag=1\r\nTo: <sip:bob@example.com>\r\nCall-ID: abc123@host\r\n\r\n";
        assert_eq!(
            header_value(msg, "From: ", true).as_deref(),
            Some("sip:alice@example.com")
        );
        assert_eq!(
            header_value(msg, "To: ", true).as_deref(),
            Some("sip:bob@example.com")
        );
        assert_eq!(
            header_value(msg, "Call-ID: ", false).as_deref(),
            Some("abc123@host")
        );
    }

    #[test]
    fn sdp_tokens() {
        let body = b"v=0\r\nc=IN IP4 10.0.0.9\r\nm=audio 49170 RTP/AVP 0\r\n";
        let cpos = find(body, b"c=IN IP").unwrap();
        assert_eq!(line_field(&body[cpos..], 9).as_deref(), Some("10.0.0.9"));
        let mpos = find(body, b"m=audio ").unwrap();
        assert_eq!(line_field(&body[mpos..], 8).as_deref(), Some("49170"));
    }
}
