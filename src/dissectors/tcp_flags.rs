//! TCP flags and state engine: IP-layer side observations, checksum
//! verification, option and window analysis, the sequence/ACK anomaly
//! automaton, RTT estimation and scan detection.
//!
//! Everything here is per-direction state; the handful of places that read
//! or write the opposite direction (RTT seeding, window-probe detection,
//! duplicate-ACK chains, successful-scan pairing) go through a checked
//! pair borrow of the slot arena.

use serde::Serialize;

use crate::AnalyzerError;
use crate::checksum;
use crate::config::AnalyzerConfig;
use crate::dispatcher::{Dissector, pair_mut};
use crate::flow::{FlowRecord, FlowStatus};
use crate::output::{ColumnType, MonitoringState, OutputBuffer, PacketFile, Report, Schema, pct};
use crate::packet::PacketRecord;
use crate::protocol::{L3_ICMP, L3_ICMP6, L3_IGMP, L3_TCP, L3_UDP, L3_UDPLITE};
use crate::time::Timeval;

const PLUGIN: &str = "tcpFlags";

// Raw TCP flag bits.
pub const TH_FIN: u8 = 0x01;
pub const TH_SYN: u8 = 0x02;
pub const TH_RST: u8 = 0x04;
pub const TH_PSH: u8 = 0x08;
pub const TH_ACK: u8 = 0x10;
pub const TH_URG: u8 = 0x20;
const TH_SYN_FIN_RST: u8 = TH_SYN | TH_FIN | TH_RST;
const TH_ARSF: u8 = TH_ACK | TH_SYN_FIN_RST;
const TH_XMAS: u8 = TH_FIN | TH_PSH | TH_URG;

// Aggregated tcpFlags bitfield: raw flags in the low byte, combinations above.
pub const TCP_FIN_ACK: u16 = 0x0100;
pub const TCP_SYN_ACK: u16 = 0x0200;
pub const TCP_RST_ACK: u16 = 0x0400;
pub const TCP_NULL: u16 = 0x0800;
pub const TCP_SYN_FIN: u16 = 0x1000;
pub const TCP_SYN_FIN_RST: u16 = 0x2000;
pub const TCP_RST_FIN: u16 = 0x4000;
pub const TCP_XMAS: u16 = 0x8000;

// tcpFStat status bits.
pub const TCPF_DET: u16 = 0x0001; // TCP analyzed
pub const TCPF_OPT_CORRUPT: u16 = 0x0002; // malformed option field
pub const TCPF_SACK: u16 = 0x0004; // SACK permitted
pub const TCPF_WS_USED: u16 = 0x0008; // window scale negotiated
pub const TCPF_WIN_BELOW_MIN: u16 = 0x0010; // window under the configured floor
pub const TCPF_WIN_UPD: u16 = 0x0020; // window update segment
pub const TCPF_WIN_0PRB: u16 = 0x0040; // zero-window probe
pub const TCPF_WIN_0PRB_ACK: u16 = 0x0080; // answer to a zero-window probe
pub const TCPF_WIN_FILL: u16 = 0x0100; // receive window filled
pub const TCPF_TM_INIT: u16 = 0x0200; // first timestamp option recorded
pub const TCPF_TM_DEC: u16 = 0x0400; // timestamp went backwards
pub const TCPF_MPTCP: u16 = 0x0800; // multipath TCP option seen
pub const TCPF_SNAP: u16 = 0x1000; // header beyond the snap length

// ipFlags bits.
pub const IPF_FRAG_MF: u16 = 0x0001;
pub const IPF_FRAG_DF: u16 = 0x0002;
pub const IPF_FRAG_RES: u16 = 0x0004;
pub const IPF_OPT_CORRUPT: u16 = 0x0008;
pub const IPF_ID_ROLLOVER: u16 = 0x0010;
pub const IPF_ID_OUT_ORDER: u16 = 0x0020;
pub const IPF_L3CHK_SUMERR: u16 = 0x0040;
pub const IPF_L4CHK_SUMERR: u16 = 0x0080;
pub const IPF_SNAP_HLEN_WARN: u16 = 0x0100;
pub const IPF_PKT_INTDIS: u16 = 0x0200; // zero inter-arrival
pub const IPF_PKT_INTDIS_NEG: u16 = 0x0400; // negative inter-arrival, time jump
pub const IPF_UDPLITE_COV_ERR: u16 = 0x0800; // UDP-Lite coverage violation

// tcpAnomaly bits.
pub const TCP_SCAN_DET: u16 = 0x0001;
pub const TCP_SCAN_SU_DET: u16 = 0x0002;
pub const TCP_SYN_RETRY: u16 = 0x0004;
pub const TCP_SYN_L7: u16 = 0x0008; // SYN carrying payload
pub const TCP_KPALV: u16 = 0x0010;
pub const TCP_KPALV_ACK: u16 = 0x0020;
pub const TCP_ACK_DUP: u16 = 0x0040;
pub const TCP_SEQ_OUTORDR: u16 = 0x0080;
pub const TCP_SEQ_TRETRY: u16 = 0x0100; // true retransmission
pub const TCP_SEQ_FRETRY: u16 = 0x0200; // fast retransmission
pub const TCP_SEQ_MESS: u16 = 0x0400; // spurious retransmission, messy order
pub const TCP_ACK_UNSEEN: u16 = 0x0800; // ACK of data never captured
pub const TCP_PKT_NCAP: u16 = 0x1000; // sequence jump, packets not captured

/// RTT estimation state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RttState {
    #[default]
    None,
    SynSt,
    SynAck,
    Ack,
    Stop,
}

const JA4T_OPT_MAX: usize = 20;

#[derive(Debug, Clone)]
struct Slot {
    // IP layer
    ip_ttl_last: u8,
    ip_ttl_min: u8,
    ip_ttl_max: u8,
    ip_ttl_chg: u8,
    ip_id_last: u16,
    ip_id_valid: bool,
    ip_id_min_delta: i32,
    ip_id_max_delta: i32,
    ip_tos: u8,
    ip_flags: u16,
    ip_opt_cnt: u16,
    ip_cp_cl: u8,
    ip_options: u32,
    // fragmented L4 checksum accumulation
    frag_active: bool,
    frag_acc: u32,
    frag_len: u32,
    frag_hdr_cksum: u16,
    frag_proto: u8,
    // flags
    stat: u16,
    stat_last: u16,
    flags_agg: u16,
    flags_last: u8,
    anomaly: u16,
    anomaly_last: u16,
    flag_cnt: [u16; 16],
    // sequence/ack
    seq_init: u32,
    seq_last: u32,
    seq_next: u32,
    seq_max: u32,
    ack_last: u32,
    p_seq_cnt: u16,
    seq_fault_cnt: u16,
    p_ack_cnt: u16,
    ack_fault_cnt: u16,
    seq_sent_bytes: u64,
    ack_rcvd_bytes: u64,
    // window
    win_init: u32,
    win_last: u32,
    win_min: u32,
    win_max: u32,
    win_avg: f32,
    win_dwn_cnt: u16,
    win_up_cnt: u16,
    win_chg_cnt: u16,
    win_going_up: bool,
    win_seen: bool,
    win_min_cnt: u64,
    win_tlen: u32,
    win_tlen_max: u32,
    win_scale: u8,
    // options
    opt_pkt_cnt: u16,
    opt_cnt: u16,
    options: u32,
    mss: u16,
    ja4t_opts: Vec<u8>,
    // MPTCP
    mp_type_bf: u16,
    mp_flags: u8,
    mp_aid: u8,
    mp_dss_flags: u8,
    // timestamp option
    tm_s: u32,
    tm_er: u32,
    tm_s_init: u32,
    tm_s_last: u32,
    tm_first_pkt: Timeval,
    tm_last_pkt: Timeval,
    // RTT
    rtt_state: RttState,
    pkt_cnt: u64,
    trip: f32,
    rtt_min: f32,
    rtt_max: f32,
    rtt_avg: f32,
    rtt_jit: f32,
    last_pkt_time: Timeval,
    scan_pkt_cnt: u64,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            ip_ttl_last: 0,
            ip_ttl_min: u8::MAX,
            ip_ttl_max: 0,
            ip_ttl_chg: 0,
            ip_id_last: 0,
            ip_id_valid: false,
            ip_id_min_delta: i32::MAX,
            ip_id_max_delta: i32::MIN,
            ip_tos: 0,
            ip_flags: 0,
            ip_opt_cnt: 0,
            ip_cp_cl: 0,
            ip_options: 0,
            frag_active: false,
            frag_acc: 0,
            frag_len: 0,
            frag_hdr_cksum: 0,
            frag_proto: 0,
            stat: 0,
            stat_last: 0,
            flags_agg: 0,
            flags_last: 0,
            anomaly: 0,
            anomaly_last: 0,
            flag_cnt: [0; 16],
            seq_init: 0,
            seq_last: 0,
            seq_next: 0,
            seq_max: 0,
            ack_last: 0,
            p_seq_cnt: 0,
            seq_fault_cnt: 0,
            p_ack_cnt: 0,
            ack_fault_cnt: 0,
            seq_sent_bytes: 0,
            ack_rcvd_bytes: 0,
            win_init: 0,
            win_last: 0,
            win_min: u32::MAX,
            win_max: 0,
            win_avg: 0.0,
            win_dwn_cnt: 0,
            win_up_cnt: 0,
            win_chg_cnt: 0,
            win_going_up: false,
            win_seen: false,
            win_min_cnt: 0,
            win_tlen: 0,
            win_tlen_max: 0,
            win_scale: 0,
            opt_pkt_cnt: 0,
            opt_cnt: 0,
            options: 0,
            mss: 0,
            ja4t_opts: Vec::new(),
            mp_type_bf: 0,
            mp_flags: 0,
            mp_aid: 0,
            mp_dss_flags: 0,
            tm_s: 0,
            tm_er: 0,
            tm_s_init: 0,
            tm_s_last: 0,
            tm_first_pkt: Timeval::ZERO,
            tm_last_pkt: Timeval::ZERO,
            rtt_state: RttState::None,
            pkt_cnt: 0,
            trip: 0.0,
            rtt_min: f32::MAX,
            rtt_max: 0.0,
            rtt_avg: 0.0,
            rtt_jit: 0.0,
            last_pkt_time: Timeval::ZERO,
            scan_pkt_cnt: 0,
        }
    }
}

/// Flow-file record for the TCP engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TcpFlagsRecord {
    pub tcp_f_stat: u16,
    pub ip_min_id_delta: u16,
    pub ip_max_id_delta: u16,
    pub ip_min_ttl: u8,
    pub ip_max_ttl: u8,
    pub ip_ttl_chg: u8,
    pub ip_tos: u8,
    pub ip_flags: u16,
    pub ip_opt_cnt: u16,
    pub ip_opt_cpcl: u8,
    pub ip_options: u32,
    pub tcp_iseq: u32,
    pub tcp_pseq_cnt: u16,
    pub tcp_seq_sent_bytes: u64,
    pub tcp_seq_fault_cnt: u16,
    pub tcp_pack_cnt: u16,
    pub tcp_ack_rcvd_bytes: u64,
    pub tcp_ack_fault_cnt: u16,
    pub tcp_win_tlen_max: u32,
    pub tcp_init_win_sz: u32,
    pub tcp_avg_win_sz: f32,
    pub tcp_min_win_sz: u32,
    pub tcp_max_win_sz: u32,
    pub tcp_win_dwn_cnt: u16,
    pub tcp_win_up_cnt: u16,
    pub tcp_win_chg_cnt: u16,
    pub tcp_win_thr_ratio: f32,
    pub tcp_flags: u16,
    pub tcp_anomaly: u16,
    pub tcp_flag_cnt: [u16; 16],
    pub tcp_ja4t: String,
    pub tcp_opt_pkt_cnt: u16,
    pub tcp_opt_cnt: u16,
    pub tcp_options: u32,
    pub tcp_mss: u16,
    pub tcp_ws: u16,
    pub tcp_mptcp_type_bf: u16,
    pub tcp_mptcp_flags: u8,
    pub tcp_mptcp_aid: u8,
    pub tcp_mptcp_dss_flags: u8,
    pub tcp_tm_s: u32,
    pub tcp_tm_er: u32,
    pub tcp_clock_incr: f32,
    pub tcp_uptime: f64,
    pub tcp_boot_time: Timeval,
    pub tcp_ssasaa_trip: f32,
    pub tcp_rtt_ack_trip_min: f32,
    pub tcp_rtt_ack_trip_max: f32,
    pub tcp_rtt_ack_trip_avg: f32,
    pub tcp_rtt_ack_trip_jit: f32,
    pub tcp_rtt_sseq_aa: f32,
    pub tcp_rtt_ack_jit_avg: f32,
}

impl TcpFlagsRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u16(self.tcp_f_stat);
        buf.append_u16(self.ip_min_id_delta);
        buf.append_u16(self.ip_max_id_delta);
        buf.append_u8(self.ip_min_ttl);
        buf.append_u8(self.ip_max_ttl);
        buf.append_u8(self.ip_ttl_chg);
        buf.append_u8(self.ip_tos);
        buf.append_u16(self.ip_flags);
        buf.append_u16(self.ip_opt_cnt);
        buf.append_u8(self.ip_opt_cpcl);
        buf.append_u32(self.ip_options);
        buf.append_u32(self.tcp_iseq);
        buf.append_u16(self.tcp_pseq_cnt);
        buf.append_u64(self.tcp_seq_sent_bytes);
        buf.append_u16(self.tcp_seq_fault_cnt);
        buf.append_u16(self.tcp_pack_cnt);
        buf.append_u64(self.tcp_ack_rcvd_bytes);
        buf.append_u16(self.tcp_ack_fault_cnt);
        buf.append_u32(self.tcp_win_tlen_max);
        buf.append_u32(self.tcp_init_win_sz);
        buf.append_f32(self.tcp_avg_win_sz);
        buf.append_u32(self.tcp_min_win_sz);
        buf.append_u32(self.tcp_max_win_sz);
        buf.append_u16(self.tcp_win_dwn_cnt);
        buf.append_u16(self.tcp_win_up_cnt);
        buf.append_u16(self.tcp_win_chg_cnt);
        buf.append_f32(self.tcp_win_thr_ratio);
        buf.append_u16(self.tcp_flags);
        buf.append_u16(self.tcp_anomaly);
        for c in self.tcp_flag_cnt {
            buf.append_u16(c);
        }
        buf.append_str(&self.tcp_ja4t);
        buf.append_u16(self.tcp_opt_pkt_cnt);
        buf.append_u16(self.tcp_opt_cnt);
        buf.append_u32(self.tcp_options);
        buf.append_u16(self.tcp_mss);
        buf.append_u16(self.tcp_ws);
        buf.append_u16(self.tcp_mptcp_type_bf);
        buf.append_u8(self.tcp_mptcp_flags);
        buf.append_u8(self.tcp_mptcp_aid);
        buf.append_u8(self.tcp_mptcp_dss_flags);
        buf.append_u32(self.tcp_tm_s);
        buf.append_u32(self.tcp_tm_er);
        buf.append_f32(self.tcp_clock_incr);
        buf.append_f64(self.tcp_uptime);
        buf.append_time(self.tcp_boot_time);
        buf.append_f32(self.tcp_ssasaa_trip);
        buf.append_f32(self.tcp_rtt_ack_trip_min);
        buf.append_f32(self.tcp_rtt_ack_trip_max);
        buf.append_f32(self.tcp_rtt_ack_trip_avg);
        buf.append_f32(self.tcp_rtt_ack_trip_jit);
        buf.append_f32(self.tcp_rtt_sseq_aa);
        buf.append_f32(self.tcp_rtt_ack_jit_avg);
    }
}

/// Outcome of the per-packet hook the dispatcher acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpHookResult {
    /// RST seen, or FIN-ACK observed in both directions: natural end.
    pub teardown: bool,
    /// Capture clock ran backwards on this flow.
    pub timejump: bool,
}

#[derive(Debug)]
pub struct TcpFlagsDissector {
    slots: Vec<Slot>,
    win_min: u32,
    scan_pmax: u64,
    retry_factor: f64,
    syn_retry_secs: f64,
    verify_checksums: bool,
    // process-wide aggregates
    agg_ip_flags: u16,
    agg_ip_tos: u8,
    agg_stat: u16,
    agg_flags: u16,
    agg_anomaly: u16,
    total_scans: u64,
    total_succ_scans: u64,
    total_retries: u64,
    total_syn_retries: u64,
    win_below_cnt: u64,
    tcp_pkt_cnt: u64,
    // monitoring deltas
    last_scans: u64,
    last_succ_scans: u64,
    last_retries: u64,
    last_syn_retries: u64,
}

impl TcpFlagsDissector {
    pub fn new(cfg: &AnalyzerConfig) -> TcpFlagsDissector {
        TcpFlagsDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            win_min: cfg.win_min,
            scan_pmax: cfg.scan_pmax,
            retry_factor: cfg.retry_factor,
            syn_retry_secs: cfg.syn_retry_secs,
            verify_checksums: cfg.verify_checksums,
            agg_ip_flags: 0,
            agg_ip_tos: 0,
            agg_stat: 0,
            agg_flags: 0,
            agg_anomaly: 0,
            total_scans: 0,
            total_succ_scans: 0,
            total_retries: 0,
            total_syn_retries: 0,
            win_below_cnt: 0,
            tcp_pkt_cnt: 0,
            last_scans: 0,
            last_succ_scans: 0,
            last_retries: 0,
            last_syn_retries: 0,
        }
    }

    pub fn reset_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
        }
    }

    pub fn on_new_flow(&mut self, pkt: &PacketRecord<'_>, idx: usize, flow: &FlowRecord) {
        let Some(slot) = self.slots.get_mut(idx) else { return };
        slot.last_pkt_time = pkt.ts;

        if flow.status.has(FlowStatus::L2_FLOW) {
            return;
        }

        let ttl = pkt.ip_ttl().unwrap_or(0);
        slot.ip_ttl_last = ttl;
        slot.ip_ttl_min = ttl;
        slot.ip_ttl_max = ttl;
        if let Some(v4) = pkt.ipv4 {
            slot.ip_id_last = v4.id;
        }

        let Some(tcp) = pkt.tcp() else { return };
        slot.seq_init = tcp.seq;
        slot.seq_last = tcp.seq;
        slot.seq_next = tcp.seq;
        slot.seq_max = tcp.seq;
        slot.ack_last = tcp.ack;
        if tcp.flags() == TH_SYN && pkt.snap_l7_len() > 0 {
            slot.anomaly |= TCP_SYN_L7;
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_layer4(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        flow: &mut FlowRecord,
        opp_idx: Option<usize>,
        opp_last_seen: Option<Timeval>,
        mut pkt_file: Option<&mut PacketFile>,
    ) -> TcpHookResult {
        let mut result = TcpHookResult::default();
        if idx >= self.slots.len() {
            return result;
        }
        let retry_factor = self.retry_factor;
        let syn_retry_secs = self.syn_retry_secs;
        let win_min_thresh = self.win_min;

        let mut ip_flags: u16 = 0;
        let mut ip_id: u16 = 0;
        let mut ip_id_diff: i32 = 0;
        let mut ip_hdr_cksum: u16 = 0;
        let mut ip_cal_cksum: u16 = 0;
        let mut l4_hdr_cksum: u16 = 0;
        let mut l4_cal_cksum: u16 = 0;
        let mut ip_frag_raw: u16 = 0;
        let mut ttl: u8 = 0;
        let mut ip_tos: u8 = 0;

        let first_packet = {
            let slot = &self.slots[idx];
            slot.pkt_cnt == 0
        };

        // ---- IP layer ------------------------------------------------
        if let Some(v4) = pkt.ipv4 {
            ip_frag_raw = v4.frag;
            if v4.more_frags() {
                ip_flags |= IPF_FRAG_MF;
            }
            if v4.dont_frag() {
                ip_flags |= IPF_FRAG_DF;
            }
            if v4.frag & 0x8000 != 0 {
                ip_flags |= IPF_FRAG_RES;
            }
            ttl = v4.ttl;
            ip_tos = v4.tos;
            ip_id = v4.id;
            ip_hdr_cksum = v4.checksum;

            // IPv4 options walk with corrupt-length abort.
            let opt_len = v4.hdr_len.saturating_sub(20);
            if opt_len > 0 {
                if pkt.snap_l3_len() < v4.hdr_len || (v4.total_len as usize) < v4.hdr_len {
                    ip_flags |= IPF_OPT_CORRUPT;
                } else {
                    let opts = &pkt.l3_bytes()[20..20 + opt_len];
                    let slot = &mut self.slots[idx];
                    let mut i = 0usize;
                    while i < opts.len() && opts[i] > 0 {
                        slot.ip_cp_cl |= opts[i] & 0xe0;
                        slot.ip_options |= 1u32 << (opts[i] & 0x1f);
                        slot.ip_opt_cnt = slot.ip_opt_cnt.saturating_add(1);
                        if opts[i] > 1 {
                            let Some(&l) = opts.get(i + 1) else { break };
                            if l == 0 {
                                ip_flags |= IPF_OPT_CORRUPT;
                                break;
                            }
                            i += l as usize;
                        } else {
                            i += 1;
                        }
                    }
                }
            }

            // IP ID monotonicity; first packet is not assessable.
            if !first_packet && self.slots[idx].ip_id_valid {
                let last = self.slots[idx].ip_id_last;
                ip_id_diff = ip_id as i32 - last as i32;
                if ip_id < last {
                    if ip_id_diff < -32768 {
                        ip_flags |= IPF_ID_ROLLOVER;
                    } else {
                        ip_flags |= IPF_ID_OUT_ORDER;
                    }
                }
                let slot = &mut self.slots[idx];
                slot.ip_id_min_delta = slot.ip_id_min_delta.min(ip_id_diff);
                slot.ip_id_max_delta = slot.ip_id_max_delta.max(ip_id_diff);
            }

            // L3 header checksum.
            if pkt.snap_l3_len() < v4.hdr_len {
                ip_flags |= IPF_SNAP_HLEN_WARN | IPF_L3CHK_SUMERR;
            } else if self.verify_checksums {
                let hdr = &pkt.l3_bytes()[..v4.hdr_len];
                ip_cal_cksum = checksum::ipv4_header_checksum(hdr);
                if ip_cal_cksum != ip_hdr_cksum {
                    ip_flags |= IPF_L3CHK_SUMERR;
                }
            }
        } else if let Some(v6) = pkt.ipv6 {
            ttl = v6.hop_limit;
            ip_tos = v6.tclass;
            if let Some(f) = v6.frag {
                ip_frag_raw = f.offset << 3 | u16::from(f.more);
                if f.more {
                    ip_flags |= IPF_FRAG_MF;
                }
            }
        }

        // ---- L4 checksum (with fragment accumulation) ----------------
        if self.verify_checksums && (pkt.ipv4.is_some() || pkt.ipv6.is_some()) {
            let (err, cov_err, cap, cal) = self.l4_checksum(pkt, idx);
            l4_hdr_cksum = cap;
            l4_cal_cksum = cal;
            if err {
                ip_flags |= IPF_L4CHK_SUMERR;
            }
            if cov_err {
                ip_flags |= IPF_UDPLITE_COV_ERR;
            }
        }

        // ---- TTL tracking --------------------------------------------
        if pkt.ipv4.is_some() || pkt.ipv6.is_some() {
            let slot = &mut self.slots[idx];
            if !first_packet && ttl != slot.ip_ttl_last {
                slot.ip_ttl_chg = slot.ip_ttl_chg.saturating_add(1);
            }
            slot.ip_ttl_last = ttl;
            slot.ip_ttl_min = slot.ip_ttl_min.min(ttl);
            slot.ip_ttl_max = slot.ip_ttl_max.max(ttl);
            slot.ip_tos |= ip_tos;
            slot.ip_id_last = ip_id;
            slot.ip_id_valid |= pkt.ipv4.is_some();
        }

        // ---- inter-arrival -------------------------------------------
        let inter = {
            let slot = &self.slots[idx];
            pkt.ts.diff_secs(slot.last_pkt_time)
        };
        if !first_packet {
            if inter == 0.0 {
                ip_flags |= IPF_PKT_INTDIS;
            } else if inter < 0.0 {
                ip_flags |= IPF_PKT_INTDIS_NEG;
                flow.status.set(FlowStatus::TIMEJUMP);
                result.timejump = true;
            }
        }
        {
            let slot = &mut self.slots[idx];
            slot.last_pkt_time = pkt.ts;
            slot.ip_flags |= ip_flags;
            slot.pkt_cnt += 1;
            if slot.scan_pkt_cnt < self.scan_pmax + 2 {
                slot.scan_pkt_cnt += 1;
            }
        }

        // ---- RTT estimate (also seeds the opposite direction) --------
        if let (Some(o), Some(opp_seen)) = (opp_idx, opp_last_seen) {
            let own_pkt_cnt = self.slots[idx].pkt_cnt;
            let own_state = self.slots[idx].rtt_state;
            if own_state != RttState::Stop {
                let sample = pkt.ts.diff_secs(opp_seen).abs() as f32;
                let (_, opp_slot) = pair_mut(&mut self.slots, idx, Some(o));
                if let Some(opp) = opp_slot {
                    opp.rtt_min = opp.rtt_min.min(sample);
                    opp.rtt_max = opp.rtt_max.max(sample);
                    if matches!(opp.rtt_state, RttState::SynSt | RttState::SynAck)
                        && opp.pkt_cnt == 1
                    {
                        opp.trip = sample;
                        opp.rtt_avg = sample;
                    } else {
                        let d = sample - opp.rtt_avg;
                        opp.rtt_avg += d / own_pkt_cnt as f32;
                        opp.rtt_jit += (d * d - opp.rtt_jit) / own_pkt_cnt as f32;
                        opp.rtt_state = RttState::Ack;
                    }
                }
            }
        }

        let non_first_frag = pkt.status & crate::packet::PKT_FRAG_NOT_FIRST != 0;
        if pkt.l4_proto() != Some(L3_TCP) || non_first_frag {
            let slot = &mut self.slots[idx];
            if slot.pkt_cnt == 1 {
                slot.rtt_state = RttState::SynAck;
            } else if slot.rtt_state == RttState::SynAck {
                slot.rtt_state = RttState::Ack;
            }
            self.write_pkt_columns(
                &mut pkt_file,
                ip_tos,
                ip_id,
                ip_id_diff,
                ip_frag_raw,
                ttl,
                ip_hdr_cksum,
                ip_cal_cksum,
                l4_hdr_cksum,
                l4_cal_cksum,
                ip_flags,
                None,
            );
            return result;
        }

        // ---- TCP only below ------------------------------------------
        self.tcp_pkt_cnt += 1;
        let Some(tcp) = pkt.tcp() else {
            self.slots[idx].stat |= TCPF_SNAP;
            self.write_pkt_columns(
                &mut pkt_file,
                ip_tos,
                ip_id,
                ip_id_diff,
                ip_frag_raw,
                ttl,
                ip_hdr_cksum,
                ip_cal_cksum,
                l4_hdr_cksum,
                l4_cal_cksum,
                ip_flags,
                None,
            );
            return result;
        };

        let mut f_stat: u16 = TCPF_DET;
        let mut anomaly: u16 = 0;
        let tf = tcp.flags();
        let l7_len = pkt.l7_len;
        let mut flags16 = tf as u16;

        // Flag-class aggregation and per-flag counters.
        if tf == 0 {
            flags16 |= TCP_NULL;
            anomaly |= TCP_SCAN_DET;
            self.bump_flag_cnt(idx, 11);
        } else if tf == TH_XMAS {
            flags16 |= TCP_XMAS;
            anomaly |= TCP_SCAN_DET;
            self.bump_flag_cnt(idx, 15);
        }
        for bit in 0..8 {
            if tf & (1 << bit) != 0 {
                self.bump_flag_cnt(idx, bit as usize);
            }
        }

        match tf & TH_ARSF {
            TH_SYN => {
                let state = self.slots[idx].rtt_state;
                if state == RttState::SynSt {
                    if inter > syn_retry_secs {
                        self.total_syn_retries += 1;
                        anomaly |= TCP_SYN_RETRY;
                    } else {
                        anomaly |= TCP_SCAN_DET;
                        self.total_scans += 1;
                    }
                }
                if l7_len > 0 {
                    anomaly |= TCP_SYN_L7;
                }
                self.slots[idx].rtt_state = RttState::SynSt;
            }
            f if f == TH_SYN | TH_ACK => {
                flags16 |= TCP_SYN_ACK;
                self.slots[idx].rtt_state = RttState::SynAck;
                self.bump_flag_cnt(idx, 9);
            }
            TH_ACK => {
                if self.slots[idx].rtt_state == RttState::SynAck {
                    self.slots[idx].rtt_state = RttState::Ack;
                }
                if let Some(o) = opp_idx {
                    let (slot, opp) = pair_mut(&mut self.slots, idx, Some(o));
                    if let Some(opp) = opp {
                        if matches!(opp.rtt_state, RttState::None | RttState::SynAck) {
                            opp.rtt_state = RttState::Ack;
                        }
                        opp.win_tlen = 0;
                    }
                    slot.win_tlen = slot.win_tlen.saturating_add(l7_len as u32);
                    slot.win_tlen_max = slot.win_tlen_max.max(slot.win_tlen);
                }
            }
            f if f == TH_FIN | TH_ACK => {
                flags16 |= TCP_FIN_ACK;
                self.slots[idx].rtt_state = RttState::Stop;
                self.bump_flag_cnt(idx, 8);
            }
            f if f == TH_RST | TH_ACK => {
                flags16 |= TCP_RST_ACK;
                self.slots[idx].rtt_state = RttState::Stop;
                self.bump_flag_cnt(idx, 10);
            }
            f if f == TH_SYN | TH_FIN => {
                flags16 |= TCP_SYN_FIN;
                self.slots[idx].rtt_state = RttState::Stop;
                self.bump_flag_cnt(idx, 12);
            }
            f if f == TH_SYN | TH_FIN | TH_RST => {
                flags16 |= TCP_SYN_FIN_RST;
                self.slots[idx].rtt_state = RttState::Stop;
                self.bump_flag_cnt(idx, 13);
            }
            f if f == TH_RST | TH_FIN => {
                flags16 |= TCP_RST_FIN;
                self.slots[idx].rtt_state = RttState::Stop;
                self.bump_flag_cnt(idx, 14);
            }
            _ => {
                self.slots[idx].rtt_state = RttState::Stop;
            }
        }

        // ---- options walk --------------------------------------------
        let l4_hdr_len = tcp.header_len();
        let opt_len = l4_hdr_len.saturating_sub(20);
        let mut tcp_opt_len_out = 0usize;
        if opt_len > 0 {
            let l4_bytes = pkt.l4_bytes();
            if l4_bytes.len() < l4_hdr_len {
                f_stat |= TCPF_OPT_CORRUPT;
            } else {
                tcp_opt_len_out = opt_len;
                let opts = &l4_bytes[20..l4_hdr_len];
                self.slots[idx].opt_pkt_cnt = self.slots[idx].opt_pkt_cnt.saturating_add(1);
                let mut i = 0usize;
                while i < opts.len() && opts[i] > 0 {
                    let kind = opts[i];
                    {
                        let slot = &mut self.slots[idx];
                        slot.opt_cnt = slot.opt_cnt.saturating_add(1);
                        if tf & TH_SYN != 0 && slot.ja4t_opts.len() < JA4T_OPT_MAX {
                            slot.ja4t_opts.push(kind);
                        }
                        if kind < 31 {
                            slot.options |= 1u32 << kind;
                        } else {
                            slot.options |= 1u32 << 31;
                        }
                    }
                    let olen = if kind > 1 { opts.get(i + 1).copied().unwrap_or(0) } else { 1 };
                    if kind > 1 && olen == 0 {
                        f_stat |= TCPF_OPT_CORRUPT;
                        break;
                    }
                    match kind {
                        2 => {
                            if let (Some(&a), Some(&b)) = (opts.get(i + 2), opts.get(i + 3)) {
                                self.slots[idx].mss = u16::from_be_bytes([a, b]);
                            }
                        }
                        5 => f_stat |= TCPF_SACK,
                        3 if tf & TH_SYN != 0 => {
                            if let Some(&ws) = opts.get(i + 2) {
                                self.slots[idx].win_scale = ws.min(14);
                                if tf & TH_ARSF == TH_SYN | TH_ACK {
                                    self.slots[idx].stat |= TCPF_WS_USED;
                                    f_stat |= TCPF_WS_USED;
                                    if let Some(o) = opp_idx {
                                        let (_, opp) = pair_mut(&mut self.slots, idx, Some(o));
                                        if let Some(opp) = opp {
                                            opp.stat |= TCPF_WS_USED;
                                        }
                                    }
                                }
                            }
                        }
                        8 => {
                            if let Some(raw) = opts.get(i + 2..i + 10) {
                                let tm_s = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                                let tm_er = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
                                let slot = &mut self.slots[idx];
                                slot.tm_s = tm_s;
                                slot.tm_er = tm_er;
                                slot.tm_last_pkt = pkt.ts;
                                if tm_s < slot.tm_s_last {
                                    f_stat |= TCPF_TM_DEC;
                                } else {
                                    slot.tm_s_last = tm_s;
                                    if slot.stat & TCPF_TM_INIT == 0 {
                                        slot.tm_s_init = tm_s;
                                        slot.tm_first_pkt = pkt.ts;
                                        slot.stat |= TCPF_TM_INIT;
                                        f_stat |= TCPF_TM_INIT;
                                    }
                                }
                            }
                        }
                        30 => {
                            if let Some(&sub) = opts.get(i + 2) {
                                let st = (sub & 0xf0) >> 4;
                                let slot = &mut self.slots[idx];
                                slot.mp_type_bf |= 1 << st;
                                match st {
                                    // MP_CAPABLE
                                    0 => {
                                        if let Some(&f) = opts.get(i + 3) {
                                            slot.mp_flags |= f;
                                        }
                                    }
                                    // MP_JOIN / MP_PRIO
                                    1 | 5 => {
                                        if olen <= 16 {
                                            slot.mp_flags |= sub & 0x0f;
                                            if let Some(&aid) = opts.get(i + 3) {
                                                slot.mp_aid = aid;
                                            }
                                        }
                                    }
                                    // DSS
                                    2 => {
                                        if let Some(&f) = opts.get(i + 3) {
                                            slot.mp_dss_flags |= f & 0x1f;
                                        }
                                    }
                                    // ADD_ADDR / REMOVE_ADDR
                                    3 | 4 => {
                                        if let Some(&aid) = opts.get(i + 3) {
                                            slot.mp_aid = aid;
                                        }
                                    }
                                    _ => {}
                                }
                                f_stat |= TCPF_MPTCP;
                            }
                        }
                        _ => {}
                    }
                    i += olen as usize;
                }
            }
        }

        // ---- window engine -------------------------------------------
        let mut win = tcp.window as u32;
        let mut ws_factor: u16 = 0;
        if self.slots[idx].stat & TCPF_WS_USED != 0 {
            ws_factor = 1u16 << self.slots[idx].win_scale.min(14);
            win *= ws_factor as u32;
        }

        if tf & TH_SYN_FIN_RST == 0 && win < win_min_thresh {
            self.win_below_cnt += 1;
            self.slots[idx].win_min_cnt += 1;
            f_stat |= TCPF_WIN_BELOW_MIN;
        }

        {
            let slot = &mut self.slots[idx];
            if !slot.win_seen {
                slot.win_seen = true;
                slot.win_init = win;
                slot.win_min = win;
                slot.win_max = win;
                slot.win_last = win;
                slot.win_avg = win as f32;
            } else {
                slot.win_avg = slot.win_avg * 0.7 + win as f32 * 0.3;
                if slot.win_going_up {
                    if win >= slot.win_last {
                        if win > slot.win_last {
                            slot.win_up_cnt = slot.win_up_cnt.saturating_add(1);
                            slot.win_max = slot.win_max.max(win);
                        }
                    } else {
                        slot.win_chg_cnt = slot.win_chg_cnt.saturating_add(1);
                        slot.win_dwn_cnt = slot.win_dwn_cnt.saturating_add(1);
                        slot.win_min = slot.win_min.min(win);
                        slot.win_going_up = false;
                    }
                } else if win <= slot.win_last {
                    if win < slot.win_last {
                        slot.win_dwn_cnt = slot.win_dwn_cnt.saturating_add(1);
                        slot.win_min = slot.win_min.min(win);
                    }
                } else {
                    slot.win_chg_cnt = slot.win_chg_cnt.saturating_add(1);
                    slot.win_up_cnt = slot.win_up_cnt.saturating_add(1);
                    slot.win_max = slot.win_max.max(win);
                    slot.win_going_up = true;
                }
            }
        }

        // ---- sequence / ACK engine -----------------------------------
        let seq = tcp.seq;
        let ack = tcp.ack;

        // Zero-window probes.
        if let Some(o) = opp_idx
            && tf & TH_SYN_FIN_RST == 0
        {
            let (_, opp) = pair_mut(&mut self.slots, idx, Some(o));
            if let Some(opp) = opp {
                if opp.win_seen && opp.win_last == 0 && l7_len == 1 {
                    f_stat |= TCPF_WIN_0PRB;
                } else if opp.stat_last & TCPF_WIN_0PRB != 0 && win == 0 && l7_len == 0 {
                    f_stat |= TCPF_WIN_0PRB_ACK;
                }
            }
        }

        if tf & TH_ACK != 0 && f_stat & (TCPF_WIN_0PRB | TCPF_WIN_0PRB_ACK) == 0 {
            // Keep-alives.
            if l7_len <= 1 && tf & TH_SYN_FIN_RST == 0 {
                if seq == self.slots[idx].seq_max.wrapping_sub(1) {
                    anomaly |= TCP_KPALV;
                } else if let Some(o) = opp_idx {
                    let (_, opp) = pair_mut(&mut self.slots, idx, Some(o));
                    if let Some(opp) = opp
                        && opp.seq_next == ack.wrapping_sub(1)
                    {
                        anomaly |= TCP_KPALV_ACK;
                    }
                }
            }

            // Duplicate ACK chain and retransmissions.
            if self.slots[idx].ack_last == ack
                && anomaly & (TCP_KPALV | TCP_KPALV_ACK) == 0
            {
                if !first_packet && tf & TH_SYN_FIN_RST == 0 && l7_len == 0 {
                    let slot = &self.slots[idx];
                    if slot.win_last == win
                        || (slot.stat & TCPF_WS_USED != 0
                            && slot.win_last * ws_factor as u32 == win)
                    {
                        anomaly |= TCP_ACK_DUP;
                        self.slots[idx].ack_fault_cnt =
                            self.slots[idx].ack_fault_cnt.saturating_add(1);
                    } else if seq == self.slots[idx].seq_next {
                        f_stat |= TCPF_WIN_UPD;
                    }
                }

                if tf & TH_SYN_FIN_RST == 0
                    && seq_lt(seq, self.slots[idx].seq_max)
                {
                    anomaly |= TCP_SEQ_OUTORDR;
                }
                if seq_lt(seq, self.slots[idx].seq_next) {
                    let rtt_sum = match opp_idx {
                        Some(o) => {
                            self.slots[idx].rtt_avg
                                + self.slots.get(o).map(|s| s.rtt_avg).unwrap_or(0.0)
                        }
                        None => self.slots[idx].rtt_avg,
                    };
                    let threshold = if rtt_sum > 0.0 {
                        rtt_sum as f64 * retry_factor
                    } else {
                        retry_factor
                    };
                    if inter > threshold && self.slots[idx].win_last == win {
                        anomaly |= TCP_SEQ_TRETRY;
                        self.total_retries += 1;
                        self.slots[idx].seq_fault_cnt =
                            self.slots[idx].seq_fault_cnt.saturating_add(1);
                    }
                }
            }

            // Fast retransmission after the peer's duplicate ACKs.
            if let Some(o) = opp_idx
                && let Some(opp) = self.slots.get(o)
                && opp.anomaly_last & TCP_ACK_DUP != 0
                && seq == opp.ack_last
                && (l7_len > 0 || tf & (TH_SYN | TH_FIN) != 0)
                && seq_lt(seq, self.slots[idx].seq_next)
            {
                anomaly |= TCP_SEQ_FRETRY;
                self.total_retries += 1;
                self.slots[idx].seq_fault_cnt = self.slots[idx].seq_fault_cnt.saturating_add(1);
            }

            // Peer already acknowledged past this segment.
            if let Some(o) = opp_idx
                && let Some(opp) = self.slots.get(o)
                && seq_lt(seq, opp.ack_last)
                && self.slots[idx].ack_last == ack
            {
                anomaly |= TCP_SEQ_MESS;
            }

            if seq == self.slots[idx].seq_next {
                self.slots[idx].p_seq_cnt = self.slots[idx].p_seq_cnt.saturating_add(1);
            }

            // ACK of data never captured.
            if let Some(o) = opp_idx
                && let Some(opp) = self.slots.get(o)
                && opp.pkt_cnt > 0
                && seq_lt(opp.seq_max, ack)
            {
                anomaly |= TCP_ACK_UNSEEN;
                self.slots[idx].ack_fault_cnt = self.slots[idx].ack_fault_cnt.saturating_add(1);
            }

            // Sequence jump: segments missing from the capture.
            if self.slots[idx].flags_last & TH_SYN_FIN_RST == 0
                && !first_packet
                && seq_gt(seq, self.slots[idx].seq_max)
            {
                anomaly |= TCP_PKT_NCAP;
            }

            // Cumulative sent/acked byte accounting.
            {
                let slot = &mut self.slots[idx];
                if slot.seq_last != 0 {
                    let sd = seq.wrapping_sub(slot.seq_last) as i32;
                    let mut seq_diff = if sd > 0 { sd as u64 } else { 0 };
                    if slot.flags_last & TH_SYN_FIN_RST != 0 && sd == 1 {
                        seq_diff = 0;
                    }
                    slot.seq_sent_bytes = slot.seq_sent_bytes.saturating_add(seq_diff);
                }
            }
            {
                let last_flags_opp = opp_idx
                    .and_then(|o| self.slots.get(o))
                    .map(|s| s.flags_last)
                    .unwrap_or(0);
                let slot = &mut self.slots[idx];
                if slot.ack_last != 0 {
                    let ad = ack.wrapping_sub(slot.ack_last) as i32;
                    let mut ack_diff = if ad > 0 { ad as u64 } else { 0 };
                    if (slot.flags_last & TH_SYN_FIN_RST != 0
                        || last_flags_opp & TH_SYN_FIN_RST != 0)
                        && ad == 1
                    {
                        ack_diff = 0;
                    }
                    slot.ack_rcvd_bytes = slot.ack_rcvd_bytes.saturating_add(ack_diff);
                }
                slot.p_ack_cnt = slot.p_ack_cnt.saturating_add(1);
            }
        }

        // Receive-window fill.
        if let Some(o) = opp_idx
            && let Some(opp) = self.slots.get(o)
            && f_stat & (TCPF_WIN_0PRB | TCPF_WIN_0PRB_ACK) == 0
            && opp.win_seen
            && self.slots[idx].win_tlen >= opp.win_last
            && opp.flags_last & TH_RST == 0
            && self.slots[idx].flags_agg & TH_SYN as u16 != 0
        {
            f_stat |= TCPF_WIN_FILL;
        }

        self.write_pkt_columns(
            &mut pkt_file,
            ip_tos,
            ip_id,
            ip_id_diff,
            ip_frag_raw,
            ttl,
            ip_hdr_cksum,
            ip_cal_cksum,
            l4_hdr_cksum,
            l4_cal_cksum,
            ip_flags,
            Some((seq, ack, self.slots[idx].seq_max, f_stat, flags16, anomaly, win, ws_factor, self.slots[idx].mss, tcp_opt_len_out)),
        );

        // ---- trailing per-packet state updates -----------------------
        {
            let slot = &mut self.slots[idx];
            slot.seq_last = seq;
            slot.seq_next = seq.wrapping_add(l7_len as u32);
            if tf & TH_SYN_FIN_RST != 0 {
                slot.seq_next = slot.seq_next.wrapping_add(1);
            } else if f_stat & TCPF_WIN_0PRB != 0 {
                slot.seq_next = slot.seq_next.wrapping_sub(1);
            }
            slot.ack_last = ack;
            if seq_gt(slot.seq_next, slot.seq_max) {
                slot.seq_max = slot.seq_next;
            }
            slot.win_last = win;
            slot.flags_last = tf;
            slot.flags_agg |= flags16;
            slot.anomaly |= anomaly;
            slot.anomaly_last = anomaly;
            slot.stat |= f_stat;
            slot.stat_last = f_stat;
        }

        // Natural end: any RST, or the final pure ACK after FIN-ACK was
        // seen in both directions.
        if tf & TH_RST != 0 {
            result.teardown = true;
        } else if tf & TH_ARSF == TH_ACK
            && self.slots[idx].flags_agg & TCP_FIN_ACK != 0
            && let Some(o) = opp_idx
            && let Some(opp) = self.slots.get(o)
            && opp.flags_agg & TCP_FIN_ACK != 0
        {
            result.teardown = true;
        }
        if result.teardown {
            flow.status.set(FlowStatus::NATURAL_END);
        }
        result
    }

    fn bump_flag_cnt(&mut self, idx: usize, which: usize) {
        if let Some(slot) = self.slots.get_mut(idx)
            && let Some(c) = slot.flag_cnt.get_mut(which)
        {
            *c = c.saturating_add(1);
        }
    }

    /// Verify the L4 checksum, accumulating across IPv4 fragments.
    /// Returns `(mismatch, coverage_error, captured, computed)`.
    fn l4_checksum(&mut self, pkt: &PacketRecord<'_>, idx: usize) -> (bool, bool, u16, u16) {
        let Some(l4) = pkt.l4 else {
            // Non-first fragment: accumulate payload only.
            if let Some(v4) = pkt.ipv4
                && v4.is_fragment()
                && self.slots[idx].frag_active
            {
                let payload = pkt.l7_bytes();
                let slot = &mut self.slots[idx];
                slot.frag_acc = checksum::ipsum_add(slot.frag_acc, payload);
                slot.frag_len += payload.len() as u32;
                if !v4.more_frags() {
                    return self.finalize_frag_checksum(pkt, idx);
                }
            }
            return (false, false, 0, 0);
        };

        let proto = l4.proto;
        let cksum_off = match proto {
            L3_TCP => 16,
            L3_UDP | L3_UDPLITE => 6,
            L3_ICMP | L3_IGMP => 2,
            L3_ICMP6 => 2,
            _ => return (false, false, 0, 0),
        };

        let l4_total = match (pkt.ipv4, pkt.ipv6) {
            (Some(v4), _) => (v4.total_len as usize).saturating_sub(v4.hdr_len),
            (_, Some(v6)) => (v6.payload_len as usize + 40).saturating_sub(v6.hdr_len),
            _ => return (false, false, 0, 0),
        };
        let seg = pkt.l4_bytes();
        let captured = seg
            .get(cksum_off..cksum_off + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or(0);

        // Fragmented datagram: start accumulation, finish on the last part.
        if let Some(v4) = pkt.ipv4
            && v4.more_frags()
        {
            let avail = seg.len().min(l4_total);
            let slot = &mut self.slots[idx];
            slot.frag_active = true;
            slot.frag_proto = proto;
            slot.frag_hdr_cksum = captured;
            slot.frag_acc = checksum::l4_sum_skip_checksum(0, &seg[..avail], cksum_off);
            slot.frag_len = avail as u32;
            return (false, false, captured, 0);
        }

        if seg.len() < l4_total {
            // Payload truncated by the snap length: cannot verify.
            self.slots[idx].ip_flags |= IPF_SNAP_HLEN_WARN;
            return (false, false, captured, 0);
        }

        let mut cov_err = false;
        let sum_len = if proto == L3_UDPLITE {
            let cov = seg
                .get(4..6)
                .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
                .unwrap_or(0);
            if cov == 0 {
                l4_total
            } else if cov < 8 || cov > l4_total {
                cov_err = true;
                l4_total
            } else {
                cov
            }
        } else {
            l4_total
        };

        let mut acc = match (proto, pkt.ipv4, pkt.ipv6) {
            (L3_ICMP | L3_IGMP, _, _) => 0,
            (_, Some(v4), _) => checksum::pseudo_header_v4(v4.src, v4.dst, proto, l4_total as u16),
            (_, _, Some(v6)) => checksum::pseudo_header_v6(v6.src, v6.dst, proto, l4_total as u32),
            _ => 0,
        };
        acc = checksum::l4_sum_skip_checksum(acc, &seg[..sum_len], cksum_off);
        let mut computed = checksum::ipsum_finish(acc);
        if computed == 0 {
            // All-ones sums encode as 0xffff on the wire.
            computed = 0xffff;
        }
        // UDP checksum 0 means "not computed".
        if proto == L3_UDP && captured == 0 {
            return (false, cov_err, captured, computed);
        }
        (computed != captured, cov_err, captured, computed)
    }

    fn finalize_frag_checksum(&mut self, pkt: &PacketRecord<'_>, idx: usize) -> (bool, bool, u16, u16) {
        let Some(v4) = pkt.ipv4 else { return (false, false, 0, 0) };
        let slot = &mut self.slots[idx];
        slot.frag_active = false;
        let pseudo =
            checksum::pseudo_header_v4(v4.src, v4.dst, slot.frag_proto, slot.frag_len as u16);
        let mut computed = checksum::ipsum_finish(slot.frag_acc.wrapping_add(pseudo));
        if computed == 0 {
            computed = 0xffff;
        }
        let captured = slot.frag_hdr_cksum;
        (computed != captured, false, captured, computed)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_pkt_columns(
        &self,
        pkt_file: &mut Option<&mut PacketFile>,
        ip_tos: u8,
        ip_id: u16,
        ip_id_diff: i32,
        ip_frag: u16,
        ttl: u8,
        ip_hdr_cksum: u16,
        ip_cal_cksum: u16,
        l4_hdr_cksum: u16,
        l4_cal_cksum: u16,
        ip_flags: u16,
        tcp: Option<(u32, u32, u32, u16, u16, u16, u32, u16, u16, usize)>,
    ) {
        let Some(pf) = pkt_file else { return };
        pf.push(format!("0x{ip_tos:02x}"));
        pf.push(format!("{ip_id}"));
        pf.push(format!("{ip_id_diff}"));
        pf.push(format!("0x{ip_frag:04x}"));
        pf.push(format!("{ttl}"));
        pf.push(format!("0x{ip_hdr_cksum:04x}"));
        pf.push(format!("0x{ip_cal_cksum:04x}"));
        pf.push(format!("0x{l4_hdr_cksum:04x}"));
        pf.push(format!("0x{l4_cal_cksum:04x}"));
        pf.push(format!("0x{ip_flags:04x}"));
        match tcp {
            Some((seq, ack, seq_max, f_stat, flags, anomaly, win, ws, mss, opt_len)) => {
                pf.push(format!("{seq}"));
                pf.push(format!("{ack}"));
                pf.push(format!("{seq_max}"));
                pf.push(format!("0x{f_stat:04x}"));
                pf.push(format!("0x{flags:04x}"));
                pf.push(format!("0x{anomaly:04x}"));
                pf.push(format!("{win}"));
                pf.push(format!("{ws}"));
                pf.push(format!("{mss}"));
                pf.push(format!("{opt_len}"));
            }
            None => pf.push_empty(10),
        }
    }

    /// Scan classification and record assembly at flow termination.
    pub fn on_flow_terminate(&mut self, idx: usize, flow: &FlowRecord) -> TcpFlagsRecord {
        let opp_idx = flow.opposite;

        // Scan detector: short, scan-flagged, never reached ACK state.
        let scan_flags = TH_SYN as u16 | TH_FIN as u16 | TCP_NULL | TCP_XMAS;
        let is_candidate = {
            let slot = &self.slots[idx];
            slot.stat & TCPF_DET != 0
                && slot.anomaly & TCP_SYN_RETRY == 0
                && slot.flags_agg & scan_flags != 0
                && slot.rtt_state != RttState::Ack
        };
        if is_candidate {
            {
                let slot = &mut self.slots[idx];
                if slot.scan_pkt_cnt < self.scan_pmax
                    && slot.anomaly & (TCP_SCAN_DET | TCP_SCAN_SU_DET) == 0
                {
                    slot.anomaly |= TCP_SCAN_DET;
                    self.total_scans += 1;
                }
            }
            if let Some(o) = opp_idx {
                let pmax = self.scan_pmax;
                let (slot, opp) = pair_mut(&mut self.slots, idx, Some(o));
                if let Some(opp) = opp {
                    let self_scan =
                        slot.anomaly & TCP_SCAN_DET != 0 && slot.anomaly & TCP_SCAN_SU_DET == 0;
                    let opp_scan = opp.anomaly & TCP_SCAN_DET != 0
                        && opp.anomaly & TCP_SCAN_SU_DET == 0
                        && slot.scan_pkt_cnt < pmax
                        && opp.scan_pkt_cnt < pmax;
                    if self_scan || opp_scan {
                        slot.anomaly |= TCP_SCAN_SU_DET;
                        opp.anomaly |= TCP_SCAN_SU_DET;
                        self.total_succ_scans += 1;
                    }
                }
            }
        }

        let slot = self.slots.get(idx).cloned().unwrap_or_default();
        self.agg_ip_flags |= slot.ip_flags;
        self.agg_ip_tos |= slot.ip_tos;
        self.agg_stat |= slot.stat;
        self.agg_flags |= slot.flags_agg;
        self.agg_anomaly |= slot.anomaly;

        // Boot-time estimation from the timestamp option.
        let (clock_incr, uptime, boot_time) = if slot.options & (1 << 8) != 0 {
            let span = slot.tm_last_pkt.diff_secs(slot.tm_first_pkt);
            let ticks = slot.tm_s.wrapping_sub(slot.tm_s_init);
            let f = if ticks != 0 {
                let raw = (span / ticks as f64) as f32;
                // Snap to known OS clock granularities.
                if raw < 0.002 {
                    0.001
                } else if raw < 0.005 {
                    0.004
                } else if raw < 0.02 {
                    0.01
                } else if raw < 0.7 {
                    0.1
                } else {
                    1.0
                }
            } else if slot.ip_ttl_min >= 128 {
                0.1
            } else if slot.ip_ttl_min >= 64 {
                0.004
            } else if slot.ip_ttl_min > 32 {
                0.01
            } else {
                0.001
            };
            let uptime = slot.tm_s as f64 * f as f64;
            (f, uptime, slot.tm_last_pkt.sub_secs_f64(uptime))
        } else {
            (0.0, 0.0, Timeval::ZERO)
        };

        // JA4T: initial window, SYN option kinds, MSS, window scale.
        let mut ja4t = format!("{}_", slot.win_init);
        if slot.ja4t_opts.is_empty() {
            ja4t.push_str("00_");
        } else {
            let kinds: Vec<String> = slot.ja4t_opts.iter().map(|k| k.to_string()).collect();
            ja4t.push_str(&kinds.join("-"));
            ja4t.push('_');
        }
        ja4t.push_str(&format!("{:02}_", slot.mss));
        if slot.stat & TCPF_WS_USED != 0 {
            ja4t.push_str(&slot.win_scale.to_string());
        } else {
            ja4t.push_str("00");
        }

        let thr_ratio = if slot.pkt_cnt > 0 {
            slot.win_min_cnt as f32 / slot.pkt_cnt as f32
        } else {
            0.0
        };

        let opp = opp_idx.and_then(|o| self.slots.get(o));
        let sseq_aa = match opp {
            None => 0.0,
            Some(opp) => {
                if flow.status.has(FlowStatus::DIR_INVERT) {
                    slot.rtt_avg + opp.rtt_avg
                } else {
                    slot.trip + opp.trip
                }
            }
        };
        let ack_jit_avg = match opp {
            Some(opp) if flow.status.has(FlowStatus::DIR_INVERT) => {
                (slot.rtt_jit + opp.rtt_jit).sqrt()
            }
            _ => 0.0,
        };

        TcpFlagsRecord {
            tcp_f_stat: slot.stat,
            ip_min_id_delta: if slot.ip_id_min_delta == i32::MAX {
                0xffff
            } else {
                slot.ip_id_min_delta as u16
            },
            ip_max_id_delta: if slot.ip_id_max_delta == i32::MIN {
                0
            } else {
                slot.ip_id_max_delta as u16
            },
            ip_min_ttl: if slot.ip_ttl_min == u8::MAX && slot.ip_ttl_max == 0 {
                0
            } else {
                slot.ip_ttl_min
            },
            ip_max_ttl: slot.ip_ttl_max,
            ip_ttl_chg: slot.ip_ttl_chg,
            ip_tos: slot.ip_tos,
            ip_flags: slot.ip_flags,
            ip_opt_cnt: slot.ip_opt_cnt,
            ip_opt_cpcl: slot.ip_cp_cl,
            ip_options: slot.ip_options,
            tcp_iseq: slot.seq_init,
            tcp_pseq_cnt: slot.p_seq_cnt,
            tcp_seq_sent_bytes: slot.seq_sent_bytes,
            tcp_seq_fault_cnt: slot.seq_fault_cnt,
            tcp_pack_cnt: slot.p_ack_cnt,
            tcp_ack_rcvd_bytes: slot.ack_rcvd_bytes,
            tcp_ack_fault_cnt: slot.ack_fault_cnt,
            tcp_win_tlen_max: slot.win_tlen_max,
            tcp_init_win_sz: slot.win_init,
            tcp_avg_win_sz: slot.win_avg,
            tcp_min_win_sz: if slot.win_min == u32::MAX { 0 } else { slot.win_min },
            tcp_max_win_sz: slot.win_max,
            tcp_win_dwn_cnt: slot.win_dwn_cnt,
            tcp_win_up_cnt: slot.win_up_cnt,
            tcp_win_chg_cnt: slot.win_chg_cnt,
            tcp_win_thr_ratio: thr_ratio,
            tcp_flags: slot.flags_agg,
            tcp_anomaly: slot.anomaly,
            tcp_flag_cnt: slot.flag_cnt,
            tcp_ja4t: ja4t,
            tcp_opt_pkt_cnt: slot.opt_pkt_cnt,
            tcp_opt_cnt: slot.opt_cnt,
            tcp_options: slot.options,
            tcp_mss: slot.mss,
            tcp_ws: if slot.stat & TCPF_WS_USED != 0 {
                1u16 << slot.win_scale.min(14)
            } else {
                0
            },
            tcp_mptcp_type_bf: slot.mp_type_bf,
            tcp_mptcp_flags: slot.mp_flags,
            tcp_mptcp_aid: slot.mp_aid,
            tcp_mptcp_dss_flags: slot.mp_dss_flags,
            tcp_tm_s: slot.tm_s,
            tcp_tm_er: slot.tm_er,
            tcp_clock_incr: clock_incr,
            tcp_uptime: uptime,
            tcp_boot_time: boot_time,
            tcp_ssasaa_trip: slot.trip,
            tcp_rtt_ack_trip_min: if slot.rtt_min == f32::MAX { 0.0 } else { slot.rtt_min },
            tcp_rtt_ack_trip_max: slot.rtt_max,
            tcp_rtt_ack_trip_avg: slot.rtt_avg,
            tcp_rtt_ack_trip_jit: slot.rtt_jit.max(0.0).sqrt(),
            tcp_rtt_sseq_aa: sseq_aa,
            tcp_rtt_ack_jit_avg: ack_jit_avg,
        }
    }

    pub fn total_scans(&self) -> u64 {
        self.total_scans
    }

    pub fn total_succ_scans(&self) -> u64 {
        self.total_succ_scans
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }

    pub fn aggregate_anomaly(&self) -> u16 {
        self.agg_anomaly
    }

    pub fn aggregate_stat(&self) -> u16 {
        self.agg_stat
    }

    pub fn aggregate_flags(&self) -> u16 {
        self.agg_flags
    }

    pub fn aggregate_ip_flags(&self) -> u16 {
        self.agg_ip_flags
    }
}

/// Wrap-aware sequence comparison, RFC 1982 style.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

impl Dissector for TcpFlagsDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("tcpFStat", ColumnType::H16, "tcpFlags status")
            .push("ipMindIPID", ColumnType::U16, "IP minimum delta IP ID")
            .push("ipMaxdIPID", ColumnType::U16, "IP maximum delta IP ID")
            .push("ipMinTTL", ColumnType::U8, "IP minimum TTL")
            .push("ipMaxTTL", ColumnType::U8, "IP maximum TTL")
            .push("ipTTLChg", ColumnType::U8, "IP TTL change count")
            .push("ipToS", ColumnType::H8, "IP type of service, aggregated")
            .push("ipFlags", ColumnType::H16, "IP aggregated flags")
            .push("ipOptCnt", ColumnType::U16, "IP options count")
            .push("ipOptCpCl", ColumnType::H8, "IP aggregated options copy and class")
            .push("ipOptions", ColumnType::H32, "IP aggregated option kinds")
            .push("tcpISeqN", ColumnType::U32, "TCP initial sequence number")
            .push("tcpPSeqCnt", ColumnType::U16, "TCP packets with the expected sequence")
            .push("tcpSeqSntBytes", ColumnType::U64, "TCP sent sequence-diff bytes")
            .push("tcpSeqFaultCnt", ColumnType::U16, "TCP sequence fault count")
            .push("tcpPAckCnt", ColumnType::U16, "TCP ACK-carrying packet count")
            .push("tcpFlwLssAckRcvdBytes", ColumnType::U64, "TCP flawless acked bytes")
            .push("tcpAckFaultCnt", ColumnType::U16, "TCP ACK fault count")
            .push("tcpWinTLenMax", ColumnType::U32, "TCP max bytes in flight since last ACK")
            .push("tcpInitWinSz", ColumnType::U32, "TCP initial window size")
            .push("tcpAvgWinSz", ColumnType::F32, "TCP average window size")
            .push("tcpMinWinSz", ColumnType::U32, "TCP minimum window size")
            .push("tcpMaxWinSz", ColumnType::U32, "TCP maximum window size")
            .push("tcpWinSzDwnCnt", ColumnType::U16, "TCP window decrease count")
            .push("tcpWinSzUpCnt", ColumnType::U16, "TCP window increase count")
            .push("tcpWinSzChgDirCnt", ColumnType::U16, "TCP window direction change count")
            .push("tcpWinSzThRt", ColumnType::F32, "TCP packets below window threshold, ratio")
            .push("tcpFlags", ColumnType::H16, "TCP aggregated flags")
            .push("tcpAnomaly", ColumnType::H16, "TCP aggregated anomaly flags")
            .push(
                "tcpFlagCnt",
                ColumnType::Rep(vec![ColumnType::U16]),
                "TCP per-flag counters (8 single flags and 8 combinations)",
            )
            .push("tcpJA4T", ColumnType::Str, "TCP JA4T fingerprint")
            .push("tcpOptPktCnt", ColumnType::U16, "TCP option-bearing packet count")
            .push("tcpOptCnt", ColumnType::U16, "TCP options count")
            .push("tcpOptions", ColumnType::H32, "TCP aggregated option kinds")
            .push("tcpMSS", ColumnType::U16, "TCP maximum segment size")
            .push("tcpWS", ColumnType::U16, "TCP effective window scale factor")
            .push("tcpMPTBF", ColumnType::H16, "MPTCP subtype bitfield")
            .push("tcpMPF", ColumnType::H8, "MPTCP flags")
            .push("tcpMPAID", ColumnType::U8, "MPTCP address id")
            .push("tcpMPdssF", ColumnType::H8, "MPTCP DSS flags")
            .push("tcpTmS", ColumnType::U32, "TCP timestamp")
            .push("tcpTmER", ColumnType::U32, "TCP timestamp echo reply")
            .push("tcpEcI", ColumnType::F32, "TCP estimated clock increment")
            .push("tcpUtm", ColumnType::F64, "TCP estimated uptime, seconds")
            .push("tcpBtm", ColumnType::Time, "TCP estimated boot time")
            .push("tcpSSASAATrip", ColumnType::F32, "TCP handshake trip time")
            .push("tcpRTTAckTripMin", ColumnType::F32, "TCP ACK trip minimum")
            .push("tcpRTTAckTripMax", ColumnType::F32, "TCP ACK trip maximum")
            .push("tcpRTTAckTripAvg", ColumnType::F32, "TCP ACK trip average")
            .push("tcpRTTAckTripJitAvg", ColumnType::F32, "TCP ACK trip jitter")
            .push("tcpRTTSseqAA", ColumnType::F32, "TCP round-trip time estimate")
            .push("tcpRTTAckJitAvg", ColumnType::F32, "TCP round-trip jitter estimate");
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        report.line(PLUGIN, &format!("Aggregated ipFlags=0x{:04x}", self.agg_ip_flags))?;
        report.line(PLUGIN, &format!("Aggregated tcpFStat=0x{:04x}", self.agg_stat))?;
        report.line(PLUGIN, &format!("Aggregated tcpFlags=0x{:04x}", self.agg_flags))?;
        report.line(PLUGIN, &format!("Aggregated tcpAnomaly=0x{:04x}", self.agg_anomaly))?;
        report.line(PLUGIN, &format!("Aggregated ipToS=0x{:02x}", self.agg_ip_tos))?;
        if self.total_scans > 0 || self.total_succ_scans > 0 {
            report.line(
                PLUGIN,
                &format!(
                    "Number of TCP scans attempted, successful: {}, {} [{:.2}%]",
                    self.total_scans,
                    self.total_succ_scans,
                    pct(self.total_succ_scans, self.total_scans)
                ),
            )?;
        }
        if self.total_retries > 0 || self.total_syn_retries > 0 {
            report.line(
                PLUGIN,
                &format!(
                    "Number of TCP SYN retries, seq retries: {}, {}",
                    self.total_syn_retries, self.total_retries
                ),
            )?;
        }
        if self.win_below_cnt > 0 && self.tcp_pkt_cnt > 0 {
            report.line(
                PLUGIN,
                &format!(
                    "Number of windows below {}: {} [{:.2}%]",
                    self.win_min,
                    self.win_below_cnt,
                    pct(self.win_below_cnt, self.tcp_pkt_cnt)
                ),
            )?;
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => {
                "ipFlags\ttcpFStat\ttcpFlags\ttcpAnomaly\ttcpScan\ttcpSuccScan\ttcpSynRetries\ttcpSeqRetries"
                    .into()
            }
            MonitoringState::Value => {
                let row = format!(
                    "0x{:x}\t0x{:x}\t0x{:x}\t0x{:x}\t{}\t{}\t{}\t{}",
                    self.agg_ip_flags,
                    self.agg_stat,
                    self.agg_flags,
                    self.agg_anomaly,
                    self.total_scans - self.last_scans,
                    self.total_succ_scans - self.last_succ_scans,
                    self.total_syn_retries - self.last_syn_retries,
                    self.total_retries - self.last_retries,
                );
                self.last_scans = self.total_scans;
                self.last_succ_scans = self.total_succ_scans;
                self.last_syn_retries = self.total_syn_retries;
                self.last_retries = self.total_retries;
                row
            }
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "tcpIpFlags", self.agg_ip_flags as u64);
        crate::state::push_entry(out, "tcpFStat", self.agg_stat as u64);
        crate::state::push_entry(out, "tcpFlags", self.agg_flags as u64);
        crate::state::push_entry(out, "tcpAnomaly", self.agg_anomaly as u64);
        crate::state::push_entry(out, "tcpScans", self.total_scans);
        crate::state::push_entry(out, "tcpSuccScans", self.total_succ_scans);
        crate::state::push_entry(out, "tcpRetries", self.total_retries);
        crate::state::push_entry(out, "tcpSynRetries", self.total_syn_retries);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "tcpIpFlags") {
            self.agg_ip_flags |= v as u16;
        }
        if let Some(v) = crate::state::lookup(blob, "tcpFStat") {
            self.agg_stat |= v as u16;
        }
        if let Some(v) = crate::state::lookup(blob, "tcpFlags") {
            self.agg_flags |= v as u16;
        }
        if let Some(v) = crate::state::lookup(blob, "tcpAnomaly") {
            self.agg_anomaly |= v as u16;
        }
        if let Some(v) = crate::state::lookup(blob, "tcpScans") {
            self.total_scans = v;
        }
        if let Some(v) = crate::state::lookup(blob, "tcpSuccScans") {
            self.total_succ_scans = v;
        }
        if let Some(v) = crate::state::lookup(blob, "tcpRetries") {
            self.total_retries = v;
        }
        if let Some(v) = crate::state::lookup(blob, "tcpSynRetries") {
            self.total_syn_retries = v;
        }
    }
}

pub const TCP_PKT_COLUMNS: [&str; 20] = [
    "ipToS",
    "ipID",
    "ipIDDiff",
    "ipFrag",
    "ipTTL",
    "ipHdrChkSum",
    "ipCalChkSum",
    "l4HdrChkSum",
    "l4CalChkSum",
    "ipFlags",
    "seq",
    "ack",
    "seqMax",
    "tcpFStat",
    "tcpFlags",
    "tcpAnomaly",
    "tcpWin",
    "tcpWS",
    "tcpMSS",
    "tcpOptLen",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_aware_comparison() {
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(seq_gt(0x10, 0xffff_fff0));
        assert!(!seq_lt(5, 5));
        assert!(!seq_gt(5, 5));
    }

    #[test]
    fn boot_time_band_snapping() {
        // The bands collapse measured increments onto known OS clocks.
        let bands = [
            (0.0011f64, 0.001f32),
            (0.0045, 0.004),
            (0.009, 0.01),
            (0.09, 0.1),
            (0.5, 0.1),
            (0.9, 1.0),
        ];
        for (raw, want) in bands {
            let raw = raw as f32;
            let snapped = if raw < 0.002 {
                0.001
            } else if raw < 0.005 {
                0.004
            } else if raw < 0.02 {
                0.01
            } else if raw < 0.7 {
                0.1
            } else {
                1.0
            };
            assert_eq!(snapped, want);
        }
    }
}
