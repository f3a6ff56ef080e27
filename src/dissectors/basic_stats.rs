//! Per-flow packet/byte counters and running statistics.
//!
//! Length and inter-arrival aggregates use Welford-style one-division
//! updates so a flow of any size costs O(1) per packet. The byte semantics
//! (which layer "length" means) come from the configuration, as do the
//! optional modulo and exclusion window.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;

use crate::AnalyzerError;
use crate::config::{AnalyzerConfig, LengthLayer};
use crate::dispatcher::{Dissector, HookVerdict};
use crate::flow::{FlowDir, FlowRecord};
use crate::output::{ColumnType, MonitoringState, OutputBuffer, Report, Schema, pct};
use crate::packet::PacketRecord;
use crate::time::Timeval;

const PLUGIN: &str = "basicStats";

/// Running min/max/mean/variance/skewness/kurtosis over one series.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Welford {
    pub min: f32,
    pub max: f32,
    pub avg: f32,
    pub var: f32,
    pub skew: f32,
    pub kur: f32,
}

impl Default for Welford {
    fn default() -> Self {
        Welford { min: f32::MAX, max: 0.0, avg: 0.0, var: 0.0, skew: 0.0, kur: 0.0 }
    }
}

impl Welford {
    /// One sample with divisor `d` (the 1-based sample count).
    pub fn update(&mut self, x: f32, d: u64) {
        let d = d as f32;
        let m = x - self.avg;
        self.avg += m / d;
        self.var += (m * m - self.var) / d;
        self.skew += (m * m * m - self.skew) / d;
        self.kur += (m * m * m * m - self.kur) / d;
        if x < self.min {
            self.min = x;
        }
        if x > self.max {
            self.max = x;
        }
    }

    pub fn stddev(&self) -> f32 {
        if self.var > 0.0 { self.var.sqrt() } else { 0.0 }
    }

    fn min_or_zero(&self) -> f32 {
        if self.min == f32::MAX { 0.0 } else { self.min }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    pkts: u64,
    bytes: u64,
    /// Samples admitted by the exclusion window; divisor for the aggregates.
    pkts_filtered: u64,
    last: Timeval,
    pl: Welford,
    iat: Welford,
}

/// Flow-file record; also the JSON shape when records are retained.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BasicStatsRecord {
    pub num_pkts_snt: u64,
    pub num_bytes_snt: u64,
    pub num_pkts_rcvd: u64,
    pub num_bytes_rcvd: u64,
    pub min_pkt_sz: u16,
    pub max_pkt_sz: u16,
    pub avg_pkt_sz: f32,
    pub std_pkt_sz: f32,
    pub skew_pkt_sz: f32,
    pub kur_pkt_sz: f32,
    pub min_iat: f32,
    pub max_iat: f32,
    pub avg_iat: f32,
    pub std_iat: f32,
    pub skew_iat: f32,
    pub kur_iat: f32,
    pub pkts_per_sec: f32,
    pub bytes_per_sec: f32,
    pub pkt_asym: f32,
    pub byt_asym: f32,
}

impl BasicStatsRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u64(self.num_pkts_snt);
        buf.append_u64(self.num_bytes_snt);
        buf.append_u64(self.num_pkts_rcvd);
        buf.append_u64(self.num_bytes_rcvd);
        buf.append_u16(self.min_pkt_sz);
        buf.append_u16(self.max_pkt_sz);
        buf.append_f32(self.avg_pkt_sz);
        buf.append_f32(self.std_pkt_sz);
        buf.append_f32(self.skew_pkt_sz);
        buf.append_f32(self.kur_pkt_sz);
        buf.append_f32(self.min_iat);
        buf.append_f32(self.max_iat);
        buf.append_f32(self.avg_iat);
        buf.append_f32(self.std_iat);
        buf.append_f32(self.skew_iat);
        buf.append_f32(self.kur_iat);
        buf.append_f32(self.pkts_per_sec);
        buf.append_f32(self.bytes_per_sec);
        buf.append_f32(self.pkt_asym);
        buf.append_f32(self.byt_asym);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TalkerStats {
    pkts: u64,
    bytes: u64,
}

#[derive(Debug)]
pub struct BasicStatsDissector {
    slots: Vec<Slot>,
    length_layer: LengthLayer,
    length_modulo: Option<u16>,
    filter: Option<(u16, u16, bool)>,
    talker_max: usize,
    talkers_l3: HashMap<IpAddr, TalkerStats>,
    talkers_l2: HashMap<[u8; 6], TalkerStats>,
    talkers_full_warned: bool,
    total_pkts: u64,
    total_bytes: u64,
    saturated_flows: u64,
}

impl BasicStatsDissector {
    pub fn new(cfg: &AnalyzerConfig) -> BasicStatsDissector {
        BasicStatsDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            length_layer: cfg.length_layer,
            length_modulo: cfg.length_modulo,
            filter: cfg.length_filter,
            talker_max: cfg.talker_max,
            talkers_l3: HashMap::new(),
            talkers_l2: HashMap::new(),
            talkers_full_warned: false,
            total_pkts: 0,
            total_bytes: 0,
            saturated_flows: 0,
        }
    }

    fn pkt_len(&self, pkt: &PacketRecord<'_>) -> u64 {
        let len = match self.length_layer {
            LengthLayer::L2 => pkt.wire_len as u64,
            LengthLayer::L3 => match (pkt.ipv4, pkt.ipv6) {
                (Some(v4), _) => v4.total_len as u64,
                (_, Some(v6)) => v6.payload_len as u64 + 40,
                _ => pkt.wire_len as u64,
            },
            LengthLayer::L4 => match (pkt.ipv4, pkt.ipv6) {
                (Some(v4), _) => (v4.total_len as u64).saturating_sub(v4.hdr_len as u64),
                (_, Some(v6)) => (v6.payload_len as u64 + 40).saturating_sub(v6.hdr_len as u64),
                _ => 0,
            },
            LengthLayer::L7 => pkt.l7_len as u64,
        };
        match self.length_modulo {
            Some(m) if m > 1 => len % m as u64,
            _ => len,
        }
    }

    fn admits(&self, len: u64) -> bool {
        match self.filter {
            None => true,
            Some((lo, hi, invert)) => {
                let inside = len >= lo as u64 && len <= hi as u64;
                inside != invert
            }
        }
    }

    pub fn reset_slot(&mut self, idx: usize, ts: Timeval) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
            slot.last = ts;
        }
    }

    pub fn on_layer4(&mut self, pkt: &PacketRecord<'_>, idx: usize) -> HookVerdict {
        let len = self.pkt_len(pkt);
        let admit = self.admits(len);
        let Some(slot) = self.slots.get_mut(idx) else {
            return HookVerdict::Continue;
        };

        // Saturation forces flow removal before the counters can wrap.
        if u64::MAX - slot.bytes < len || slot.pkts == u64::MAX {
            self.saturated_flows += 1;
            return HookVerdict::RemoveFlow;
        }

        slot.pkts += 1;
        slot.bytes += len;
        self.total_pkts += 1;
        self.total_bytes += len;

        // The exclusion window gates both series; the admitted count is
        // the shared divisor. The first admitted packet contributes an
        // inter-arrival of zero against the flow creation time.
        if admit {
            slot.pkts_filtered += 1;
            slot.pl.update(len as f32, slot.pkts_filtered);
            let iat = pkt.ts.diff_secs(slot.last) as f32;
            slot.iat.update(iat.max(0.0), slot.pkts_filtered);
            slot.last = pkt.ts;
        }
        HookVerdict::Continue
    }

    /// Build the record; `opp` is this flow's opposite slot, when alive.
    pub fn on_flow_terminate(&mut self, idx: usize, flow: &FlowRecord) -> BasicStatsRecord {
        let opp = flow
            .opposite
            .and_then(|o| self.slots.get(o))
            .map(|s| (s.pkts, s.bytes));
        let slot = match self.slots.get(idx) {
            Some(s) => s.clone(),
            None => Slot::default(),
        };

        let dur = flow.duration().as_secs_f64();
        let (pps, bps) = if dur > 0.0 {
            ((slot.pkts as f64 / dur) as f32, (slot.bytes as f64 / dur) as f32)
        } else {
            (0.0, 0.0)
        };

        let (opp_pkts, opp_bytes) = opp.unwrap_or((0, 0));
        let asym = |a: u64, b: u64| -> f32 {
            if a + b == 0 { 0.0 } else { (a as f64 - b as f64) as f32 / (a + b) as f32 }
        };
        let mut pkt_asym = asym(slot.pkts, opp_pkts);
        let mut byt_asym = asym(slot.bytes, opp_bytes);
        if opp.is_none() && flow.dir == FlowDir::B {
            pkt_asym = -pkt_asym;
            byt_asym = -byt_asym;
        }

        self.track_talkers(flow, slot.pkts, slot.bytes);

        BasicStatsRecord {
            num_pkts_snt: slot.pkts,
            num_bytes_snt: slot.bytes,
            num_pkts_rcvd: opp_pkts,
            num_bytes_rcvd: opp_bytes,
            min_pkt_sz: slot.pl.min_or_zero() as u16,
            max_pkt_sz: slot.pl.max as u16,
            avg_pkt_sz: slot.pl.avg,
            std_pkt_sz: slot.pl.stddev(),
            skew_pkt_sz: slot.pl.skew,
            kur_pkt_sz: slot.pl.kur,
            min_iat: slot.iat.min_or_zero(),
            max_iat: slot.iat.max,
            avg_iat: slot.iat.avg,
            std_iat: slot.iat.stddev(),
            skew_iat: slot.iat.skew,
            kur_iat: slot.iat.kur,
            pkts_per_sec: pps,
            bytes_per_sec: bps,
            pkt_asym,
            byt_asym,
        }
    }

    /// Biggest-talker accounting, updated only at flow termination.
    fn track_talkers(&mut self, flow: &FlowRecord, pkts: u64, bytes: u64) {
        if pkts == 0 {
            return;
        }
        let mut full = false;
        if flow.status.has(crate::flow::FlowStatus::L2_FLOW) {
            if self.talkers_l2.len() < self.talker_max || self.talkers_l2.contains_key(&flow.eth_src)
            {
                let t = self.talkers_l2.entry(flow.eth_src).or_default();
                t.pkts += pkts;
                t.bytes += bytes;
            } else {
                full = true;
            }
        } else {
            let src = flow.key.src;
            if self.talkers_l3.len() < self.talker_max || self.talkers_l3.contains_key(&src) {
                let t = self.talkers_l3.entry(src).or_default();
                t.pkts += pkts;
                t.bytes += bytes;
            } else {
                full = true;
            }
        }
        if full && !self.talkers_full_warned {
            log::warn!("[{PLUGIN}] talker table full, new talkers are no longer tracked");
            self.talkers_full_warned = true;
        }
    }

    pub fn slot_counts(&self, idx: usize) -> (u64, u64) {
        self.slots.get(idx).map(|s| (s.pkts, s.bytes)).unwrap_or((0, 0))
    }
}

impl Dissector for BasicStatsDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("numPktsSnt", ColumnType::U64, "Number of transmitted packets")
            .push("numBytesSnt", ColumnType::U64, "Number of transmitted bytes")
            .push("numPktsRcvd", ColumnType::U64, "Number of received packets")
            .push("numBytesRcvd", ColumnType::U64, "Number of received bytes")
            .push("minPktSz", ColumnType::U16, "Minimum layer length")
            .push("maxPktSz", ColumnType::U16, "Maximum layer length")
            .push("avgPktSize", ColumnType::F32, "Average layer length")
            .push("stdPktSize", ColumnType::F32, "Standard deviation layer length")
            .push("skewPktSize", ColumnType::F32, "Skewness layer length")
            .push("kurPktSize", ColumnType::F32, "Kurtosis layer length")
            .push("minIAT", ColumnType::F32, "Minimum inter-arrival time")
            .push("maxIAT", ColumnType::F32, "Maximum inter-arrival time")
            .push("avgIAT", ColumnType::F32, "Average inter-arrival time")
            .push("stdIAT", ColumnType::F32, "Standard deviation inter-arrival time")
            .push("skewIAT", ColumnType::F32, "Skewness inter-arrival time")
            .push("kurIAT", ColumnType::F32, "Kurtosis inter-arrival time")
            .push("pktps", ColumnType::F32, "Sent packets per second")
            .push("bytps", ColumnType::F32, "Sent bytes per second")
            .push("pktAsm", ColumnType::F32, "Packet stream asymmetry")
            .push("bytAsm", ColumnType::F32, "Byte stream asymmetry");
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        if let Some((ip, t)) = self.talkers_l3.iter().max_by_key(|(_, t)| t.pkts) {
            report.line(
                PLUGIN,
                &format!(
                    "Biggest L3 talker by packets: {ip} ({} packets [{:.2}%])",
                    t.pkts,
                    pct(t.pkts, self.total_pkts)
                ),
            )?;
        }
        if let Some((ip, t)) = self.talkers_l3.iter().max_by_key(|(_, t)| t.bytes) {
            report.line(
                PLUGIN,
                &format!(
                    "Biggest L3 talker by bytes: {ip} ({} bytes [{:.2}%])",
                    t.bytes,
                    pct(t.bytes, self.total_bytes)
                ),
            )?;
        }
        if let Some((mac, t)) = self.talkers_l2.iter().max_by_key(|(_, t)| t.pkts) {
            report.line(
                PLUGIN,
                &format!(
                    "Biggest L2 talker by packets: {} ({} packets)",
                    fmt_mac(mac),
                    t.pkts
                ),
            )?;
        }
        if self.saturated_flows > 0 {
            report.line(
                PLUGIN,
                &format!("Flows force-removed on counter saturation: {}", self.saturated_flows),
            )?;
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "numPkts\tnumBytes".into(),
            MonitoringState::Value => format!("{}\t{}", self.total_pkts, self.total_bytes),
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "bsNumPkts", self.total_pkts);
        crate::state::push_entry(out, "bsNumBytes", self.total_bytes);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "bsNumPkts") {
            self.total_pkts = v;
        }
        if let Some(v) = crate::state::lookup(blob, "bsNumBytes") {
            self.total_bytes = v;
        }
    }
}

pub(crate) fn fmt_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_closed_form() {
        let xs = [4.0f32, 8.0, 6.0, 2.0];
        let mut w = Welford::default();
        for (i, x) in xs.iter().enumerate() {
            w.update(*x, i as u64 + 1);
        }
        assert_eq!(w.min, 2.0);
        assert_eq!(w.max, 8.0);
        assert!((w.avg - 5.0).abs() < 1e-5);
        // The zero-seeded recurrence gives 16, 16, 10.667, 12.
        assert!((w.var - 12.0).abs() < 1e-4);
        assert!((w.skew - 16.0).abs() < 1e-3);
        assert!((w.kur - 192.0).abs() < 1e-2);
    }

    #[test]
    fn welford_first_sample_seeds_from_zero() {
        let mut w = Welford::default();
        w.update(10.0, 1);
        assert_eq!(w.avg, 10.0);
        assert_eq!(w.var, 100.0);
        assert_eq!(w.min, 10.0);
        assert_eq!(w.max, 10.0);
    }
}
