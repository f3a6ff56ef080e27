//! Passive per-flow network traffic analyzer.
//!
//! Packets come in as `(timestamp, wire length, bytes)` tuples from the
//! capture collaborator; the engine demultiplexes them into bidirectional
//! flows and drives a fixed-order pipeline of protocol dissectors (ARP,
//! basic statistics, the TCP state engine, DHCP, OSPF, SMB, VoIP, TLS/Tor,
//! centrality, NetFlow export). Each dissector owns per-flow state and
//! serializes a typed record when its flow terminates.
//!
//! ```rust
//! use flow_dissector::{Analyzer, Timeval};
//!
//! let mut analyzer = Analyzer::builder()
//!     .with_max_flows(1024)
//!     .with_keep_records(true)
//!     .build()
//!     .expect("analyzer construction");
//!
//! // Feed frames as the capture hands them over.
//! analyzer.process_packet(Timeval::new(0, 0), 60, &[0u8; 60]).unwrap();
//!
//! let summary = analyzer.finalize().unwrap();
//! assert_eq!(summary.packets, 1);
//! ```

pub mod checksum;
pub mod config;
pub mod dispatcher;
pub mod dissectors;
pub mod flow;
pub mod output;
pub mod packet;
pub mod protocol;
pub mod state;
pub mod time;

use std::io::Write;

use serde::Serialize;

use crate::config::AnalyzerConfig;
use crate::dispatcher::{Dissector, HookVerdict};
use crate::dissectors::arp::{ARP_PKT_COLUMNS, ArpDissector, ArpRecord};
use crate::dissectors::basic_stats::{BasicStatsDissector, BasicStatsRecord};
use crate::dissectors::centrality::{CentralityDissector, CentralityRecord};
use crate::dissectors::dhcp::{DHCP_PKT_COLUMNS, DhcpDissector, DhcpRecord};
use crate::dissectors::netflow_export::{ExportSink, ExportStats, NetflowExporter};
use crate::dissectors::ospf::{OspfDissector, OspfRecord};
use crate::dissectors::smb::{SmbDissector, SmbRecord};
use crate::dissectors::tcp_flags::{TCP_PKT_COLUMNS, TcpFlagsDissector, TcpFlagsRecord};
use crate::dissectors::tor::{CertificateParser, NoCertParser, TorDissector, TorRecord};
use crate::dissectors::voip::{VoipDissector, VoipRecord};
use crate::flow::{FlowDir, FlowKey, FlowLookup, FlowStatus, FlowTable};
use crate::output::{
    FileManager, FlowWriter, MonitoringState, OutputBuffer, PacketFile, Report,
};
use crate::packet::PacketRecord;
pub use crate::time::Timeval;

/// Engine errors. Per-packet problems never surface here; they become
/// status bits on the affected flow. This type covers construction and I/O.
#[derive(Debug)]
pub enum AnalyzerError {
    InvalidConfig { context: String },
    Io { context: String, source: std::io::Error },
}

impl std::fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalyzerError::InvalidConfig { context } => {
                write!(f, "invalid configuration: {context}")
            }
            AnalyzerError::Io { context, source } => write!(f, "I/O error ({context}): {source}"),
        }
    }
}

impl std::error::Error for AnalyzerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AnalyzerError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Why a flow left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationCause {
    IdleTimeout,
    NaturalEnd,
    Forced,
    Evicted,
    EndOfCapture,
}

/// Typed per-flow output: the concatenation every dissector contributes to
/// the binary flow file, kept in memory when `keep_records` is on.
#[derive(Debug, Clone, Serialize)]
pub struct FlowOutput {
    pub findex: u64,
    pub key: FlowKey,
    pub dir: FlowDir,
    pub first_seen: Timeval,
    pub last_seen: Timeval,
    pub duration: Timeval,
    pub status: FlowStatus,
    pub cause: TerminationCause,
    pub basic_stats: BasicStatsRecord,
    pub tcp: TcpFlagsRecord,
    pub arp: ArpRecord,
    pub dhcp: DhcpRecord,
    pub ospf: OspfRecord,
    pub smb: SmbRecord,
    pub voip: VoipRecord,
    pub tor: TorRecord,
    pub centrality: CentralityRecord,
}

/// Process-wide aggregates: each is the OR of the corresponding per-flow
/// value across every terminated flow.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Aggregates {
    pub ip_flags: u16,
    pub tcp_f_stat: u16,
    pub tcp_flags: u16,
    pub tcp_anomaly: u16,
    pub arp_stat: u8,
    pub total_tcp_scans: u64,
    pub total_tcp_succ_scans: u64,
    pub total_tcp_retries: u64,
}

/// End-of-run summary.
#[derive(Debug, Default, Serialize)]
pub struct AnalyzerSummary {
    pub packets: u64,
    pub untracked_packets: u64,
    pub flows_created: u64,
    pub flows_terminated: u64,
    pub peak_open_files: u64,
    pub aggregates: Aggregates,
    pub export: ExportStats,
    /// Present when `keep_records` was enabled.
    pub records: Vec<FlowOutput>,
}

/// The engine: flow table plus every dissector in dependency order.
///
/// Field order is hook order: statistics run before the TCP engine, both
/// before the export sink; SIP state is updated before RTP correlation
/// reads it. Single-threaded by contract (§concurrency): one packet is
/// fully processed before the next is dequeued.
#[derive(Debug)]
pub struct Analyzer {
    cfg: AnalyzerConfig,
    table: FlowTable,
    basic_stats: BasicStatsDissector,
    tcp: TcpFlagsDissector,
    arp: ArpDissector,
    dhcp: DhcpDissector,
    ospf: OspfDissector,
    smb: SmbDissector,
    voip: VoipDissector,
    tor: TorDissector,
    centrality: CentralityDissector,
    exporter: Option<NetflowExporter>,
    files: FileManager,
    flow_writer: Option<FlowWriter>,
    packet_file: Option<PacketFile>,
    report: Option<Report>,
    buf: OutputBuffer,
    /// Pending IPv4 fragment trains: (src, dst, IP id) of the first
    /// fragment, so later fragments land in the same flow.
    frag_pending: std::collections::HashMap<(std::net::IpAddr, std::net::IpAddr, u16), (usize, u64)>,
    num_pkts: u64,
    untracked_pkts: u64,
    flows_created: u64,
    flows_terminated: u64,
    last_ts: Option<Timeval>,
    global_timejump: bool,
    monitoring_header_done: bool,
    records: Vec<FlowOutput>,
}

impl Analyzer {
    pub fn builder() -> AnalyzerBuilder {
        AnalyzerBuilder::default()
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.cfg
    }

    pub fn flow_count(&self) -> usize {
        self.table.len()
    }

    pub fn records(&self) -> &[FlowOutput] {
        &self.records
    }

    /// Process one captured frame. Packets must arrive in capture order;
    /// a backwards clock sets the global time-jump warning instead of
    /// failing.
    pub fn process_packet(
        &mut self,
        ts: Timeval,
        wire_len: u32,
        data: &[u8],
    ) -> Result<(), AnalyzerError> {
        self.num_pkts += 1;
        if let Some(last) = self.last_ts
            && ts < last
            && !self.global_timejump
        {
            self.global_timejump = true;
            log::warn!("[core] capture clock ran backwards at packet {}", self.num_pkts);
        }
        self.last_ts = Some(ts);

        // Age out idle flows first, on the capture clock.
        while let Some(idx) = self.table.oldest_expired(ts) {
            self.terminate_flow(idx, TerminationCause::IdleTimeout)?;
        }

        let pkt = PacketRecord::parse(ts, wire_len, data);

        // Non-first IPv4 fragments carry no ports; route them onto the flow
        // the first fragment registered.
        let frag_flow = self.resolve_fragment(&pkt);

        let (idx, is_new) = if let Some(idx) = frag_flow {
            self.table.touch(idx, ts);
            (idx, false)
        } else {
            let Some(key) = FlowKey::from_packet(&pkt, self.cfg.l2_flows) else {
                self.untracked_pkts += 1;
                return Ok(());
            };

            // Make room before creating a new flow in a full table.
            if self.table.is_full()
                && self.table.find(&key).is_none()
                && self.table.find(&key.reversed()).is_none()
                && let Some(victim) = self.table.lru_victim()
            {
                self.terminate_flow(victim, TerminationCause::Evicted)?;
            }

            let lookup = match self.table.lookup_or_create(key, ts) {
                Some(l) => l,
                None => {
                    self.untracked_pkts += 1;
                    return Ok(());
                }
            };
            match lookup {
                FlowLookup::Created(i) => (i, true),
                FlowLookup::Existing(i) => (i, false),
            }
        };

        // First fragment of a train: register it for the followers, keyed
        // by the packet's own addresses so direction does not matter.
        if let Some(v4) = pkt.ipv4
            && v4.more_frags()
            && v4.is_first_fragment()
            && self.frag_pending.len() < self.cfg.aux_table_size
            && let Some(flow) = self.table.get(idx)
        {
            self.frag_pending.insert(
                (
                    std::net::IpAddr::V4(v4.src.into()),
                    std::net::IpAddr::V4(v4.dst.into()),
                    v4.id,
                ),
                (idx, flow.findex),
            );
        }

        if is_new {
            self.flows_created += 1;
            if let (Some(eth), Some(flow)) = (pkt.eth, self.table.get_mut(idx)) {
                flow.eth_src = eth.src;
                flow.eth_dst = eth.dst;
            }
            if let Some(flow) = self.table.get_mut(idx) {
                if pkt.status & (packet::PKT_SNAP_L2 | packet::PKT_SNAP_L3 | packet::PKT_SNAP_L4)
                    != 0
                {
                    flow.status.set(FlowStatus::SNAPPED);
                }
                if pkt.status & packet::PKT_FRAG != 0 {
                    flow.status.set(FlowStatus::FRAGMENT);
                }
            }

            // Zero-initialize every dissector slot, then on-new-flow hooks.
            self.basic_stats.reset_slot(idx, ts);
            self.tcp.reset_slot(idx);
            self.arp.reset_slot(idx);
            self.dhcp.reset_slot(idx);
            self.ospf.reset_slot(idx);
            self.smb.reset_slot(idx);
            self.voip.reset_slot(idx);
            self.tor.reset_slot(idx);

            if let Some(flow) = self.table.get(idx) {
                let flow = flow.clone();
                self.arp.on_new_flow(&pkt, idx);
                self.tcp.on_new_flow(&pkt, idx, &flow);
                self.ospf.on_new_flow(&pkt, idx);
                self.smb.on_new_flow(&pkt, idx);
                self.voip.on_new_flow(&pkt, idx, &flow);
                self.tor.on_new_flow(&pkt, idx, &flow);
                self.centrality.on_new_flow(&flow);
            }
        } else if let Some(flow) = self.table.get_mut(idx) {
            if pkt.status & (packet::PKT_SNAP_L2 | packet::PKT_SNAP_L3 | packet::PKT_SNAP_L4) != 0
            {
                flow.status.set(FlowStatus::SNAPPED);
            }
            if pkt.status & packet::PKT_FRAG != 0 {
                flow.status.set(FlowStatus::FRAGMENT);
            }
        }

        let (findex, opp_idx, flow_dir) = match self.table.get(idx) {
            Some(f) => (f.findex, f.opposite, f.dir),
            None => return Ok(()),
        };

        // Per-packet metadata row: core columns first, dissectors follow in
        // header order.
        if let Some(pf) = self.packet_file.as_mut() {
            pf.push(self.num_pkts.to_string());
            pf.push(format!("{}.{:06}", ts.sec, ts.usec));
            pf.push(findex.to_string());
            pf.push(if flow_dir == FlowDir::A { "A".into() } else { "B".into() });
            pf.push(wire_len.to_string());
            pf.push(pkt.l4_proto().unwrap_or(0).to_string());
            pf.push(pkt.l7_len.to_string());
        }

        // on-layer-2: ARP runs for every packet to keep columns aligned.
        self.arp.on_layer2(&pkt, idx, self.packet_file.as_mut());

        // on-layer-4 hooks in dependency order.
        let mut verdict = HookVerdict::Continue;
        verdict = verdict.merge(self.basic_stats.on_layer4(&pkt, idx));

        let opp_last_seen = opp_idx.and_then(|o| self.table.get(o)).map(|f| f.last_seen);
        let tcp_result = match self.table.get_mut(idx) {
            Some(flow) => self.tcp.on_layer4(
                &pkt,
                idx,
                flow,
                opp_idx,
                opp_last_seen,
                self.packet_file.as_mut(),
            ),
            None => Default::default(),
        };
        if tcp_result.timejump {
            self.global_timejump = true;
        }

        self.dhcp.on_layer4(&pkt, idx, &mut self.table, self.packet_file.as_mut());
        self.ospf.on_layer4(&pkt, idx, self.num_pkts, &mut self.files);
        self.smb.on_layer4(&pkt, idx, opp_idx, findex, &mut self.files);
        if let Some(flow) = self.table.get(idx) {
            let flow = flow.clone();
            self.voip.on_layer4(&pkt, idx, &flow, &mut self.files);
        }
        self.tor.on_layer4(&pkt, idx, opp_idx);
        self.centrality.on_packet(ts, &mut self.files);

        if let Some(pf) = self.packet_file.as_mut() {
            pf.end_row()?;
        }

        // ICMP destination-unreachable (port) naturally ends the flow it
        // quotes.
        if pkt.l4_proto() == Some(protocol::L3_ICMP) {
            self.icmp_unreachable(&pkt)?;
        }

        if verdict == HookVerdict::RemoveFlow {
            self.terminate_flow(idx, TerminationCause::Forced)?;
        } else if tcp_result.teardown {
            self.terminate_flow(idx, TerminationCause::NaturalEnd)?;
            if let Some(o) = opp_idx
                && self.table.get(o).is_some()
            {
                if let Some(f) = self.table.get_mut(o) {
                    f.status.set(FlowStatus::NATURAL_END);
                }
                self.terminate_flow(o, TerminationCause::NaturalEnd)?;
            }
        }
        Ok(())
    }

    /// Look a non-first IPv4 fragment up in the pending-train map,
    /// validating that the registered flow is still the same one. The entry
    /// is dropped when the last fragment arrives.
    fn resolve_fragment(&mut self, pkt: &PacketRecord<'_>) -> Option<usize> {
        let v4 = pkt.ipv4?;
        if v4.is_first_fragment() {
            return None;
        }
        let key = (
            std::net::IpAddr::V4(v4.src.into()),
            std::net::IpAddr::V4(v4.dst.into()),
            v4.id,
        );
        let (idx, findex) = self.frag_pending.get(&key).copied()?;
        if self.table.get(idx).map(|f| f.findex) != Some(findex) {
            self.frag_pending.remove(&key);
            return None;
        }
        if !v4.more_frags() {
            self.frag_pending.remove(&key);
        }
        Some(idx)
    }

    /// ICMP type 3 code 3 quotes the offending IP header: terminate the
    /// flow it belongs to.
    fn icmp_unreachable(&mut self, pkt: &PacketRecord<'_>) -> Result<(), AnalyzerError> {
        let l4 = pkt.l4_bytes();
        if l4.len() < 8 + 28 || l4[0] != 3 || l4[1] != 3 {
            return Ok(());
        }
        let inner = &l4[8..];
        if inner[0] >> 4 != 4 {
            return Ok(());
        }
        let ihl = ((inner[0] & 0x0f) as usize) * 4;
        if inner.len() < ihl + 4 {
            return Ok(());
        }
        let proto = inner[9];
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        src.copy_from_slice(&inner[12..16]);
        dst.copy_from_slice(&inner[16..20]);
        let sport = u16::from_be_bytes([inner[ihl], inner[ihl + 1]]);
        let dport = u16::from_be_bytes([inner[ihl + 2], inner[ihl + 3]]);
        let key = FlowKey {
            vlan: pkt.vlan_id(),
            src: std::net::IpAddr::V4(src.into()),
            dst: std::net::IpAddr::V4(dst.into()),
            src_port: if protocol::is_port_based(proto) { sport } else { 0 },
            dst_port: if protocol::is_port_based(proto) { dport } else { 0 },
            proto,
            sctp: None,
            eth: None,
        };
        if let Some(idx) = self.table.find(&key) {
            if let Some(f) = self.table.get_mut(idx) {
                f.status.set(FlowStatus::NATURAL_END);
            }
            self.terminate_flow(idx, TerminationCause::NaturalEnd)?;
        }
        Ok(())
    }

    /// Run every dissector's on-flow-terminate in registration order, append
    /// the declared columns to the output buffer, write the record
    /// atomically and release the slot.
    fn terminate_flow(&mut self, idx: usize, cause: TerminationCause) -> Result<(), AnalyzerError> {
        if let Some(flow) = self.table.get_mut(idx) {
            match cause {
                TerminationCause::Forced | TerminationCause::Evicted => {
                    flow.status.set(FlowStatus::FORCED_END)
                }
                TerminationCause::NaturalEnd => flow.status.set(FlowStatus::NATURAL_END),
                _ => {}
            }
        }
        let Some(flow) = self.table.get(idx).cloned() else {
            return Ok(());
        };

        let basic_stats = self.basic_stats.on_flow_terminate(idx, &flow);
        let tcp = self.tcp.on_flow_terminate(idx, &flow);
        let arp = self.arp.on_flow_terminate(idx, &flow);
        let dhcp = self.dhcp.on_flow_terminate(idx);
        let ospf = self.ospf.on_flow_terminate(idx);
        let smb = self.smb.on_flow_terminate(idx, flow.opposite, &mut self.files);
        let voip = self.voip.on_flow_terminate(idx, &flow);
        let tor = self.tor.on_flow_terminate(idx, &flow);
        let centrality = self.centrality.on_flow_terminate(&flow);

        // Serialize: core columns, then each dissector in schema order.
        self.buf.clear();
        self.buf.append_u64(flow.findex);
        self.buf.append_u8(if flow.status.has(FlowStatus::DIR_INVERT) {
            match flow.dir {
                FlowDir::A => 1,
                FlowDir::B => 0,
            }
        } else {
            match flow.dir {
                FlowDir::A => 0,
                FlowDir::B => 1,
            }
        });
        self.buf.append_time(flow.first_seen);
        self.buf.append_time(flow.last_seen);
        self.buf.append_time(flow.duration());
        self.buf.append_u32(flow.status.0);
        self.buf.append_u16(flow.key.vlan);
        append_addr(&mut self.buf, flow.key.src);
        append_addr(&mut self.buf, flow.key.dst);
        self.buf.append_u16(flow.key.src_port);
        self.buf.append_u16(flow.key.dst_port);
        self.buf.append_u8(flow.key.proto);

        basic_stats.append(&mut self.buf);
        tcp.append(&mut self.buf);
        arp.append(&mut self.buf);
        dhcp.append(&mut self.buf);
        ospf.append(&mut self.buf);
        smb.append(&mut self.buf);
        voip.append(&mut self.buf);
        tor.append(&mut self.buf);
        centrality.append(&mut self.buf);

        if let Some(w) = self.flow_writer.as_mut() {
            w.write_record(&self.buf)?;
        }

        if let Some(exp) = self.exporter.as_mut() {
            exp.export_flow(&flow, &basic_stats, &tcp);
        }

        if self.cfg.keep_records {
            self.records.push(FlowOutput {
                findex: flow.findex,
                key: flow.key,
                dir: flow.dir,
                first_seen: flow.first_seen,
                last_seen: flow.last_seen,
                duration: flow.duration(),
                status: flow.status,
                cause,
                basic_stats,
                tcp,
                arp,
                dhcp,
                ospf,
                smb,
                voip,
                tor,
                centrality,
            });
        }

        self.table.remove(idx);
        self.flows_terminated += 1;
        Ok(())
    }

    fn dissectors_mut(&mut self) -> [&mut dyn Dissector; 9] {
        [
            &mut self.basic_stats,
            &mut self.tcp,
            &mut self.arp,
            &mut self.dhcp,
            &mut self.ospf,
            &mut self.smb,
            &mut self.voip,
            &mut self.tor,
            &mut self.centrality,
        ]
    }

    /// Emit one monitoring row (header on first call, delta values after).
    pub fn monitoring_tick(&mut self) -> Result<(), AnalyzerError> {
        if self.report.is_none() {
            return Ok(());
        }
        if !self.monitoring_header_done {
            let header: Vec<String> = self
                .dissectors_mut()
                .iter_mut()
                .map(|d| d.monitoring(MonitoringState::Header))
                .collect();
            self.monitoring_header_done = true;
            if let Some(r) = self.report.as_mut() {
                r.raw(&header.join("\t"))?;
            }
        }
        let row: Vec<String> = self
            .dissectors_mut()
            .iter_mut()
            .map(|d| d.monitoring(MonitoringState::Value))
            .collect();
        if let Some(r) = self.report.as_mut() {
            r.raw(&row.join("\t"))?;
        }
        Ok(())
    }

    /// Serialize process-wide aggregates so a capture can be resumed.
    pub fn save_state(&self) -> String {
        let mut out = String::new();
        state::push_entry(&mut out, "corePkts", self.num_pkts);
        state::push_entry(&mut out, "coreTimejump", u64::from(self.global_timejump));
        self.basic_stats.save_state(&mut out);
        self.tcp.save_state(&mut out);
        self.arp.save_state(&mut out);
        self.dhcp.save_state(&mut out);
        self.ospf.save_state(&mut out);
        self.smb.save_state(&mut out);
        self.voip.save_state(&mut out);
        self.tor.save_state(&mut out);
        self.centrality.save_state(&mut out);
        out
    }

    pub fn restore_state(&mut self, blob: &str) {
        if let Some(v) = state::lookup(blob, "corePkts") {
            self.num_pkts = v;
        }
        if let Some(v) = state::lookup(blob, "coreTimejump") {
            self.global_timejump = v != 0;
        }
        for d in self.dissectors_mut() {
            d.restore_state(blob);
        }
    }

    /// End of capture: terminate every live flow, flush side files, write
    /// the operator report.
    pub fn finalize(mut self) -> Result<AnalyzerSummary, AnalyzerError> {
        while let Some(victim) = self.table.lru_victim() {
            self.terminate_flow(victim, TerminationCause::EndOfCapture)?;
        }

        let now = self.last_ts.unwrap_or(Timeval::ZERO);
        self.ospf.finalize(&mut self.files);
        self.centrality.finalize(now, &mut self.files);
        if let Some(exp) = self.exporter.as_mut() {
            exp.finalize(now);
        }

        if let Some(mut report) = self.report.take() {
            report.line(
                "core",
                &format!(
                    "Processed {} packets ({} untracked), {} flows",
                    self.num_pkts, self.untracked_pkts, self.flows_created
                ),
            )?;
            if self.global_timejump {
                report.line("core", "Warning: capture clock ran backwards (TIMEJUMP)")?;
            }
            report.line(
                "core",
                &format!("Peak concurrent side-channel files: {}", self.files.peak_open()),
            )?;
            let dissectors: [&dyn Dissector; 9] = [
                &self.basic_stats,
                &self.tcp,
                &self.arp,
                &self.dhcp,
                &self.ospf,
                &self.smb,
                &self.voip,
                &self.tor,
                &self.centrality,
            ];
            for d in dissectors {
                d.report(&mut report)?;
            }
            report.flush()?;
        }

        if let Some(w) = self.flow_writer.as_mut() {
            w.flush()?;
        }
        if let Some(pf) = self.packet_file.as_mut() {
            pf.flush()?;
        }

        Ok(AnalyzerSummary {
            packets: self.num_pkts,
            untracked_packets: self.untracked_pkts,
            flows_created: self.flows_created,
            flows_terminated: self.flows_terminated,
            peak_open_files: self.files.peak_open() as u64,
            aggregates: Aggregates {
                ip_flags: self.tcp.aggregate_ip_flags(),
                tcp_f_stat: self.tcp.aggregate_stat(),
                tcp_flags: self.tcp.aggregate_flags(),
                tcp_anomaly: self.tcp.aggregate_anomaly(),
                arp_stat: self.arp.aggregate_stat(),
                total_tcp_scans: self.tcp.total_scans(),
                total_tcp_succ_scans: self.tcp.total_succ_scans(),
                total_tcp_retries: self.tcp.total_retries(),
            },
            export: self.exporter.map(|e| e.stats).unwrap_or_default(),
            records: self.records,
        })
    }
}

fn append_addr(buf: &mut OutputBuffer, addr: std::net::IpAddr) {
    match addr {
        std::net::IpAddr::V4(v4) => {
            let mut bytes = [0u8; 16];
            bytes[..4].copy_from_slice(&v4.octets());
            buf.append_ip6(bytes);
        }
        std::net::IpAddr::V6(v6) => buf.append_ip6(v6.octets()),
    }
}

/// Builder in the usual `with_*` style.
pub struct AnalyzerBuilder {
    cfg: AnalyzerConfig,
    flow_writer: Option<Box<dyn Write>>,
    packet_file: Option<Box<dyn Write>>,
    report: Option<Box<dyn Write>>,
    export_sink: Option<Box<dyn ExportSink>>,
    cert_parser: Option<Box<dyn CertificateParser>>,
}

impl Default for AnalyzerBuilder {
    fn default() -> Self {
        AnalyzerBuilder {
            cfg: AnalyzerConfig::default(),
            flow_writer: None,
            packet_file: None,
            report: None,
            export_sink: None,
            cert_parser: None,
        }
    }
}

impl std::fmt::Debug for AnalyzerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerBuilder").field("cfg", &self.cfg).finish()
    }
}

impl AnalyzerBuilder {
    #[must_use]
    pub fn with_config(mut self, cfg: AnalyzerConfig) -> Self {
        self.cfg = cfg;
        self
    }

    #[must_use]
    pub fn with_max_flows(mut self, max: usize) -> Self {
        self.cfg.max_flows = max;
        self
    }

    #[must_use]
    pub fn with_flow_timeout(mut self, secs: f64) -> Self {
        self.cfg.flow_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_keep_records(mut self, keep: bool) -> Self {
        self.cfg.keep_records = keep;
        self
    }

    #[must_use]
    pub fn with_flow_writer(mut self, w: Box<dyn Write>) -> Self {
        self.flow_writer = Some(w);
        self
    }

    #[must_use]
    pub fn with_packet_file(mut self, w: Box<dyn Write>) -> Self {
        self.packet_file = Some(w);
        self
    }

    #[must_use]
    pub fn with_report(mut self, w: Box<dyn Write>) -> Self {
        self.report = Some(w);
        self
    }

    #[must_use]
    pub fn with_export_sink(mut self, sink: Box<dyn ExportSink>) -> Self {
        self.export_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_cert_parser(mut self, parser: Box<dyn CertificateParser>) -> Self {
        self.cert_parser = Some(parser);
        self
    }

    pub fn build(self) -> Result<Analyzer, AnalyzerError> {
        let cfg = self.cfg;
        if cfg.max_flows == 0 {
            return Err(AnalyzerError::InvalidConfig {
                context: "max_flows must be non-zero".into(),
            });
        }
        if cfg.flow_timeout_secs <= 0.0 {
            return Err(AnalyzerError::InvalidConfig {
                context: "flow timeout must be positive".into(),
            });
        }
        let table = FlowTable::new(cfg.max_flows, cfg.flow_timeout_secs).ok_or(
            AnalyzerError::InvalidConfig { context: "flow table construction failed".into() },
        )?;
        let files = FileManager::new(cfg.max_open_files)?;
        let cert_parser = self.cert_parser.unwrap_or_else(|| Box::new(NoCertParser));

        let mut packet_file = self.packet_file.map(PacketFile::new);
        if let Some(pf) = packet_file.as_mut() {
            pf.declare_columns(&[
                "pktNo", "time", "flowInd", "dir", "pktLen", "l4Proto", "l7Len",
            ]);
            pf.declare_columns(&ARP_PKT_COLUMNS);
            pf.declare_columns(&TCP_PKT_COLUMNS);
            pf.declare_columns(&DHCP_PKT_COLUMNS);
        }

        let basic_stats = BasicStatsDissector::new(&cfg);
        let tcp = TcpFlagsDissector::new(&cfg);
        let arp = ArpDissector::new(&cfg);
        let dhcp = DhcpDissector::new(&cfg);
        let ospf = OspfDissector::new(&cfg);
        let smb = SmbDissector::new(&cfg);
        let voip = VoipDissector::new(&cfg);
        let tor = TorDissector::new(&cfg, cert_parser);
        let centrality = CentralityDissector::new(&cfg);

        let mut flow_writer = self.flow_writer.map(FlowWriter::new);
        if let Some(w) = flow_writer.as_mut() {
            let schemas = [
                basic_stats.schema(),
                tcp.schema(),
                arp.schema(),
                dhcp.schema(),
                ospf.schema(),
                smb.schema(),
                voip.schema(),
                tor.schema(),
                centrality.schema(),
            ];
            w.write_preamble(&schemas)?;
        }

        let exporter = self.export_sink.map(|sink| NetflowExporter::new(&cfg, sink));

        Ok(Analyzer {
            table,
            basic_stats,
            tcp,
            arp,
            dhcp,
            ospf,
            smb,
            voip,
            tor,
            centrality,
            exporter,
            files,
            flow_writer,
            packet_file,
            report: self.report.map(Report::new),
            buf: OutputBuffer::new(),
            frag_pending: std::collections::HashMap::new(),
            cfg,
            num_pkts: 0,
            untracked_pkts: 0,
            flows_created: 0,
            flows_terminated: 0,
            last_ts: None,
            global_timejump: false,
            monitoring_header_done: false,
            records: Vec::new(),
        })
    }
}
