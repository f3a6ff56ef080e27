//! Degree centrality per IP over the connection graph.
//!
//! Every flow contributes one undirected (src, dst) edge. On each
//! calculation tick (capture clock) the normalized degree of every node is
//! written as a `(time, ip, centrality)` row to the centrality file.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::Serialize;

use crate::AnalyzerError;
use crate::config::AnalyzerConfig;
use crate::dispatcher::Dissector;
use crate::flow::FlowRecord;
use crate::output::{ColumnType, FileManager, MonitoringState, OutputBuffer, Report, Schema};
use crate::time::Timeval;

const PLUGIN: &str = "centrality";

pub const CENT_STAT_NODE_FULL: u8 = 0x01;
pub const CENT_STAT_EDGE_FULL: u8 = 0x02;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CentralityRecord {
    pub stat: u8,
    pub src_degree: u32,
}

impl CentralityRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u8(self.stat);
        buf.append_u32(self.src_degree);
    }
}

#[derive(Debug)]
pub struct CentralityDissector {
    table_size: usize,
    file: Option<PathBuf>,
    tick_secs: f64,
    nodes: HashMap<IpAddr, HashSet<IpAddr>>,
    edges: usize,
    last_tick: Option<Timeval>,
    stat: u8,
    ticks: u64,
}

impl CentralityDissector {
    pub fn new(cfg: &AnalyzerConfig) -> CentralityDissector {
        CentralityDissector {
            table_size: cfg.aux_table_size,
            file: cfg.centrality_file.clone(),
            tick_secs: cfg.centrality_tick_secs,
            nodes: HashMap::new(),
            edges: 0,
            last_tick: None,
            stat: 0,
            ticks: 0,
        }
    }

    pub fn on_new_flow(&mut self, flow: &FlowRecord) {
        if flow.key.eth.is_some() {
            return; // L2 flows carry no IP endpoints
        }
        let (src, dst) = (flow.key.src, flow.key.dst);
        if self.nodes.len() >= self.table_size
            && (!self.nodes.contains_key(&src) || !self.nodes.contains_key(&dst))
        {
            if self.stat & CENT_STAT_NODE_FULL == 0 {
                log::warn!("[{PLUGIN}] node table full, graph is no longer growing");
            }
            self.stat |= CENT_STAT_NODE_FULL;
            return;
        }
        let new_edge = self.nodes.entry(src).or_default().insert(dst);
        self.nodes.entry(dst).or_default().insert(src);
        if new_edge {
            self.edges += 1;
        }
    }

    /// Tick handling, driven once per packet with the capture clock.
    pub fn on_packet(&mut self, now: Timeval, files: &mut FileManager) {
        match self.last_tick {
            None => self.last_tick = Some(now),
            Some(last) if now.diff_secs(last) >= self.tick_secs => {
                self.emit(now, files);
                self.last_tick = Some(now);
            }
            _ => {}
        }
    }

    fn emit(&mut self, now: Timeval, files: &mut FileManager) {
        let Some(path) = self.file.clone() else { return };
        self.ticks += 1;
        let n = self.nodes.len();
        if n < 2 {
            return;
        }
        for (ip, peers) in &self.nodes {
            let centrality = peers.len() as f64 / (n - 1) as f64;
            let _ = files.append_line(
                &path,
                &format!("{}.{:06}\t{ip}\t{centrality:.6}", now.sec, now.usec),
            );
        }
    }

    pub fn on_flow_terminate(&mut self, flow: &FlowRecord) -> CentralityRecord {
        let degree = self
            .nodes
            .get(&flow.key.src)
            .map(|p| p.len() as u32)
            .unwrap_or(0);
        CentralityRecord { stat: self.stat, src_degree: degree }
    }

    /// Final calculation at end of capture.
    pub fn finalize(&mut self, now: Timeval, files: &mut FileManager) {
        self.emit(now, files);
    }
}

impl Dissector for CentralityDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("centStat", ColumnType::H8, "Centrality status")
            .push("centSrcDegree", ColumnType::U32, "Degree of the flow source");
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        report.line(
            PLUGIN,
            &format!(
                "Graph: {} nodes, {} edges, {} calculation ticks",
                self.nodes.len(),
                self.edges,
                self.ticks
            ),
        )
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "centNodes\tcentEdges".into(),
            MonitoringState::Value => format!("{}\t{}", self.nodes.len(), self.edges),
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "centStat", self.stat as u64);
        crate::state::push_entry(out, "centTicks", self.ticks);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "centStat") {
            self.stat |= v as u8;
        }
        if let Some(v) = crate::state::lookup(blob, "centTicks") {
            self.ticks = v;
        }
    }
}
