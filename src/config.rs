//! Engine configuration. Built through [`crate::AnalyzerBuilder`]; every
//! bound here is fixed at init and never resized.

use std::path::PathBuf;

/// Which layer "byte count" means for the statistics dissector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthLayer {
    L2,
    #[default]
    L3,
    L4,
    L7,
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Maximum concurrent flows; the table never grows past this.
    pub max_flows: usize,
    /// Idle timeout on the capture clock, seconds.
    pub flow_timeout_secs: f64,
    /// Track non-IP frames (ARP et al.) as L2-keyed flows.
    pub l2_flows: bool,

    // basicStats
    pub length_layer: LengthLayer,
    /// Packet length taken modulo this when > 1.
    pub length_modulo: Option<u16>,
    /// `(min, max, invert)`: admit lengths inside the window, or outside it
    /// when inverted.
    pub length_filter: Option<(u16, u16, bool)>,
    pub talker_max: usize,

    // tcpFlags
    /// Windows below this count toward the small-window tally.
    pub win_min: u32,
    /// A terminating TCP flow with fewer captured packets than this and
    /// scan-shaped flags is classified as a scan.
    pub scan_pmax: u64,
    /// Retransmission threshold: inter-arrival must exceed this multiple of
    /// the RTT average sum before a sequence regression counts as a retry.
    pub retry_factor: f64,
    /// A repeated SYN after this many seconds is a SYN retry, below it a
    /// scan attempt.
    pub syn_retry_secs: f64,
    pub verify_checksums: bool,

    // Per-dissector list bounds
    pub arp_max_ip: usize,
    pub dhcp_nm_max: usize,
    pub ospf_neigh_max: usize,
    pub smb_num_fname: usize,
    pub sip_stat_max: usize,
    pub sip_rfx_max: usize,
    pub rtp_f_max: usize,
    /// Capacity of every process-wide auxiliary table (ARP/DHCP MAC maps,
    /// VoIP correlation map, centrality nodes).
    pub aux_table_size: usize,

    // Side-channel outputs; None disables the feature.
    pub max_open_files: usize,
    pub smb_save_dir: Option<PathBuf>,
    pub voip_save_dir: Option<PathBuf>,
    pub ospf_dir: Option<PathBuf>,
    pub auth_file: Option<PathBuf>,
    pub guid_map_file: Option<PathBuf>,
    pub centrality_file: Option<PathBuf>,
    pub centrality_tick_secs: f64,

    // NetFlow v9 export
    pub export_v4_per_msg: usize,
    pub export_v6_per_msg: usize,

    /// Retain typed per-flow records in memory after termination.
    pub keep_records: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            max_flows: 65536,
            flow_timeout_secs: 182.0,
            l2_flows: true,
            length_layer: LengthLayer::L3,
            length_modulo: None,
            length_filter: None,
            talker_max: 4096,
            win_min: 1,
            scan_pmax: 4,
            retry_factor: 1.5,
            syn_retry_secs: 0.9,
            verify_checksums: true,
            arp_max_ip: 10,
            dhcp_nm_max: 8,
            ospf_neigh_max: 10,
            smb_num_fname: 8,
            sip_stat_max: 8,
            sip_rfx_max: 100,
            rtp_f_max: 20,
            aux_table_size: 16384,
            max_open_files: 128,
            smb_save_dir: None,
            voip_save_dir: None,
            ospf_dir: None,
            auth_file: None,
            guid_map_file: None,
            centrality_file: None,
            centrality_tick_secs: 60.0,
            export_v4_per_msg: 20,
            export_v6_per_msg: 10,
            keep_records: false,
        }
    }
}
