//! NetFlow v9 export of terminated flows.
//!
//! Reads the statistics and TCP-flags slots of a flow at termination and
//! serializes v9 messages: one template message up front (IPv4 template 256,
//! IPv6 template 257), then data flowsets buffered up to a configurable
//! flow count per datagram. Delivery goes through the pluggable
//! [`ExportSink`] so the collector transport (UDP, TCP, test capture) stays
//! outside the engine.

use std::io::Write;
use std::net::{IpAddr, UdpSocket};

use serde::Serialize;

use crate::config::AnalyzerConfig;
use crate::dissectors::basic_stats::BasicStatsRecord;
use crate::dissectors::tcp_flags::TcpFlagsRecord;
use crate::flow::FlowRecord;
use crate::time::Timeval;

const NF9_VERSION: u16 = 9;
const TEMPLATE_FLOWSET_ID: u16 = 0;
const TEMPLATE_ID_V4: u16 = 256;
const TEMPLATE_ID_V6: u16 = 257;

// Field type ids from the v9 field registry.
const IN_BYTES: u16 = 1;
const IN_PKTS: u16 = 2;
const PROTOCOL: u16 = 4;
const SRC_TOS: u16 = 5;
const TCP_FLAGS: u16 = 6;
const L4_SRC_PORT: u16 = 7;
const IPV4_SRC_ADDR: u16 = 8;
const L4_DST_PORT: u16 = 11;
const IPV4_DST_ADDR: u16 = 12;
const LAST_SWITCHED: u16 = 21;
const FIRST_SWITCHED: u16 = 22;
const OUT_BYTES: u16 = 23;
const OUT_PKTS: u16 = 24;
const IPV6_SRC_ADDR: u16 = 27;
const IPV6_DST_ADDR: u16 = 28;
const IN_SRC_MAC: u16 = 56;
const OUT_DST_MAC: u16 = 57;

const V4_FIELDS: [(u16, u16); 15] = [
    (IPV4_SRC_ADDR, 4),
    (IPV4_DST_ADDR, 4),
    (L4_SRC_PORT, 2),
    (L4_DST_PORT, 2),
    (PROTOCOL, 1),
    (SRC_TOS, 1),
    (TCP_FLAGS, 1),
    (IN_PKTS, 8),
    (IN_BYTES, 8),
    (OUT_PKTS, 8),
    (OUT_BYTES, 8),
    (FIRST_SWITCHED, 4),
    (LAST_SWITCHED, 4),
    (IN_SRC_MAC, 6),
    (OUT_DST_MAC, 6),
];

const V6_FIELDS: [(u16, u16); 15] = [
    (IPV6_SRC_ADDR, 16),
    (IPV6_DST_ADDR, 16),
    (L4_SRC_PORT, 2),
    (L4_DST_PORT, 2),
    (PROTOCOL, 1),
    (SRC_TOS, 1),
    (TCP_FLAGS, 1),
    (IN_PKTS, 8),
    (IN_BYTES, 8),
    (OUT_PKTS, 8),
    (OUT_BYTES, 8),
    (FIRST_SWITCHED, 4),
    (LAST_SWITCHED, 4),
    (IN_SRC_MAC, 6),
    (OUT_DST_MAC, 6),
];

/// Collector transport.
pub trait ExportSink: std::fmt::Debug {
    fn send(&mut self, datagram: &[u8]) -> std::io::Result<()>;
}

/// UDP collector.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub fn connect(collector: &str) -> std::io::Result<UdpSink> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(collector)?;
        Ok(UdpSink { socket })
    }
}

impl ExportSink for UdpSink {
    fn send(&mut self, datagram: &[u8]) -> std::io::Result<()> {
        self.socket.send(datagram).map(|_| ())
    }
}

/// TCP collector; each message is written as-is to the stream.
pub struct TcpSink {
    stream: std::net::TcpStream,
}

impl std::fmt::Debug for TcpSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSink").finish()
    }
}

impl TcpSink {
    pub fn connect(collector: &str) -> std::io::Result<TcpSink> {
        Ok(TcpSink { stream: std::net::TcpStream::connect(collector)? })
    }
}

impl ExportSink for TcpSink {
    fn send(&mut self, datagram: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(datagram)
    }
}

/// Test sink capturing every datagram.
#[derive(Debug, Default)]
pub struct CaptureSink {
    pub datagrams: Vec<Vec<u8>>,
}

impl ExportSink for CaptureSink {
    fn send(&mut self, datagram: &[u8]) -> std::io::Result<()> {
        self.datagrams.push(datagram.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportStats {
    pub messages: u64,
    pub v4_flows: u64,
    pub v6_flows: u64,
    pub errors: u64,
}

#[derive(Debug)]
pub struct NetflowExporter {
    sink: Box<dyn ExportSink>,
    v4_per_msg: usize,
    v6_per_msg: usize,
    v4_buf: Vec<u8>,
    v4_count: usize,
    v6_buf: Vec<u8>,
    v6_count: usize,
    sequence: u32,
    start: Timeval,
    template_sent: bool,
    pub stats: ExportStats,
}

impl NetflowExporter {
    pub fn new(cfg: &AnalyzerConfig, sink: Box<dyn ExportSink>) -> NetflowExporter {
        NetflowExporter {
            sink,
            v4_per_msg: cfg.export_v4_per_msg.max(1),
            v6_per_msg: cfg.export_v6_per_msg.max(1),
            v4_buf: Vec::new(),
            v4_count: 0,
            v6_buf: Vec::new(),
            v6_count: 0,
            sequence: 0,
            start: Timeval::ZERO,
            template_sent: false,
            stats: ExportStats::default(),
        }
    }

    fn header(&mut self, count: u16, now: Timeval) -> Vec<u8> {
        let mut h = Vec::with_capacity(20);
        h.extend_from_slice(&NF9_VERSION.to_be_bytes());
        h.extend_from_slice(&count.to_be_bytes());
        let uptime_ms = (now.diff_secs(self.start).max(0.0) * 1000.0) as u32;
        h.extend_from_slice(&uptime_ms.to_be_bytes());
        h.extend_from_slice(&(now.sec as u32).to_be_bytes());
        h.extend_from_slice(&self.sequence.to_be_bytes());
        h.extend_from_slice(&0u32.to_be_bytes()); // source id
        self.sequence = self.sequence.wrapping_add(1);
        h
    }

    fn send_templates(&mut self, now: Timeval) {
        self.start = now;
        let mut msg = self.header(2, now);
        let mut set = Vec::new();
        for (tid, fields) in [(TEMPLATE_ID_V4, &V4_FIELDS), (TEMPLATE_ID_V6, &V6_FIELDS)] {
            set.extend_from_slice(&tid.to_be_bytes());
            set.extend_from_slice(&(fields.len() as u16).to_be_bytes());
            for (ftype, flen) in fields {
                set.extend_from_slice(&ftype.to_be_bytes());
                set.extend_from_slice(&flen.to_be_bytes());
            }
        }
        msg.extend_from_slice(&TEMPLATE_FLOWSET_ID.to_be_bytes());
        msg.extend_from_slice(&((set.len() + 4) as u16).to_be_bytes());
        msg.extend_from_slice(&set);
        if self.sink.send(&msg).is_err() {
            self.stats.errors += 1;
        } else {
            self.stats.messages += 1;
        }
        self.template_sent = true;
    }

    /// Serialize one terminated flow into the pending buffer.
    pub fn export_flow(
        &mut self,
        flow: &FlowRecord,
        stats: &BasicStatsRecord,
        tcp: &TcpFlagsRecord,
    ) {
        if !self.template_sent {
            self.send_templates(flow.last_seen);
        }

        let mut rec = Vec::with_capacity(80);
        match (flow.key.src, flow.key.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                rec.extend_from_slice(&s.octets());
                rec.extend_from_slice(&d.octets());
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                rec.extend_from_slice(&s.octets());
                rec.extend_from_slice(&d.octets());
            }
            _ => return,
        }
        rec.extend_from_slice(&flow.key.src_port.to_be_bytes());
        rec.extend_from_slice(&flow.key.dst_port.to_be_bytes());
        rec.push(flow.key.proto);
        rec.push(tcp.ip_tos);
        rec.push((tcp.tcp_flags & 0xff) as u8);
        rec.extend_from_slice(&stats.num_pkts_snt.to_be_bytes());
        rec.extend_from_slice(&stats.num_bytes_snt.to_be_bytes());
        rec.extend_from_slice(&stats.num_pkts_rcvd.to_be_bytes());
        rec.extend_from_slice(&stats.num_bytes_rcvd.to_be_bytes());
        rec.extend_from_slice(&(flow.first_seen.sec as u32).to_be_bytes());
        rec.extend_from_slice(&(flow.last_seen.sec as u32).to_be_bytes());
        rec.extend_from_slice(&flow.eth_src);
        rec.extend_from_slice(&flow.eth_dst);

        let now = flow.last_seen;
        if flow.key.src.is_ipv4() {
            self.v4_buf.extend_from_slice(&rec);
            self.v4_count += 1;
            self.stats.v4_flows += 1;
            if self.v4_count >= self.v4_per_msg {
                self.flush_v4(now);
            }
        } else {
            self.v6_buf.extend_from_slice(&rec);
            self.v6_count += 1;
            self.stats.v6_flows += 1;
            if self.v6_count >= self.v6_per_msg {
                self.flush_v6(now);
            }
        }
    }

    fn flush_set(&mut self, template_id: u16, now: Timeval) {
        let (buf, count) = if template_id == TEMPLATE_ID_V4 {
            (std::mem::take(&mut self.v4_buf), std::mem::replace(&mut self.v4_count, 0))
        } else {
            (std::mem::take(&mut self.v6_buf), std::mem::replace(&mut self.v6_count, 0))
        };
        if count == 0 {
            return;
        }
        let mut msg = self.header(1, now);
        // Flowset: id, length padded to a 4-byte boundary.
        let pad = (4 - (buf.len() + 4) % 4) % 4;
        msg.extend_from_slice(&template_id.to_be_bytes());
        msg.extend_from_slice(&((buf.len() + 4 + pad) as u16).to_be_bytes());
        msg.extend_from_slice(&buf);
        msg.extend_from_slice(&vec![0u8; pad]);
        if self.sink.send(&msg).is_err() {
            self.stats.errors += 1;
        } else {
            self.stats.messages += 1;
        }
    }

    fn flush_v4(&mut self, now: Timeval) {
        self.flush_set(TEMPLATE_ID_V4, now);
    }

    fn flush_v6(&mut self, now: Timeval) {
        self.flush_set(TEMPLATE_ID_V6, now);
    }

    /// Flush pending buffers at end of capture.
    pub fn finalize(&mut self, now: Timeval) {
        self.flush_v4(now);
        self.flush_v6(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_lengths_match_field_tables() {
        let v4_rec_len: u16 = V4_FIELDS.iter().map(|(_, l)| l).sum();
        let v6_rec_len: u16 = V6_FIELDS.iter().map(|(_, l)| l).sum();
        assert_eq!(v4_rec_len, 67);
        assert_eq!(v6_rec_len, 91);
    }
}
