mod common;

use common::*;
use flow_dissector::config::AnalyzerConfig;
use flow_dissector::dissectors::ospf::{
    OSPF_HELLO, OSPF_STAT_BAD_TTL, OSPF_STAT_MALFORMED, OSPF_STAT_WRNG_VER,
};
use flow_dissector::{Analyzer, Timeval};

fn analyzer_with_dir(dir: Option<std::path::PathBuf>) -> Analyzer {
    let cfg = AnalyzerConfig {
        max_flows: 32,
        keep_records: true,
        ospf_dir: dir,
        ..AnalyzerConfig::default()
    };
    Analyzer::builder().with_config(cfg).build().expect("analyzer")
}

fn ospf_frame(ttl: u8, dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    eth_frame(MAC_A, MAC_B, 0x0800, &ipv4_packet([10, 0, 0, 1], dst, 89, ttl, payload))
}

#[test]
fn hello_with_three_neighbors() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer_with_dir(Some(dir.path().to_path_buf()));

    let neighbors = [[10, 0, 0, 11], [10, 0, 0, 12], [10, 0, 0, 13]];
    let body = ospf2_hello_body([255, 255, 255, 0], &neighbors);
    let pkt = ospf2_packet(OSPF_HELLO, [10, 0, 0, 1], 0, &body);
    let f = ospf_frame(1, [224, 0, 0, 5], &pkt);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();

    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert_eq!(rec.ospf.version, 2);
    assert!(rec.ospf.types & (1 << OSPF_HELLO) != 0);
    assert_eq!(rec.ospf.neighbors.len(), 3);
    assert_eq!(rec.ospf.stat & OSPF_STAT_BAD_TTL, 0);
    assert_eq!(rec.ospf.netmask, [255, 255, 255, 0]);
    assert_eq!(rec.ospf.router_id, [10, 0, 0, 1]);

    // Side file carries one row per hello.
    let hello = std::fs::read_to_string(dir.path().join("ospfHello.txt")).unwrap();
    assert!(hello.contains("10.0.0.11;10.0.0.12;10.0.0.13"));
}

#[test]
fn multicast_with_wrong_ttl_is_flagged() {
    let mut a = analyzer_with_dir(None);
    let body = ospf2_hello_body([255, 255, 255, 0], &[]);
    let pkt = ospf2_packet(OSPF_HELLO, [10, 0, 0, 1], 0, &body);
    let f = ospf_frame(64, [224, 0, 0, 5], &pkt);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = a.finalize().unwrap();
    assert!(summary.records[0].ospf.stat & OSPF_STAT_BAD_TTL != 0);
}

#[test]
fn wrong_version_stops_parsing() {
    let mut a = analyzer_with_dir(None);
    let mut pkt = ospf2_packet(OSPF_HELLO, [10, 0, 0, 1], 0, &ospf2_hello_body([0; 4], &[]));
    pkt[0] = 7;
    let f = ospf_frame(1, [224, 0, 0, 5], &pkt);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert!(rec.ospf.stat & OSPF_STAT_WRNG_VER != 0);
    assert_eq!(rec.ospf.types, 0);
}

#[test]
fn truncated_packet_length_is_malformed() {
    let mut a = analyzer_with_dir(None);
    let mut pkt = ospf2_packet(OSPF_HELLO, [10, 0, 0, 1], 0, &ospf2_hello_body([0; 4], &[]));
    // Claim a packet length shorter than the v2 header.
    pkt[2] = 0;
    pkt[3] = 10;
    let f = ospf_frame(1, [224, 0, 0, 5], &pkt);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = a.finalize().unwrap();
    assert!(summary.records[0].ospf.stat & OSPF_STAT_MALFORMED != 0);
}

#[test]
fn ospfv3_ls_update_uses_v3_body_layouts() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer_with_dir(Some(dir.path().to_path_buf()));

    fn lsa_hdr(ls_type: u16, ls_len: u16) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&1u16.to_be_bytes()); // age
        h.extend_from_slice(&ls_type.to_be_bytes());
        h.extend_from_slice(&[0, 0, 0, 7]); // ls id
        h.extend_from_slice(&[10, 0, 0, 1]); // advertising router
        h.extend_from_slice(&0x8000_0001u32.to_be_bytes()); // sequence
        h.extend_from_slice(&[0, 0]); // checksum
        h.extend_from_slice(&ls_len.to_be_bytes());
        h
    }

    // Inter-Area-Router-LSA (area scope, function code 4):
    // options, metric, destination router id. No netmask in this body.
    let mut lsa1 = lsa_hdr(0x2004, 32);
    lsa1.extend_from_slice(&[0, 0, 0, 0x13]); // options
    lsa1.extend_from_slice(&[0, 0, 0, 20]); // metric
    lsa1.extend_from_slice(&[9, 9, 9, 9]); // destination router

    // Intra-Area-Prefix-LSA (function code 9): referenced LSA fields,
    // then one prefix entry.
    let mut lsa2 = lsa_hdr(0x2009, 40);
    lsa2.extend_from_slice(&1u16.to_be_bytes()); // one prefix
    lsa2.extend_from_slice(&0x2001u16.to_be_bytes()); // referenced LS type
    lsa2.extend_from_slice(&[0, 0, 0, 5]); // referenced LS id
    lsa2.extend_from_slice(&[10, 0, 0, 1]); // referenced adv router
    lsa2.push(64); // prefix length
    lsa2.push(0); // prefix options
    lsa2.extend_from_slice(&10u16.to_be_bytes()); // metric
    lsa2.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8]); // prefix

    let mut body = 2u32.to_be_bytes().to_vec();
    body.extend_from_slice(&lsa1);
    body.extend_from_slice(&lsa2);
    let pkt = ospf3_packet(4, [10, 0, 0, 1], 0, &body); // LS_UPDATE

    let mut src = [0u8; 16];
    src[0] = 0xfe;
    src[1] = 0x80;
    src[15] = 1;
    let mut dst = [0u8; 16];
    dst[0] = 0xff;
    dst[1] = 0x02;
    dst[15] = 5;
    let frame = eth_frame(MAC_A, MAC_B, 0x86dd, &ipv6_packet(src, dst, 89, 1, &pkt));
    a.process_packet(Timeval::new(0, 0), frame.len() as u32, &frame).unwrap();

    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert_eq!(rec.ospf.version, 3);
    assert_eq!(rec.ospf.stat & OSPF_STAT_MALFORMED, 0);
    assert!(rec.ospf.ls_types & (1 << 4) != 0);
    assert!(rec.ospf.ls_types & (1 << 9) != 0);

    let rows = std::fs::read_to_string(dir.path().join("ospf3Msg.txt")).unwrap();
    let inter: Vec<_> = rows.lines().filter(|l| l.contains("INTER_AREA_ROUTER")).collect();
    assert_eq!(inter.len(), 1);
    // Destination router id, options and metric; no netmask column.
    assert!(inter[0].contains("9.9.9.9"));
    assert!(inter[0].contains("0x000013"));
    assert!(inter[0].ends_with("20"));
    let intra: Vec<_> = rows.lines().filter(|l| l.contains("INTRA_AREA_PREFIX")).collect();
    assert_eq!(intra.len(), 1);
    assert!(intra[0].contains("0x2001"));
    assert!(intra[0].contains("/64"));
}

#[test]
fn ospfv3_network_lsa_emits_options_not_netmask() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer_with_dir(Some(dir.path().to_path_buf()));

    // Network-LSA (0x2002): options word, then two attached router ids.
    let mut lsa = Vec::new();
    lsa.extend_from_slice(&1u16.to_be_bytes()); // age
    lsa.extend_from_slice(&0x2002u16.to_be_bytes());
    lsa.extend_from_slice(&[0, 0, 0, 7]); // ls id
    lsa.extend_from_slice(&[10, 0, 0, 1]); // advertising router
    lsa.extend_from_slice(&0x8000_0001u32.to_be_bytes());
    lsa.extend_from_slice(&[0, 0]); // checksum
    lsa.extend_from_slice(&32u16.to_be_bytes()); // 20 + 4 + 2 * 4
    lsa.extend_from_slice(&[0, 0, 0, 0x33]); // options, no netmask
    lsa.extend_from_slice(&[10, 0, 0, 1]);
    lsa.extend_from_slice(&[10, 0, 0, 2]);

    let mut body = 1u32.to_be_bytes().to_vec();
    body.extend_from_slice(&lsa);
    let pkt = ospf3_packet(4, [10, 0, 0, 1], 0, &body);

    let src = [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    let dst = [0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 5];
    let frame = eth_frame(MAC_A, MAC_B, 0x86dd, &ipv6_packet(src, dst, 89, 1, &pkt));
    a.process_packet(Timeval::new(0, 0), frame.len() as u32, &frame).unwrap();

    let summary = a.finalize().unwrap();
    assert_eq!(summary.records[0].ospf.stat & OSPF_STAT_MALFORMED, 0);

    let rows = std::fs::read_to_string(dir.path().join("ospf3Msg.txt")).unwrap();
    let net: Vec<_> = rows.lines().filter(|l| l.contains("NETWORK")).collect();
    assert_eq!(net.len(), 2, "one row per attached router");
    assert!(net.iter().all(|l| l.contains("0x000033")));
    assert!(net[0].contains("10.0.0.1"));
    assert!(net[1].contains("10.0.0.2"));
}

#[test]
fn ls_update_walk_respects_declared_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer_with_dir(Some(dir.path().to_path_buf()));

    // One Router-LSA with a single stub link.
    let mut lsa = Vec::new();
    lsa.extend_from_slice(&1u16.to_be_bytes()); // age
    lsa.push(0x02); // options
    lsa.push(1); // type: router
    lsa.extend_from_slice(&[10, 0, 0, 1]); // ls id
    lsa.extend_from_slice(&[10, 0, 0, 1]); // advertising router
    lsa.extend_from_slice(&0x8000_0001u32.to_be_bytes()); // sequence
    lsa.extend_from_slice(&[0, 0]); // checksum
    let body_len = 20 + 4 + 12;
    lsa.extend_from_slice(&(body_len as u16).to_be_bytes());
    lsa.extend_from_slice(&[0, 0, 0, 1]); // flags, zero, one link
    lsa.extend_from_slice(&[192, 168, 1, 0]); // link id
    lsa.extend_from_slice(&[255, 255, 255, 0]); // link data
    lsa.push(3); // stub
    lsa.push(0); // zero TOS metrics
    lsa.extend_from_slice(&10u16.to_be_bytes()); // metric

    let mut body = 1u32.to_be_bytes().to_vec(); // one LSA
    body.extend_from_slice(&lsa);
    let pkt = ospf2_packet(4, [10, 0, 0, 1], 0, &body); // LS_UPDATE
    let f = ospf_frame(1, [224, 0, 0, 5], &pkt);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();

    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert_eq!(rec.ospf.stat & OSPF_STAT_MALFORMED, 0);
    assert!(rec.ospf.ls_types & (1 << 1) != 0);

    let rows = std::fs::read_to_string(dir.path().join("ospf2Msg.txt")).unwrap();
    assert!(rows.contains("ROUTER"));
    assert!(rows.contains("192.168.1.0"));

    // A second update whose LSA claims more bytes than the packet holds.
    let mut b = analyzer_with_dir(None);
    let mut bad = 1u32.to_be_bytes().to_vec();
    let mut short_lsa = lsa.clone();
    short_lsa[18] = 0x40; // ls_len far beyond the packet end
    bad.extend_from_slice(&short_lsa);
    let pkt = ospf2_packet(4, [10, 0, 0, 1], 0, &bad);
    let f = ospf_frame(1, [224, 0, 0, 5], &pkt);
    b.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = b.finalize().unwrap();
    assert!(summary.records[0].ospf.stat & OSPF_STAT_MALFORMED != 0);
}
