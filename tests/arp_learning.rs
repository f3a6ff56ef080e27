mod common;

use common::*;
use flow_dissector::dissectors::arp::{
    ARP_STAT_ANNOUNCE, ARP_STAT_DET, ARP_STAT_GRAT, ARP_STAT_PROBE, ARP_STAT_SPOOF,
};
use flow_dissector::{Analyzer, Timeval};

const MAC_AA: [u8; 6] = [0xaa; 6];
const MAC_BB: [u8; 6] = [0xbb; 6];

fn analyzer() -> Analyzer {
    Analyzer::builder()
        .with_max_flows(32)
        .with_keep_records(true)
        .build()
        .expect("analyzer")
}

#[test]
fn conflicting_bindings_raise_the_spoof_bit() {
    let mut a = analyzer();
    // Three replies over one L2 flow; the second binds 10.0.0.1 to a
    // different MAC.
    let replies = [
        arp_frame(MAC_A, 2, MAC_AA, [10, 0, 0, 1], MAC_AA, [10, 0, 0, 2]),
        arp_frame(MAC_A, 2, MAC_BB, [10, 0, 0, 1], MAC_AA, [10, 0, 0, 2]),
        arp_frame(MAC_A, 2, MAC_AA, [10, 0, 0, 2], MAC_AA, [10, 0, 0, 2]),
    ];
    for (i, f) in replies.iter().enumerate() {
        a.process_packet(Timeval::new(i as u64, 0), f.len() as u32, f).unwrap();
    }
    let summary = a.finalize().unwrap();
    assert_eq!(summary.records.len(), 1);
    let rec = &summary.records[0];
    assert!(rec.arp.stat & ARP_STAT_DET != 0);
    assert!(rec.arp.stat & ARP_STAT_SPOOF != 0);
    assert_eq!(rec.arp.pairs.len(), 3);
    assert_eq!(rec.arp.ip_mac_cnt, 3);
    // The conflicting pair for 10.0.0.1 is present under both MACs.
    assert!(rec.arp.pairs.iter().any(|p| p.mac == MAC_AA && p.ip == [10, 0, 0, 1]));
    assert!(rec.arp.pairs.iter().any(|p| p.mac == MAC_BB && p.ip == [10, 0, 0, 1]));
    assert_eq!(summary.aggregates.arp_stat, rec.arp.stat);
}

#[test]
fn probe_never_counts_as_spoof() {
    let mut a = analyzer();
    // Probe: request with zero sender IP and zero target MAC.
    let probe = arp_frame(MAC_A, 1, MAC_AA, [0, 0, 0, 0], [0; 6], [10, 0, 0, 7]);
    a.process_packet(Timeval::new(0, 0), probe.len() as u32, &probe).unwrap();
    // A different MAC probing for 0.0.0.0 must not trip the spoof logic.
    let probe2 = arp_frame(MAC_A, 1, MAC_BB, [0, 0, 0, 0], [0; 6], [10, 0, 0, 7]);
    a.process_packet(Timeval::new(1, 0), probe2.len() as u32, &probe2).unwrap();

    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert!(rec.arp.stat & ARP_STAT_PROBE != 0);
    assert_eq!(rec.arp.stat & ARP_STAT_SPOOF, 0);
}

#[test]
fn gratuitous_request_is_an_announcement() {
    let mut a = analyzer();
    let grat = arp_frame(MAC_A, 1, MAC_AA, [10, 0, 0, 9], [0xff; 6], [10, 0, 0, 9]);
    a.process_packet(Timeval::new(0, 0), grat.len() as u32, &grat).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert!(rec.arp.stat & ARP_STAT_GRAT != 0);
    assert!(rec.arp.stat & ARP_STAT_ANNOUNCE != 0);
}

#[test]
fn opcode_bitfield_accumulates() {
    let mut a = analyzer();
    let req = arp_frame(MAC_A, 1, MAC_AA, [10, 0, 0, 1], [0; 6], [10, 0, 0, 2]);
    let rep = arp_frame(MAC_A, 2, MAC_AA, [10, 0, 0, 1], MAC_BB, [10, 0, 0, 2]);
    a.process_packet(Timeval::new(0, 0), req.len() as u32, &req).unwrap();
    a.process_packet(Timeval::new(1, 0), rep.len() as u32, &rep).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert_eq!(rec.arp.opcode, (1 << 1) | (1 << 2));
    assert_eq!(rec.arp.hw_type, 1);
}
