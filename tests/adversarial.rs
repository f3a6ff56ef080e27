//! Adversarial input: truncated, malformed and pseudo-random frames must
//! never panic, never corrupt neighbor state, and always leave the engine
//! able to finish the capture.

mod common;

use common::*;
use flow_dissector::dissectors::tcp_flags::{TH_ACK, TH_SYN};
use flow_dissector::{Analyzer, Timeval};

fn analyzer() -> Analyzer {
    Analyzer::builder()
        .with_max_flows(64)
        .with_keep_records(true)
        .build()
        .expect("analyzer")
}

#[test]
fn truncated_frames_of_every_length_survive() {
    let mut a = analyzer();
    let full = TcpSeg { flags: TH_SYN, payload: vec![0xaa; 32], ..TcpSeg::default() }.build();
    for len in 0..full.len() {
        a.process_packet(Timeval::new(len as u64, 0), full.len() as u32, &full[..len]).unwrap();
    }
    let summary = a.finalize().unwrap();
    assert!(summary.packets as usize == full.len());
}

#[test]
fn pseudo_random_frames_survive() {
    let mut a = analyzer();
    // Deterministic LCG so failures reproduce.
    let mut state = 0x12345678u64;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as u8
    };
    for i in 0..500u64 {
        let len = 14 + (next() as usize % 200);
        let mut frame: Vec<u8> = (0..len).map(|_| next()).collect();
        // Keep a valid ethertype half of the time so L3 parsing engages.
        if i % 2 == 0 {
            frame[12] = 0x08;
            frame[13] = 0x00;
        }
        a.process_packet(Timeval::new(i, 0), frame.len() as u32, &frame).unwrap();
    }
    let summary = a.finalize().unwrap();
    assert_eq!(summary.packets, 500);
}

#[test]
fn malformed_protocol_bits_do_not_cross_flows() {
    let mut a = analyzer();

    // A clean UDP conversation...
    let clean = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 6000, b"ok");
    a.process_packet(Timeval::new(0, 0), clean.len() as u32, &clean).unwrap();

    // ...next to a DHCP packet with a corrupt option field.
    let mut msg = DhcpMsg { opcode: 1, options: dhcp_option(53, &[1]), ..DhcpMsg::default() }.build();
    let last = msg.len() - 1;
    msg[last] = 0x42; // overwrite the end marker
    let bad = udp_frame([10, 0, 0, 9], [10, 0, 0, 10], 68, 67, &msg);
    a.process_packet(Timeval::new(1, 0), bad.len() as u32, &bad).unwrap();

    let summary = a.finalize().unwrap();
    let clean_rec = summary.records.iter().find(|r| r.key.src_port == 5000).unwrap();
    let bad_rec = summary.records.iter().find(|r| r.key.src_port == 68).unwrap();
    assert_eq!(clean_rec.dhcp.stat, 0, "neighbor flow state must stay untouched");
    assert_ne!(bad_rec.dhcp.stat, 0);
}

#[test]
fn oversized_option_lengths_terminate_walks() {
    let mut a = analyzer();
    // TCP options claiming to extend past the header.
    let opts = vec![2, 40, 1, 2];
    let seg = TcpSeg { flags: TH_SYN, options: opts, ..TcpSeg::default() }.build();
    a.process_packet(Timeval::new(0, 0), seg.len() as u32, &seg).unwrap();
    let summary = a.finalize().unwrap();
    assert_eq!(summary.records.len(), 1);
}

#[test]
fn smb_garbage_after_netbios_header_is_ignored() {
    let mut a = analyzer();
    // A NetBIOS-framed blob that is not SMB at all.
    let blob = hex::decode(
        "414243440102030405060708090a0b0c0d0e0f101112131415161718191a1b1c\
         1d1e1f202122232425262728292a2b2c2d2e2f303132333435363738393a3b3c",
    )
    .unwrap();
    let garbage = netbios(&blob);
    let seg = TcpSeg {
        dport: 445,
        seq: 1,
        flags: TH_ACK,
        payload: garbage,
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(0, 0), seg.len() as u32, &seg).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    // Analyzed (port match) but nothing parsed as SMB1/2/3.
    use flow_dissector::dissectors::smb::{SMB_STAT_SMB, SMB_STAT_SMB1, SMB_STAT_SMB2};
    assert!(rec.smb.stat & SMB_STAT_SMB != 0);
    assert_eq!(rec.smb.stat & (SMB_STAT_SMB1 | SMB_STAT_SMB2), 0);
}

#[test]
fn status_bits_accumulate_monotonically() {
    let mut a = analyzer();
    let t = |i: u64| Timeval::new(i, 0);
    // Build a TCP flow that trips several anomaly bits over time and track
    // that the aggregate never loses a bit.
    let segs = [
        TcpSeg { seq: 1000, flags: TH_SYN, ..TcpSeg::default() }.build(),
        TcpSeg { seq: 1000, flags: TH_SYN, ..TcpSeg::default() }.build(), // SYN again
        TcpSeg { seq: 1001, ack: 1, flags: TH_ACK, payload: b"abc".to_vec(), ..TcpSeg::default() }
            .build(),
    ];
    let mut seen: u16 = 0;
    for (i, s) in segs.iter().enumerate() {
        a.process_packet(t(i as u64 * 2), s.len() as u32, s).unwrap();
        assert!(i < 3);
    }
    let summary = a.finalize().unwrap();
    for rec in &summary.records {
        seen |= rec.tcp.tcp_anomaly;
    }
    assert_eq!(summary.aggregates.tcp_anomaly, seen);
}
