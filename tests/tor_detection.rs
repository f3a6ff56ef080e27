mod common;

use common::*;
use flow_dissector::dissectors::tcp_flags::{TH_ACK, TH_PSH, TH_SYN};
use flow_dissector::dissectors::tor::{
    Certificate, CertificateParser, PKeyType, TOR_STAT_OBFUSC, TOR_STAT_PKTL, TOR_STAT_TOR,
};
use flow_dissector::{Analyzer, Timeval};

fn analyzer() -> Analyzer {
    Analyzer::builder()
        .with_max_flows(32)
        .with_keep_records(true)
        .build()
        .expect("analyzer")
}

fn tor_cipher_list() -> Vec<u16> {
    // Eleven real suites and the SCSV last.
    let mut c: Vec<u16> = (0xc000..0xc00b).collect();
    c.push(0x00ff);
    c
}

fn handshake(a: &mut Analyzer, t0: u64) -> (u32, u32) {
    let p1 = TcpSeg { dport: 443, seq: 1000, flags: TH_SYN, ..TcpSeg::default() }.build();
    let p2 = TcpSeg {
        src: [10, 0, 0, 2],
        dst: [10, 0, 0, 1],
        sport: 443,
        dport: 54321,
        seq: 9000,
        ack: 1001,
        flags: TH_SYN | TH_ACK,
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(t0, 0), p1.len() as u32, &p1).unwrap();
    a.process_packet(Timeval::new(t0, 10_000), p2.len() as u32, &p2).unwrap();
    (1001, 9001)
}

#[test]
fn tor_profile_client_hello_marks_the_flow() {
    let mut a = analyzer();
    let (seq, ack) = handshake(&mut a, 0);
    let hello = tls_client_hello(&tor_cipher_list(), "www.aabbccdd.com");
    let p = TcpSeg {
        dport: 443,
        seq,
        ack,
        flags: TH_ACK | TH_PSH,
        payload: hello,
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(0, 20_000), p.len() as u32, &p).unwrap();

    let summary = a.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.key.dst_port == 443).unwrap();
    assert!(rec.tor.stat & TOR_STAT_TOR != 0);
    assert_eq!(rec.tor.sni, "www.aabbccdd.com");
}

#[test]
fn wrong_sni_or_cipher_count_is_not_tor() {
    // SNI outside the base32 .com pattern.
    let mut a = analyzer();
    let (seq, ack) = handshake(&mut a, 0);
    let hello = tls_client_hello(&tor_cipher_list(), "www.example.org");
    let p = TcpSeg { dport: 443, seq, ack, flags: TH_ACK | TH_PSH, payload: hello, ..TcpSeg::default() }
        .build();
    a.process_packet(Timeval::new(0, 20_000), p.len() as u32, &p).unwrap();
    let summary = a.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.key.dst_port == 443).unwrap();
    assert_eq!(rec.tor.stat & TOR_STAT_TOR, 0);

    // Eleven ciphers only: below the Tor client's range.
    let mut b = analyzer();
    let (seq, ack) = handshake(&mut b, 0);
    let mut few: Vec<u16> = (0xc000..0xc00a).collect();
    few.push(0x00ff);
    let hello = tls_client_hello(&few, "www.aabbccdd.com");
    let p = TcpSeg { dport: 443, seq, ack, flags: TH_ACK | TH_PSH, payload: hello, ..TcpSeg::default() }
        .build();
    b.process_packet(Timeval::new(0, 20_000), p.len() as u32, &p).unwrap();
    let summary = b.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.key.dst_port == 443).unwrap();
    assert_eq!(rec.tor.stat & TOR_STAT_TOR, 0);
}

/// A parser that always yields a certificate failing the Tor profile.
#[derive(Debug)]
struct BigCorpCert;

impl CertificateParser for BigCorpCert {
    fn parse_x509(&self, _der: &[u8]) -> Option<Certificate> {
        Some(Certificate {
            subject_cn: "shop.example.com".into(),
            subject_org: "Example Corp".into(),
            subject_country: "US".into(),
            issuer_cn: "Example CA".into(),
            issuer_org: "Example Trust".into(),
            issuer_country: "US".into(),
            not_before: 1_600_000_000,
            not_after: 1_700_000_000,
            pkey_type: PKeyType::Rsa,
            pkey_bits: 4096,
        })
    }
}

#[test]
fn failing_certificate_vetoes_the_client_direction() {
    let mut a = Analyzer::builder()
        .with_max_flows(32)
        .with_keep_records(true)
        .with_cert_parser(Box::new(BigCorpCert))
        .build()
        .unwrap();
    let (seq, ack) = handshake(&mut a, 0);

    let hello = tls_client_hello(&tor_cipher_list(), "www.aabbccdd.com");
    let p = TcpSeg { dport: 443, seq, ack, flags: TH_ACK | TH_PSH, payload: hello, ..TcpSeg::default() }
        .build();
    a.process_packet(Timeval::new(0, 20_000), p.len() as u32, &p).unwrap();

    // Server certificate message.
    let der = vec![0x30, 0x82, 0x01, 0x00]; // opaque to the stub parser
    let mut certs = Vec::new();
    certs.extend_from_slice(&((der.len() + 3) as u32).to_be_bytes()[1..]);
    certs.extend_from_slice(&(der.len() as u32).to_be_bytes()[1..]);
    certs.extend_from_slice(&der);
    let mut handshake_msg = vec![11];
    handshake_msg.extend_from_slice(&(certs.len() as u32).to_be_bytes()[1..]);
    handshake_msg.extend_from_slice(&certs);
    let mut record = vec![22, 3, 3];
    record.extend_from_slice(&(handshake_msg.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake_msg);

    let p = TcpSeg {
        src: [10, 0, 0, 2],
        dst: [10, 0, 0, 1],
        sport: 443,
        dport: 54321,
        seq: 9001,
        ack: seq,
        flags: TH_ACK | TH_PSH,
        payload: record,
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(0, 30_000), p.len() as u32, &p).unwrap();

    let summary = a.finalize().unwrap();
    let client = summary.records.iter().find(|r| r.key.dst_port == 443).unwrap();
    assert_eq!(client.tor.stat & TOR_STAT_TOR, 0, "certificate evidence must veto");
}

#[test]
fn uniform_payloads_in_both_directions_mean_obfuscation() {
    let mut a = analyzer();
    let (seq, ack) = handshake(&mut a, 0);

    // Perfectly uniform 1024-byte payloads: normalized entropy 1.0.
    let uniform: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
    let p1 = TcpSeg {
        dport: 443,
        seq,
        ack,
        flags: TH_ACK | TH_PSH,
        payload: uniform.clone(),
        ..TcpSeg::default()
    }
    .build();
    let p2 = TcpSeg {
        src: [10, 0, 0, 2],
        dst: [10, 0, 0, 1],
        sport: 443,
        dport: 54321,
        seq: 9001,
        ack: seq.wrapping_add(1024),
        flags: TH_ACK | TH_PSH,
        payload: uniform,
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(0, 20_000), p1.len() as u32, &p1).unwrap();
    a.process_packet(Timeval::new(0, 30_000), p2.len() as u32, &p2).unwrap();

    let summary = a.finalize().unwrap();
    assert!(
        summary.records.iter().any(|r| r.tor.stat & TOR_STAT_OBFUSC != 0),
        "both directions high-entropy and gap-free"
    );
}

#[test]
fn port_443_length_modulo_heuristic() {
    let mut a = analyzer();
    // IP lengths 58 (mod 8 = 2) and 1454 (mod 8 = 6).
    let p1 = TcpSeg {
        dport: 443,
        seq: 1,
        flags: TH_ACK,
        payload: vec![0u8; 18],
        ..TcpSeg::default()
    }
    .build();
    let p2 = TcpSeg {
        dport: 443,
        seq: 19,
        flags: TH_ACK,
        payload: vec![0u8; 1414],
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(0, 0), p1.len() as u32, &p1).unwrap();
    a.process_packet(Timeval::new(0, 10_000), p2.len() as u32, &p2).unwrap();
    let summary = a.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.key.dst_port == 443).unwrap();
    assert!(rec.tor.stat & TOR_STAT_PKTL != 0);
}
