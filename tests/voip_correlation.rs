mod common;

use common::*;
use flow_dissector::config::AnalyzerConfig;
use flow_dissector::dissectors::voip::{
    VOIP_RTP, VOIP_SDP, VOIP_SIL_REST, VOIP_SIP, VOIP_SIP_AUDFP,
};
use flow_dissector::{Analyzer, Timeval};

const CALLER: [u8; 4] = [10, 0, 0, 7];
const CALLEE: [u8; 4] = [10, 0, 0, 8];

fn analyzer(save_dir: Option<std::path::PathBuf>) -> Analyzer {
    let cfg = AnalyzerConfig {
        max_flows: 32,
        keep_records: true,
        voip_save_dir: save_dir,
        ..AnalyzerConfig::default()
    };
    Analyzer::builder().with_config(cfg).build().expect("analyzer")
}

const INVITE: &[u8] = b"INVITE sip:bob@example.net SIP/2.0\r\n\
From: Alice <sip:alice@example.net>;tag=77\r\n\
To: <sip:bob@example.net>\r\n\
Call-ID: call-1234@pbx\r\n\
User-Agent: softphone/1.0\r\n\
Content-Type: application/sdp\r\n\
\r\n\
v=0\r\n\
c=IN IP4 10.0.0.8\r\n\
m=audio 50002 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

#[test]
fn sip_flow_resolves_the_rtp_flow_it_announced() {
    let mut a = analyzer(None);

    // The RTP stream starts first; its endpoint is registered at creation.
    let ssrc = 0xaabb_ccdd;
    for (i, seq) in [100u16, 101].iter().enumerate() {
        let rtp = rtp_packet(0, false, *seq, 8000 + i as u32 * 160, ssrc, &[0x55; 160]);
        let f = udp_frame(CALLER, CALLEE, 40000, 50002, &rtp);
        a.process_packet(Timeval::new(i as u64, 0), f.len() as u32, &f).unwrap();
    }

    // The SIP dialog announcing (10.0.0.8, 50002) as the audio endpoint.
    let f = udp_frame(CALLER, [10, 0, 0, 20], 5060, 5060, INVITE);
    a.process_packet(Timeval::new(2, 0), f.len() as u32, &f).unwrap();

    let summary = a.finalize().unwrap();
    let rtp_rec = summary.records.iter().find(|r| r.voip.stat & VOIP_RTP != 0).unwrap();
    let sip_rec = summary.records.iter().find(|r| r.voip.stat & VOIP_SIP != 0).unwrap();

    assert!(sip_rec.voip.stat & VOIP_SDP != 0);
    assert!(sip_rec.voip.stat & VOIP_SIP_AUDFP != 0);
    assert_eq!(sip_rec.voip.linked_findex, vec![rtp_rec.findex]);
    assert_eq!(sip_rec.voip.linked_ssrc, vec![ssrc]);
    assert_eq!(rtp_rec.voip.ssrcs, vec![ssrc]);
    assert_eq!(rtp_rec.voip.rtp_pkt_cnt, 2);
}

#[test]
fn sip_fields_are_parsed_and_bounded() {
    let mut a = analyzer(None);
    let f = udp_frame(CALLER, [10, 0, 0, 20], 5060, 5060, INVITE);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert_eq!(rec.voip.sip_from, vec!["sip:alice@example.net".to_string()]);
    assert_eq!(rec.voip.sip_to, vec!["sip:bob@example.net".to_string()]);
    assert_eq!(rec.voip.sip_callid, vec!["call-1234@pbx".to_string()]);
    assert_eq!(rec.voip.sip_user_agent, "softphone/1.0");
    assert!(rec.voip.sip_methods & (1 << 1) != 0); // INVITE
    assert_eq!(rec.voip.rtpmaps, vec!["0".to_string()]);
    assert_eq!(
        rec.voip.sdp_addrs,
        vec![(std::net::IpAddr::from([10, 0, 0, 8]), 50002, 0)]
    );
}

#[test]
fn g711_marker_after_gap_restores_silence() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer(Some(dir.path().to_path_buf()));

    let ssrc = 0x1111_2222;
    // 160 samples, then 40 samples of suppressed silence, then the marker.
    let p1 = rtp_packet(0, false, 1, 8000, ssrc, &[0x2a; 160]);
    let p2 = rtp_packet(0, true, 2, 8200, ssrc, &[0x2b; 160]);
    let f1 = udp_frame(CALLER, CALLEE, 40000, 50002, &p1);
    let f2 = udp_frame(CALLER, CALLEE, 40000, 50002, &p2);
    a.process_packet(Timeval::new(0, 0), f1.len() as u32, &f1).unwrap();
    a.process_packet(Timeval::new(0, 20_000), f2.len() as u32, &f2).unwrap();

    let summary = a.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.voip.stat & VOIP_RTP != 0).unwrap();
    assert!(rec.voip.stat & VOIP_SIL_REST != 0);

    let path = dir.path().join(&rec.voip.fname);
    let contents = std::fs::read(path).unwrap();
    // 160 payload + 40 silence + 160 payload.
    assert_eq!(contents.len(), 360);
    assert!(contents[160..200].iter().all(|&b| b == 0xff), "u-law silence byte");
    assert!(contents[200..].iter().all(|&b| b == 0x2b));
}

#[test]
fn rtp_sequence_gap_flags_packet_loss() {
    let mut a = analyzer(None);
    let ssrc = 7;
    let p1 = rtp_packet(0, false, 10, 8000, ssrc, &[0; 20]);
    let p2 = rtp_packet(0, false, 15, 8800, ssrc, &[0; 20]);
    let f1 = udp_frame(CALLER, CALLEE, 40000, 50002, &p1);
    let f2 = udp_frame(CALLER, CALLEE, 40000, 50002, &p2);
    a.process_packet(Timeval::new(0, 0), f1.len() as u32, &f1).unwrap();
    a.process_packet(Timeval::new(1, 0), f2.len() as u32, &f2).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert!(rec.voip.stat & flow_dissector::dissectors::voip::VOIP_RTP_PKTLSS != 0);
}
