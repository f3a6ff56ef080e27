mod common;

use common::*;
use flow_dissector::dissectors::dhcp::{
    DHCP_STAT_DET, DHCP_STAT_MAGIC_ERR, DHCP_STAT_REPLY, DHCP_STAT_REQUEST,
    DHCP_STAT_SECEL_ENDIAN,
};
use flow_dissector::flow::FlowStatus;
use flow_dissector::{Analyzer, Timeval};

const SERVER: [u8; 4] = [10, 0, 0, 1];
const CLIENT: [u8; 4] = [10, 0, 0, 5];

fn analyzer() -> Analyzer {
    Analyzer::builder()
        .with_max_flows(32)
        .with_keep_records(true)
        .build()
        .expect("analyzer")
}

#[test]
fn request_links_back_to_the_offer_flow() {
    let mut a = analyzer();

    // OFFER: server to client, offering the client address.
    let offer = DhcpMsg {
        opcode: 2,
        your_ip: CLIENT,
        options: [dhcp_option(53, &[2]), dhcp_option(54, &SERVER)].concat(),
        ..DhcpMsg::default()
    }
    .build();
    let f1 = udp_frame(SERVER, CLIENT, 67, 68, &offer);
    a.process_packet(Timeval::new(0, 0), f1.len() as u32, &f1).unwrap();

    // REQUEST: client back to server, naming the offered address and the
    // server identifier.
    let request = DhcpMsg {
        opcode: 1,
        options: [
            dhcp_option(53, &[3]),
            dhcp_option(50, &CLIENT),
            dhcp_option(54, &SERVER),
        ]
        .concat(),
        ..DhcpMsg::default()
    }
    .build();
    let f2 = udp_frame(CLIENT, SERVER, 68, 67, &request);
    a.process_packet(Timeval::new(1, 0), f2.len() as u32, &f2).unwrap();

    let summary = a.finalize().unwrap();
    let offer_rec = summary.records.iter().find(|r| r.key.src_port == 67).unwrap();
    let request_rec = summary.records.iter().find(|r| r.key.src_port == 68).unwrap();

    assert!(offer_rec.dhcp.stat & (DHCP_STAT_DET | DHCP_STAT_REPLY) != 0);
    assert!(request_rec.dhcp.stat & (DHCP_STAT_DET | DHCP_STAT_REQUEST) != 0);
    assert_eq!(offer_rec.dhcp.lflow, request_rec.findex);
    assert_eq!(request_rec.dhcp.lflow, offer_rec.findex);
    assert_eq!(request_rec.dhcp.req_ip, CLIENT);
    assert_eq!(request_rec.dhcp.srv_id, SERVER);
}

#[test]
fn reply_without_opposite_inverts_the_direction() {
    let mut a = analyzer();
    let offer = DhcpMsg {
        opcode: 2,
        your_ip: CLIENT,
        options: dhcp_option(53, &[2]),
        ..DhcpMsg::default()
    }
    .build();
    let f = udp_frame(SERVER, CLIENT, 67, 68, &offer);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = a.finalize().unwrap();
    assert!(summary.records[0].status.has(FlowStatus::DIR_INVERT));
}

#[test]
fn little_endian_seconds_elapsed_is_corrected() {
    let mut a = analyzer();
    // 5 seconds encoded little-endian: reads as 1280 big-endian.
    let discover = DhcpMsg {
        opcode: 1,
        num_sec: [0x05, 0x00],
        options: dhcp_option(53, &[1]),
        ..DhcpMsg::default()
    }
    .build();
    let f = udp_frame([0, 0, 0, 0], [255, 255, 255, 255], 68, 67, &discover);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert!(rec.dhcp.stat & DHCP_STAT_SECEL_ENDIAN != 0);
    assert_eq!(rec.dhcp.max_sec_el, 5);
}

#[test]
fn bad_magic_cookie_stops_option_parsing() {
    let mut a = analyzer();
    let mut msg = DhcpMsg {
        opcode: 1,
        options: dhcp_option(53, &[1]),
        ..DhcpMsg::default()
    }
    .build();
    msg[236] = 0; // break the cookie
    let f = udp_frame(CLIENT, SERVER, 68, 67, &msg);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert!(rec.dhcp.stat & DHCP_STAT_MAGIC_ERR != 0);
    // No message type was recorded: options were never walked.
    assert_eq!(rec.dhcp.msg_types, 0);
}

#[test]
fn host_names_are_deduplicated_with_optional_nul() {
    let mut a = analyzer();
    let mk = |name: &[u8]| {
        DhcpMsg {
            opcode: 1,
            options: [dhcp_option(53, &[1]), dhcp_option(12, name)].concat(),
            ..DhcpMsg::default()
        }
        .build()
    };
    let f1 = udp_frame(CLIENT, SERVER, 68, 67, &mk(b"workstation"));
    let f2 = udp_frame(CLIENT, SERVER, 68, 67, &mk(b"workstation\0"));
    a.process_packet(Timeval::new(0, 0), f1.len() as u32, &f1).unwrap();
    a.process_packet(Timeval::new(1, 0), f2.len() as u32, &f2).unwrap();
    let summary = a.finalize().unwrap();
    let rec = &summary.records[0];
    assert_eq!(rec.dhcp.host_names, vec!["workstation".to_string()]);
}
