mod common;

use common::*;
use flow_dissector::config::AnalyzerConfig;
use flow_dissector::dissectors::smb::{SMB_STAT_SEQ_RESET, SMB_STAT_SMB2, SMB_STAT_WFSMB2};
use flow_dissector::dissectors::tcp_flags::{TH_ACK, TH_PSH};
use flow_dissector::{Analyzer, Timeval};

fn analyzer(save_dir: std::path::PathBuf) -> Analyzer {
    let cfg = AnalyzerConfig {
        max_flows: 32,
        keep_records: true,
        smb_save_dir: Some(save_dir),
        ..AnalyzerConfig::default()
    };
    Analyzer::builder().with_config(cfg).build().expect("analyzer")
}

/// SMB2 WRITE request: 48-byte fixed part followed by the data.
fn smb2_write_msg(fid: [u8; 16], offset: u64, data: &[u8]) -> Vec<u8> {
    let mut msg = smb2_header(9, 3, false);
    let mut w = Vec::new();
    w.extend_from_slice(&49u16.to_le_bytes()); // structure size
    w.extend_from_slice(&112u16.to_le_bytes()); // data offset from SMB header
    w.extend_from_slice(&(data.len() as u32).to_le_bytes());
    w.extend_from_slice(&offset.to_le_bytes());
    w.extend_from_slice(&fid);
    w.extend_from_slice(&0u32.to_le_bytes()); // channel
    w.extend_from_slice(&0u32.to_le_bytes()); // remaining bytes
    w.extend_from_slice(&0u16.to_le_bytes()); // write channel info offset
    w.extend_from_slice(&0u16.to_le_bytes()); // write channel info length
    w.extend_from_slice(&0u32.to_le_bytes()); // flags
    assert_eq!(w.len(), 48);
    msg.extend_from_slice(&w);
    msg.extend_from_slice(data);
    msg
}

fn tcp_seg_to_port445(seq: u32, payload: &[u8]) -> Vec<u8> {
    TcpSeg {
        dport: 445,
        sport: 50123,
        seq,
        ack: 1,
        flags: TH_ACK | TH_PSH,
        payload: payload.to_vec(),
        ..TcpSeg::default()
    }
    .build()
}

#[test]
fn write_spanning_two_segments_reconstructs_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer(dir.path().to_path_buf());

    let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let framed = netbios(&smb2_write_msg([0x11; 16], 0, &data));

    // First segment: NetBIOS header, SMB2 header, write header, 1400 bytes
    // of data. Second segment: the remaining 600 bytes.
    let split = 4 + 64 + 48 + 1400;
    let f1 = tcp_seg_to_port445(1, &framed[..split]);
    let f2 = tcp_seg_to_port445(1 + framed[..split].len() as u32, &framed[split..]);
    a.process_packet(Timeval::new(0, 0), f1.len() as u32, &f1).unwrap();
    a.process_packet(Timeval::new(0, 100_000), f2.len() as u32, &f2).unwrap();

    let summary = a.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.key.dst_port == 445).unwrap();
    assert!(rec.smb.stat & SMB_STAT_SMB2 != 0);
    assert!(rec.smb.stat & SMB_STAT_WFSMB2 != 0);

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    let contents = std::fs::read(&entries[0]).unwrap();
    assert_eq!(contents.len(), 2000, "whole write must land in the carve file");
    assert_eq!(contents, data);
    let name = entries[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("File_Id_11111111-1111-1111-1111-111111111111"));
}

#[test]
fn write_at_nonzero_offset_seeks_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer(dir.path().to_path_buf());

    let framed = netbios(&smb2_write_msg([0x22; 16], 8, b"abcd"));
    let f = tcp_seg_to_port445(1, &framed);
    a.process_packet(Timeval::new(0, 0), f.len() as u32, &f).unwrap();
    a.finalize().unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    let contents = std::fs::read(&entries[0]).unwrap();
    assert_eq!(contents.len(), 12);
    assert_eq!(&contents[8..], b"abcd");
    assert_eq!(&contents[..8], &[0u8; 8]);
}

#[test]
fn missing_segment_resets_the_reassembly_machine() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer(dir.path().to_path_buf());

    let data = vec![0x5au8; 3000];
    let framed = netbios(&smb2_write_msg([0x33; 16], 0, &data));
    let split = 4 + 64 + 48 + 1000;
    let f1 = tcp_seg_to_port445(1, &framed[..split]);
    // The second segment arrives with a 400-byte hole in the stream.
    let f2 = tcp_seg_to_port445(1 + split as u32 + 400, &framed[split + 400..]);
    a.process_packet(Timeval::new(0, 0), f1.len() as u32, &f1).unwrap();
    a.process_packet(Timeval::new(0, 100_000), f2.len() as u32, &f2).unwrap();

    let summary = a.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.key.dst_port == 445).unwrap();
    assert!(rec.smb.stat & SMB_STAT_SEQ_RESET != 0);
}

#[test]
fn create_response_writes_one_guid_map_entry() {
    let dir = tempfile::tempdir().unwrap();
    let map_path = dir.path().join("guid_map.txt");
    let cfg = AnalyzerConfig {
        max_flows: 32,
        keep_records: true,
        smb_save_dir: Some(dir.path().to_path_buf()),
        guid_map_file: Some(map_path.clone()),
        ..AnalyzerConfig::default()
    };
    let mut a = Analyzer::builder().with_config(cfg).build().unwrap();

    // CREATE request from the client naming the file.
    let mut req = smb2_header(5, 11, false);
    let fname: Vec<u8> = "secrets.xlsx".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    let mut body = vec![0u8; 48];
    body[0] = 57; // structure size
    let noff = (64 + 56) as u16; // name directly after the fixed part
    body[44..46].copy_from_slice(&noff.to_le_bytes());
    body[46..48].copy_from_slice(&(fname.len() as u16).to_le_bytes());
    body.extend_from_slice(&[0u8; 8]); // up to the name offset
    body.extend_from_slice(&fname);
    req.extend_from_slice(&body);
    let f1 = tcp_seg_to_port445(1, &netbios(&req));
    a.process_packet(Timeval::new(0, 0), f1.len() as u32, &f1).unwrap();

    // CREATE response from the server carrying the file id.
    let mut resp = smb2_header(5, 11, true);
    let mut rbody = vec![0u8; 64];
    rbody[0] = 89; // structure size
    rbody.extend_from_slice(&[0x77; 16]); // file id
    resp.extend_from_slice(&rbody);
    let f2 = TcpSeg {
        src: [10, 0, 0, 2],
        dst: [10, 0, 0, 1],
        sport: 445,
        dport: 50123,
        seq: 1,
        ack: 1,
        flags: TH_ACK | TH_PSH,
        payload: netbios(&resp),
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(0, 50_000), f2.len() as u32, &f2).unwrap();

    a.finalize().unwrap();
    let map = std::fs::read_to_string(&map_path).unwrap();
    assert_eq!(map.lines().count(), 1);
    assert!(map.contains("secrets.xlsx"));
    assert!(map.contains("File_Id_77777777-7777-7777-7777-777777777777"));
}

#[test]
fn negotiate_response_fills_server_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = analyzer(dir.path().to_path_buf());

    let mut msg = smb2_header(0, 1, true); // NEGOTIATE response
    let mut body = Vec::new();
    body.extend_from_slice(&65u16.to_le_bytes()); // structure size
    body.push(0x01); // security mode: signing enabled
    body.push(0);
    body.extend_from_slice(&0x0302u16.to_le_bytes()); // dialect 3.0.2
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&[0xab; 16]); // server GUID
    body.extend_from_slice(&0x00000001u32.to_le_bytes()); // capabilities
    body.extend_from_slice(&0x00100000u32.to_le_bytes()); // max transact
    body.extend_from_slice(&0x00100000u32.to_le_bytes()); // max read
    body.extend_from_slice(&0x00100000u32.to_le_bytes()); // max write
    body.extend_from_slice(&0u64.to_le_bytes()); // system time
    // Server start time: 2021-01-01 as FILETIME.
    body.extend_from_slice(&132_537_600_000_000_000u64.to_le_bytes());
    body.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&body);

    let framed = netbios(&msg);
    let seg = TcpSeg {
        src: [10, 0, 0, 2],
        dst: [10, 0, 0, 1],
        sport: 445,
        dport: 50123,
        seq: 1,
        ack: 1,
        flags: TH_ACK | TH_PSH,
        payload: framed,
        ..TcpSeg::default()
    }
    .build();
    a.process_packet(Timeval::new(0, 0), seg.len() as u32, &seg).unwrap();

    let summary = a.finalize().unwrap();
    let rec = summary.records.iter().find(|r| r.key.src_port == 445).unwrap();
    assert_eq!(rec.smb.dialects2, vec![0x0302]);
    assert_eq!(rec.smb.sec_mode, 0x01);
    assert_eq!(rec.smb.max_read, 0x0010_0000);
    assert_eq!(rec.smb.server_start_time, 1_609_459_200);
    assert!(!rec.smb.guid.is_empty());
}
