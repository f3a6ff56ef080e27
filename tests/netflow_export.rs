mod common;

use std::sync::{Arc, Mutex};

use common::*;
use flow_dissector::dissectors::netflow_export::ExportSink;
use flow_dissector::{Analyzer, Timeval};

#[derive(Debug, Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl ExportSink for SharedSink {
    fn send(&mut self, datagram: &[u8]) -> std::io::Result<()> {
        self.0.lock().unwrap().push(datagram.to_vec());
        Ok(())
    }
}

#[test]
fn terminated_flows_are_exported_as_v9_messages() {
    let sink = SharedSink::default();
    let mut a = Analyzer::builder()
        .with_max_flows(16)
        .with_export_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    let fwd = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 6000, b"hello");
    let rev = udp_frame([10, 0, 0, 2], [10, 0, 0, 1], 6000, 5000, b"world!");
    a.process_packet(Timeval::new(100, 0), fwd.len() as u32, &fwd).unwrap();
    a.process_packet(Timeval::new(100, 500), rev.len() as u32, &rev).unwrap();
    let summary = a.finalize().unwrap();

    assert_eq!(summary.export.v4_flows, 2);
    assert_eq!(summary.export.errors, 0);

    let datagrams = sink.0.lock().unwrap();
    // Template message first, then at least one data message.
    assert!(datagrams.len() >= 2);

    let template = &datagrams[0];
    assert_eq!(u16::from_be_bytes([template[0], template[1]]), 9);
    // Flowset id 0 marks a template set; the first template id is 256.
    assert_eq!(u16::from_be_bytes([template[20], template[21]]), 0);
    assert_eq!(u16::from_be_bytes([template[24], template[25]]), 256);

    let data = &datagrams[1];
    assert_eq!(u16::from_be_bytes([data[0], data[1]]), 9);
    let set_id = u16::from_be_bytes([data[20], data[21]]);
    assert_eq!(set_id, 256, "IPv4 data flowset uses the v4 template id");
    // First record starts with the source address.
    assert_eq!(&data[24..28], &[10, 0, 0, 1]);
}

#[test]
fn buffering_respects_the_per_message_flow_count() {
    let sink = SharedSink::default();
    let cfg = flow_dissector::config::AnalyzerConfig {
        max_flows: 64,
        export_v4_per_msg: 2,
        ..Default::default()
    };
    let mut a = Analyzer::builder()
        .with_config(cfg)
        .with_export_sink(Box::new(sink.clone()))
        .build()
        .unwrap();

    for i in 0..4u16 {
        let f = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000 + i, 6000, b"x");
        a.process_packet(Timeval::new(i as u64, 0), f.len() as u32, &f).unwrap();
    }
    let summary = a.finalize().unwrap();
    assert_eq!(summary.export.v4_flows, 4);

    let datagrams = sink.0.lock().unwrap();
    // Template plus two full data messages of two flows each.
    let data_msgs = datagrams.len() - 1;
    assert_eq!(data_msgs, 2);
}
