//! Frame builders shared by the integration tests: hand-assembled Ethernet,
//! IPv4, TCP/UDP and application payloads with valid checksums.

#![allow(dead_code)]

use flow_dissector::checksum;

pub const MAC_A: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0a];
pub const MAC_B: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0b];

pub fn eth_frame(src: [u8; 6], dst: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(14 + payload.len());
    f.extend_from_slice(&dst);
    f.extend_from_slice(&src);
    f.extend_from_slice(&ethertype.to_be_bytes());
    f.extend_from_slice(payload);
    f
}

pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], proto: u8, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut p = vec![
        0x45,
        0x00,
        (total >> 8) as u8,
        total as u8,
        0x00,
        0x01,
        0x40,
        0x00, // DF
        ttl,
        proto,
        0,
        0,
    ];
    p.extend_from_slice(&src);
    p.extend_from_slice(&dst);
    let ck = checksum::ipv4_header_checksum(&p);
    p[10] = (ck >> 8) as u8;
    p[11] = ck as u8;
    p.extend_from_slice(payload);
    p
}

pub fn udp_packet(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut udp = Vec::with_capacity(len);
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&(len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let acc = checksum::pseudo_header_v4(src, dst, 17, len as u16);
    let ck = checksum::ipsum(&udp, acc);
    let ck = if ck == 0 { 0xffff } else { ck };
    udp[6] = (ck >> 8) as u8;
    udp[7] = ck as u8;
    ipv4_packet(src, dst, 17, 64, &udp)
}

pub struct TcpSeg {
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: Vec<u8>,
    pub options: Vec<u8>,
    pub ttl: u8,
}

impl Default for TcpSeg {
    fn default() -> Self {
        TcpSeg {
            src: [10, 0, 0, 1],
            dst: [10, 0, 0, 2],
            sport: 54321,
            dport: 80,
            seq: 1000,
            ack: 0,
            flags: 0x02,
            window: 65535,
            payload: Vec::new(),
            options: Vec::new(),
            ttl: 64,
        }
    }
}

impl TcpSeg {
    pub fn build(&self) -> Vec<u8> {
        let mut opts = self.options.clone();
        while opts.len() % 4 != 0 {
            opts.push(0); // end-of-options padding
        }
        let hdr_len = 20 + opts.len();
        let mut tcp = Vec::with_capacity(hdr_len + self.payload.len());
        tcp.extend_from_slice(&self.sport.to_be_bytes());
        tcp.extend_from_slice(&self.dport.to_be_bytes());
        tcp.extend_from_slice(&self.seq.to_be_bytes());
        tcp.extend_from_slice(&self.ack.to_be_bytes());
        let off_flags = (((hdr_len / 4) as u16) << 12) | self.flags as u16;
        tcp.extend_from_slice(&off_flags.to_be_bytes());
        tcp.extend_from_slice(&self.window.to_be_bytes());
        tcp.extend_from_slice(&[0, 0]); // checksum placeholder
        tcp.extend_from_slice(&[0, 0]); // urgent
        tcp.extend_from_slice(&opts);
        tcp.extend_from_slice(&self.payload);
        let acc = checksum::pseudo_header_v4(self.src, self.dst, 6, tcp.len() as u16);
        let ck = checksum::ipsum(&tcp, acc);
        let ck = if ck == 0 { 0xffff } else { ck };
        tcp[16] = (ck >> 8) as u8;
        tcp[17] = ck as u8;
        eth_frame(MAC_A, MAC_B, 0x0800, &ipv4_packet(self.src, self.dst, 6, self.ttl, &tcp))
    }
}

pub fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    eth_frame(MAC_A, MAC_B, 0x0800, &udp_packet(src, dst, sport, dport, payload))
}

/// ARP message on Ethernet: `(opcode, sender MAC/IP, target MAC/IP)`.
pub fn arp_frame(
    eth_src: [u8; 6],
    opcode: u16,
    smac: [u8; 6],
    sip: [u8; 4],
    tmac: [u8; 6],
    tip: [u8; 4],
) -> Vec<u8> {
    let mut arp = Vec::with_capacity(28);
    arp.extend_from_slice(&1u16.to_be_bytes()); // Ethernet
    arp.extend_from_slice(&0x0800u16.to_be_bytes()); // IPv4
    arp.push(6);
    arp.push(4);
    arp.extend_from_slice(&opcode.to_be_bytes());
    arp.extend_from_slice(&smac);
    arp.extend_from_slice(&sip);
    arp.extend_from_slice(&tmac);
    arp.extend_from_slice(&tip);
    eth_frame(eth_src, [0xff; 6], 0x0806, &arp)
}

/// BOOTP/DHCP message with the given options (without the end marker).
pub struct DhcpMsg {
    pub opcode: u8,
    pub num_sec: [u8; 2],
    pub client_ip: [u8; 4],
    pub your_ip: [u8; 4],
    pub client_mac: [u8; 6],
    pub options: Vec<u8>,
}

impl Default for DhcpMsg {
    fn default() -> Self {
        DhcpMsg {
            opcode: 1,
            num_sec: [0, 0],
            client_ip: [0; 4],
            your_ip: [0; 4],
            client_mac: [0x02, 0, 0, 0, 0, 0x05],
            options: Vec::new(),
        }
    }
}

impl DhcpMsg {
    pub fn build(&self) -> Vec<u8> {
        let mut m = vec![self.opcode, 1, 6, 0];
        m.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]); // xid
        m.extend_from_slice(&self.num_sec);
        m.extend_from_slice(&[0, 0]); // flags
        m.extend_from_slice(&self.client_ip);
        m.extend_from_slice(&self.your_ip);
        m.extend_from_slice(&[0; 4]); // next server
        m.extend_from_slice(&[0; 4]); // relay
        m.extend_from_slice(&self.client_mac);
        m.extend_from_slice(&[0; 10]); // hw addr padding
        m.extend_from_slice(&[0; 64]); // server host name
        m.extend_from_slice(&[0; 128]); // boot file
        m.extend_from_slice(&[0x63, 0x82, 0x53, 0x63]); // magic cookie
        m.extend_from_slice(&self.options);
        m.push(0xff);
        m
    }
}

pub fn dhcp_option(code: u8, value: &[u8]) -> Vec<u8> {
    let mut o = vec![code, value.len() as u8];
    o.extend_from_slice(value);
    o
}

pub fn ipv6_packet(src: [u8; 16], dst: [u8; 16], proto: u8, hop: u8, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x60, 0, 0, 0];
    p.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    p.push(proto);
    p.push(hop);
    p.extend_from_slice(&src);
    p.extend_from_slice(&dst);
    p.extend_from_slice(payload);
    p
}

/// OSPFv3 packet with a correct length field; checksum left zero.
pub fn ospf3_packet(msg_type: u8, router_id: [u8; 4], area: u32, body: &[u8]) -> Vec<u8> {
    let len = 16 + body.len();
    let mut p = vec![3, msg_type];
    p.extend_from_slice(&(len as u16).to_be_bytes());
    p.extend_from_slice(&router_id);
    p.extend_from_slice(&area.to_be_bytes());
    p.extend_from_slice(&[0, 0]); // checksum
    p.push(0); // instance id
    p.push(0); // reserved
    p.extend_from_slice(body);
    p
}

/// OSPFv2 packet with a correct length field; checksum left zero.
pub fn ospf2_packet(msg_type: u8, router_id: [u8; 4], area: u32, body: &[u8]) -> Vec<u8> {
    let len = 24 + body.len();
    let mut p = vec![2, msg_type];
    p.extend_from_slice(&(len as u16).to_be_bytes());
    p.extend_from_slice(&router_id);
    p.extend_from_slice(&area.to_be_bytes());
    p.extend_from_slice(&[0, 0]); // checksum
    p.extend_from_slice(&[0, 0]); // auth type: null
    p.extend_from_slice(&[0; 8]); // auth data
    p.extend_from_slice(body);
    p
}

pub fn ospf2_hello_body(netmask: [u8; 4], neighbors: &[[u8; 4]]) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&netmask);
    b.extend_from_slice(&10u16.to_be_bytes()); // hello interval
    b.push(0x02); // options: E
    b.push(1); // priority
    b.extend_from_slice(&40u32.to_be_bytes()); // dead interval
    b.extend_from_slice(&[10, 0, 0, 1]); // designated router
    b.extend_from_slice(&[10, 0, 0, 2]); // backup
    for n in neighbors {
        b.extend_from_slice(n);
    }
    b
}

/// SMB2 header (64 bytes).
pub fn smb2_header(opcode: u16, msg_id: u64, response: bool) -> Vec<u8> {
    let mut h = vec![0xfe, b'S', b'M', b'B'];
    h.extend_from_slice(&64u16.to_le_bytes()); // structure size
    h.extend_from_slice(&0u16.to_le_bytes()); // credit charge
    h.extend_from_slice(&0u32.to_le_bytes()); // status
    h.extend_from_slice(&opcode.to_le_bytes());
    h.extend_from_slice(&1u16.to_le_bytes()); // credits
    h.extend_from_slice(&(if response { 1u32 } else { 0u32 }).to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // next command
    h.extend_from_slice(&msg_id.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // process id
    h.extend_from_slice(&0u32.to_le_bytes()); // tree id
    h.extend_from_slice(&0u64.to_le_bytes()); // session id
    h.extend_from_slice(&[0u8; 16]); // signature
    assert_eq!(h.len(), 64);
    h
}

/// NetBIOS session wrapper around one SMB message.
pub fn netbios(msg: &[u8]) -> Vec<u8> {
    let mut f = vec![0u8];
    f.extend_from_slice(&(msg.len() as u32).to_be_bytes()[1..]);
    f.extend_from_slice(msg);
    f
}

/// RTP packet: version 2, the given payload type, marker, seq, ts, ssrc.
pub fn rtp_packet(pt: u8, marker: bool, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x80, if marker { pt | 0x80 } else { pt }];
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&ts.to_be_bytes());
    p.extend_from_slice(&ssrc.to_be_bytes());
    p.extend_from_slice(payload);
    p
}

/// Minimal TLS ClientHello record with the given cipher list and SNI.
pub fn tls_client_hello(ciphers: &[u16], sni: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes()); // TLS 1.2
    body.extend_from_slice(&[0xab; 32]); // random
    body.push(0); // session id length
    body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
    for c in ciphers {
        body.extend_from_slice(&c.to_be_bytes());
    }
    body.push(1); // compression methods
    body.push(0); // null

    // server_name extension
    let name = sni.as_bytes();
    let mut ext = Vec::new();
    ext.extend_from_slice(&0u16.to_be_bytes()); // type: server_name
    ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list length
    ext.push(0); // host_name
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![1]; // client hello
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![22, 3, 1]; // handshake, TLS 1.0 record version
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
