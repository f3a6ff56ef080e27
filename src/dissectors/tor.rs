//! TLS fingerprinting and Tor / obfuscated-Tor classification.
//!
//! The client side is judged by its ClientHello (cipher-list shape, trailing
//! SCSV, absence of server-only extensions, SNI pattern); the server side
//! can only veto: a ServerHello carrying non-Tor extensions or a certificate
//! that fails the Tor profile marks the conversation as not-Tor. The veto is
//! a separate bit so the per-flow status register stays monotonic; the
//! exported classification combines both at flow termination.
//!
//! X.509 parsing is a collaborator interface: the engine consumes only the
//! handful of certificate fields [`Certificate`] names.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::AnalyzerError;
use crate::config::AnalyzerConfig;
use crate::dispatcher::Dissector;
use crate::flow::FlowRecord;
use crate::output::{ColumnType, MonitoringState, OutputBuffer, Report, Schema};
use crate::packet::PacketRecord;
use crate::protocol::L3_TCP;

const PLUGIN: &str = "torDetector";

pub const TOR_STAT_TOR: u8 = 0x01; // Tor flow
pub const TOR_STAT_OBFUSC: u8 = 0x02; // obfuscated Tor flow
pub const TOR_STAT_CLIHELLO: u8 = 0x04; // ClientHello matched the Tor profile
pub const TOR_STAT_PKTL: u8 = 0x08; // packet-length modulo heuristic
pub const TOR_STAT_VETO: u8 = 0x10; // server evidence contradicts Tor
pub const TOR_STAT_ENTROPY: u8 = 0x20; // high-entropy payload direction
pub const TOR_STAT_GAP: u8 = 0x40; // TCP gap, entropy not assessable
pub const TOR_STAT_SNAP: u8 = 0x80; // record truncated by snap length

const TOR_MAX_CERT_LEN: u32 = 600;
const OBFUSC_BYTES: usize = 1024;
const OBFUSC_THRESHOLD: f64 = 0.97;
const SCSV_EMPTY_RENEG: u16 = 0x00ff;
const TLS_BUF_MAX: usize = 8192;

const EXT_SERVER_NAME: u16 = 0;
const EXT_RENEG_INFO: u16 = 0xff01;
const EXT_ALPN: u16 = 16;
const EXT_NPN: u16 = 13172;

static SUBJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^www\.[a-z2-7]{8,20}\.net$").expect("literal pattern")
});
static ISSUER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^www\.[a-z2-7]{8,20}\.(net|com)$").expect("literal pattern")
});
static SNI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^www\.[a-z2-7]{4,25}\.com$").expect("literal pattern")
});

/// Public key algorithm of a server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PKeyType {
    Rsa,
    Dsa,
    Ecdsa,
    Other,
}

/// The certificate fields the detector consumes, produced by the external
/// X.509 parsing collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct Certificate {
    pub subject_cn: String,
    pub subject_org: String,
    pub subject_country: String,
    pub issuer_cn: String,
    pub issuer_org: String,
    pub issuer_country: String,
    /// Validity bounds as Unix seconds.
    pub not_before: i64,
    pub not_after: i64,
    pub pkey_type: PKeyType,
    pub pkey_bits: u32,
}

/// X.509 parsing collaborator: `parse_x509(der) -> Certificate`.
pub trait CertificateParser: std::fmt::Debug {
    fn parse_x509(&self, der: &[u8]) -> Option<Certificate>;
}

/// Default collaborator: no parser wired in, certificates yield no evidence.
#[derive(Debug, Default)]
pub struct NoCertParser;

impl CertificateParser for NoCertParser {
    fn parse_x509(&self, _der: &[u8]) -> Option<Certificate> {
        None
    }
}

/// The conjunction of certificate rules for a Tor-profile server cert.
pub fn cert_is_tor(cert: &Certificate, cert_len: u32) -> bool {
    if cert_len > TOR_MAX_CERT_LEN {
        return false;
    }
    if cert.pkey_type != PKeyType::Rsa || (cert.pkey_bits != 1024 && cert.pkey_bits != 2048) {
        return false;
    }
    let validity = cert.not_after - cert.not_before;
    if cert.not_before % 86_400 != 0 && validity != 365 * 86_400 {
        return false;
    }
    if cert.subject_cn == cert.issuer_cn {
        return false; // self-signed
    }
    if !cert.subject_org.is_empty()
        || !cert.issuer_org.is_empty()
        || !cert.subject_country.is_empty()
        || !cert.issuer_country.is_empty()
    {
        return false;
    }
    SUBJECT_RE.is_match(&cert.subject_cn) && ISSUER_RE.is_match(&cert.issuer_cn)
}

#[derive(Debug, Clone, Default)]
struct Slot {
    stat: u8,
    active: bool,
    // entropy accounting over the first bytes of the stream
    buckets: Option<Box<[u16; 256]>>,
    byte_count: usize,
    expected_seq: u32,
    seq_valid: bool,
    // packet-length heuristic
    port443: bool,
    min_len: u16,
    max_len: u16,
    // TLS stream buffer
    tls_buf: Vec<u8>,
    tls_done: bool,
    sni: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TorRecord {
    pub stat: u8,
    pub sni: String,
}

impl TorRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u8(self.stat);
        buf.append_str(&self.sni);
    }
}

#[derive(Debug)]
pub struct TorDissector {
    slots: Vec<Slot>,
    cert_parser: Box<dyn CertificateParser>,
    agg_stat: u8,
    num_tor: u64,
    num_obfusc: u64,
}

impl TorDissector {
    pub fn new(cfg: &AnalyzerConfig, cert_parser: Box<dyn CertificateParser>) -> TorDissector {
        TorDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            cert_parser,
            agg_stat: 0,
            num_tor: 0,
            num_obfusc: 0,
        }
    }

    pub fn reset_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
        }
    }

    pub fn on_new_flow(&mut self, pkt: &PacketRecord<'_>, idx: usize, flow: &FlowRecord) {
        if flow.key.proto != L3_TCP || idx >= self.slots.len() {
            return;
        }
        let slot = &mut self.slots[idx];
        slot.active = true;
        slot.port443 = flow.key.src_port == 443 || flow.key.dst_port == 443;
        slot.min_len = u16::MAX;
        let _ = pkt;
    }

    pub fn on_layer4(&mut self, pkt: &PacketRecord<'_>, idx: usize, opp_idx: Option<usize>) {
        if idx >= self.slots.len() || !self.slots[idx].active {
            return;
        }
        let Some(tcp) = pkt.tcp() else { return };
        let payload = pkt.l7_bytes();

        // Packet-length heuristic on the IP length.
        if let Some(v4) = pkt.ipv4 {
            let slot = &mut self.slots[idx];
            slot.min_len = slot.min_len.min(v4.total_len);
            slot.max_len = slot.max_len.max(v4.total_len);
        }

        if payload.is_empty() {
            return;
        }

        // Entropy accumulation requires a gap-free prefix of the stream.
        {
            let slot = &mut self.slots[idx];
            if slot.seq_valid && tcp.seq != slot.expected_seq {
                slot.stat |= TOR_STAT_GAP;
            }
            slot.expected_seq = tcp.seq.wrapping_add(payload.len() as u32);
            slot.seq_valid = true;
            if slot.stat & TOR_STAT_GAP == 0 && slot.byte_count < OBFUSC_BYTES {
                let buckets = slot.buckets.get_or_insert_with(|| Box::new([0u16; 256]));
                for &b in payload.iter().take(OBFUSC_BYTES - slot.byte_count) {
                    buckets[b as usize] += 1;
                }
                slot.byte_count = (slot.byte_count + payload.len()).min(OBFUSC_BYTES);
                if slot.byte_count >= OBFUSC_BYTES
                    && entropy_per_byte(buckets, OBFUSC_BYTES) > OBFUSC_THRESHOLD
                {
                    slot.stat |= TOR_STAT_ENTROPY;
                }
            }
        }

        // Sliding TLS record parse over the buffered stream.
        {
            let slot = &mut self.slots[idx];
            if slot.tls_done {
                return;
            }
            if pkt.snap_l7_len() < pkt.l7_len as usize {
                slot.stat |= TOR_STAT_SNAP;
            }
            let room = TLS_BUF_MAX.saturating_sub(slot.tls_buf.len());
            slot.tls_buf.extend_from_slice(&payload[..payload.len().min(room)]);
        }
        self.parse_tls(idx, opp_idx);
    }

    fn parse_tls(&mut self, idx: usize, opp_idx: Option<usize>) {
        loop {
            let (rec_type, rec_len, have) = {
                let slot = &self.slots[idx];
                if slot.tls_buf.len() < 5 {
                    return;
                }
                let rec_len = u16::from_be_bytes([slot.tls_buf[3], slot.tls_buf[4]]) as usize;
                (slot.tls_buf[0], rec_len, slot.tls_buf.len() - 5)
            };
            // Only TLS content types 20..23 are plausible; anything else
            // means this is not TLS, stop buffering.
            if !(20..=23).contains(&rec_type) || rec_len > 1 << 14 {
                self.slots[idx].tls_done = true;
                return;
            }
            if have < rec_len {
                return; // record spans further segments
            }
            let record: Vec<u8> = self.slots[idx].tls_buf[5..5 + rec_len].to_vec();
            self.slots[idx].tls_buf.drain(..5 + rec_len);
            if rec_type == 22 {
                self.handshake(idx, opp_idx, &record);
            } else {
                // Past the handshake everything is encrypted.
                self.slots[idx].tls_done = true;
                return;
            }
        }
    }

    fn handshake(&mut self, idx: usize, opp_idx: Option<usize>, msg: &[u8]) {
        if msg.len() < 4 {
            return;
        }
        let hs_type = msg[0];
        let body = &msg[4..];
        match hs_type {
            1 => self.client_hello(idx, body),
            2 => self.server_hello(idx, opp_idx, body),
            11 => self.certificate(idx, opp_idx, body),
            _ => {}
        }
    }

    fn client_hello(&mut self, idx: usize, body: &[u8]) {
        let Some(mut p) = hello_skip_prefix(body) else { return };
        // Cipher list.
        let Some(raw_len) = read_u16(body, p) else { return };
        p += 2;
        let n_ciphers = raw_len as usize / 2;
        if !(12..=27).contains(&n_ciphers) {
            return;
        }
        let Some(last_cipher) = read_u16(body, p + (n_ciphers - 1) * 2) else { return };
        p += n_ciphers * 2;
        if last_cipher != SCSV_EMPTY_RENEG {
            return;
        }
        // Compression methods.
        let Some(&comp_len) = body.get(p) else { return };
        p += 1 + comp_len as usize;

        let mut non_tor_ext = false;
        let mut sni = String::new();
        if p + 2 <= body.len() {
            p += 2; // extensions total length
            while p + 4 <= body.len() {
                let ext_type = match read_u16(body, p) {
                    Some(v) => v,
                    None => break,
                };
                let ext_len = match read_u16(body, p + 2) {
                    Some(v) => v as usize,
                    None => break,
                };
                let ext = match body.get(p + 4..p + 4 + ext_len) {
                    Some(e) => e,
                    None => break,
                };
                match ext_type {
                    EXT_SERVER_NAME => {
                        // list length (2), type (1), name length (2), name
                        if ext.len() >= 5 && ext[2] == 0 {
                            let nlen = u16::from_be_bytes([ext[3], ext[4]]) as usize;
                            if let Some(name) = ext.get(5..5 + nlen) {
                                sni = String::from_utf8_lossy(name).into_owned();
                            }
                        }
                    }
                    // Server-only or never-Tor extensions.
                    EXT_RENEG_INFO | EXT_ALPN | EXT_NPN => non_tor_ext = true,
                    _ => {}
                }
                p += 4 + ext_len;
            }
        }

        let slot = &mut self.slots[idx];
        if !sni.is_empty() {
            slot.sni = sni.clone();
        }
        if !non_tor_ext && SNI_RE.is_match(&sni) {
            slot.stat |= TOR_STAT_CLIHELLO;
        }
    }

    fn server_hello(&mut self, idx: usize, opp_idx: Option<usize>, body: &[u8]) {
        let Some(mut p) = hello_skip_prefix(body) else { return };
        p += 2; // chosen cipher
        p += 1; // compression method
        let mut non_tor_ext = false;
        if p + 2 <= body.len() {
            p += 2;
            while p + 4 <= body.len() {
                let ext_type = match read_u16(body, p) {
                    Some(v) => v,
                    None => break,
                };
                let ext_len = match read_u16(body, p + 2) {
                    Some(v) => v as usize,
                    None => break,
                };
                if matches!(ext_type, EXT_ALPN | EXT_NPN) {
                    non_tor_ext = true;
                }
                p += 4 + ext_len;
            }
        }
        // A server that negotiates ALPN/NPN is not a Tor relay: veto the
        // client direction.
        if non_tor_ext {
            self.slots[idx].stat |= TOR_STAT_VETO;
            if let Some(o) = opp_idx
                && let Some(opp) = self.slots.get_mut(o)
            {
                opp.stat |= TOR_STAT_VETO;
            }
        }
    }

    fn certificate(&mut self, idx: usize, opp_idx: Option<usize>, body: &[u8]) {
        if body.len() < 6 {
            return;
        }
        // Total length (3), then the first certificate's length and DER.
        let cert_len = u32::from_be_bytes([0, body[3], body[4], body[5]]);
        let der = body.get(6..6 + cert_len as usize).unwrap_or(&body[6..]);
        let tor = match self.cert_parser.parse_x509(der) {
            Some(cert) => cert_is_tor(&cert, cert_len),
            None => return, // no evidence either way
        };
        if !tor {
            self.slots[idx].stat |= TOR_STAT_VETO;
            if let Some(o) = opp_idx
                && let Some(opp) = self.slots.get_mut(o)
            {
                opp.stat |= TOR_STAT_VETO;
            }
        }
    }

    pub fn on_flow_terminate(&mut self, idx: usize, flow: &FlowRecord) -> TorRecord {
        let opp_entropy = flow
            .opposite
            .and_then(|o| self.slots.get(o))
            .map(|s| s.stat & TOR_STAT_ENTROPY != 0)
            .unwrap_or(false);

        let slot = match self.slots.get_mut(idx) {
            Some(s) => s,
            None => return TorRecord::default(),
        };

        let mut stat = slot.stat;
        // Tor-positive: the ClientHello profile held and nothing vetoed it.
        if stat & TOR_STAT_CLIHELLO != 0 && stat & TOR_STAT_VETO == 0 {
            stat |= TOR_STAT_TOR;
        }
        // Obfuscated Tor: both directions were gap-free and high-entropy.
        if stat & TOR_STAT_ENTROPY != 0 && opp_entropy {
            stat |= TOR_STAT_OBFUSC;
        }
        // Port-443 length heuristic.
        if slot.port443 && slot.min_len != u16::MAX {
            let min_m = slot.min_len % 8;
            let max_m = slot.max_len % 8;
            if min_m == 2 && (max_m == 6 || max_m == 7) {
                stat |= TOR_STAT_PKTL;
            }
        }

        slot.stat = stat;
        self.agg_stat |= stat;
        if stat & TOR_STAT_TOR != 0 {
            self.num_tor += 1;
        }
        if stat & TOR_STAT_OBFUSC != 0 {
            self.num_obfusc += 1;
        }
        TorRecord { stat, sni: std::mem::take(&mut self.slots[idx].sni) }
    }
}

/// Skip version, random and session id of a hello body; returns the offset
/// just past the session id.
fn hello_skip_prefix(body: &[u8]) -> Option<usize> {
    let version = read_u16(body, 0)?;
    if !(0x0300..=0x0304).contains(&version) {
        return None; // probably encrypted
    }
    let session_len = *body.get(2 + 32)? as usize;
    let p = 2 + 32 + 1 + session_len;
    if p > body.len() { None } else { Some(p) }
}

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    let b = data.get(off..off + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Normalized Shannon entropy (0..1) of a byte histogram.
fn entropy_per_byte(buckets: &[u16; 256], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total_f = total as f64;
    let mut h = 0.0;
    for &count in buckets.iter() {
        if count > 0 {
            let p = count as f64 / total_f;
            h -= p * p.log2();
        }
    }
    h / 8.0
}

impl Dissector for TorDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("torStat", ColumnType::H8, "Tor detection status")
            .push("torSNI", ColumnType::Str, "TLS server name indication");
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        if self.agg_stat != 0 {
            report.line(PLUGIN, &format!("Aggregated torStat=0x{:02x}", self.agg_stat))?;
        }
        if self.num_tor > 0 || self.num_obfusc > 0 {
            report.line(
                PLUGIN,
                &format!(
                    "Number of Tor, obfuscated Tor flows: {}, {}",
                    self.num_tor, self.num_obfusc
                ),
            )?;
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "torStat\ttorFlows".into(),
            MonitoringState::Value => format!("0x{:02x}\t{}", self.agg_stat, self.num_tor),
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "torStat", self.agg_stat as u64);
        crate::state::push_entry(out, "torFlows", self.num_tor);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "torStat") {
            self.agg_stat |= v as u8;
        }
        if let Some(v) = crate::state::lookup(blob, "torFlows") {
            self.num_tor = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tor_cert() -> Certificate {
        Certificate {
            subject_cn: "www.abcdefgh.net".into(),
            subject_org: String::new(),
            subject_country: String::new(),
            issuer_cn: "www.zyxwvuts.com".into(),
            issuer_org: String::new(),
            issuer_country: String::new(),
            not_before: 1_700_000_000 / 86_400 * 86_400,
            not_after: 1_700_000_000 / 86_400 * 86_400 + 90 * 86_400,
            pkey_type: PKeyType::Rsa,
            pkey_bits: 2048,
        }
    }

    #[test]
    fn tor_certificate_profile() {
        let cert = tor_cert();
        assert!(cert_is_tor(&cert, 500));
        // Too long.
        assert!(!cert_is_tor(&cert, 601));
        // Wrong key.
        let mut c = tor_cert();
        c.pkey_bits = 4096;
        assert!(!cert_is_tor(&c, 500));
        // Organization present.
        let mut c = tor_cert();
        c.subject_org = "ACME".into();
        assert!(!cert_is_tor(&c, 500));
        // Self-signed.
        let mut c = tor_cert();
        c.issuer_cn = c.subject_cn.clone();
        assert!(!cert_is_tor(&c, 500));
    }

    #[test]
    fn validity_rules() {
        // Not midnight-aligned but exactly 365 days is still Tor-like.
        let mut c = tor_cert();
        c.not_before += 3600;
        c.not_after = c.not_before + 365 * 86_400;
        assert!(cert_is_tor(&c, 500));
        // Neither midnight nor 365 days.
        c.not_after += 86_400;
        assert!(!cert_is_tor(&c, 500));
    }

    #[test]
    fn sni_pattern() {
        assert!(SNI_RE.is_match("www.aabbccdd.com"));
        assert!(!SNI_RE.is_match("www.aabbccdd.net"));
        assert!(!SNI_RE.is_match("www.ab.com")); // too short
        assert!(!SNI_RE.is_match("sub.www.aabbccdd.com"));
    }

    #[test]
    fn entropy_extremes() {
        let mut flat = [0u16; 256];
        for b in flat.iter_mut() {
            *b = 4;
        }
        assert!((entropy_per_byte(&flat, 1024) - 1.0).abs() < 1e-9);

        let mut constant = [0u16; 256];
        constant[0x41] = 1024;
        assert_eq!(entropy_per_byte(&constant, 1024), 0.0);
    }
}
