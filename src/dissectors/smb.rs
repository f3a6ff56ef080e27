//! SMB1/SMB2 parser with chunked file extraction and NTLMv2 hash capture.
//!
//! SMB messages span TCP segments and one segment may carry fragments of
//! several messages, so the parser is a resumable byte-stream state machine:
//! `HdrState` plus a scratch buffer records how much of the structure under
//! construction has arrived, and a sequence-number regression resets the
//! machine because a lost segment invalidates partial data. SMB3 is
//! recognized and counted but not parsed.

use std::path::PathBuf;

use serde::Serialize;

use crate::AnalyzerError;
use crate::config::AnalyzerConfig;
use crate::dispatcher::Dissector;
use crate::output::{ColumnType, FileManager, MonitoringState, OutputBuffer, Report, Schema};
use crate::packet::PacketRecord;

const PLUGIN: &str = "smbDecode";

pub const SMB_STAT_SMB: u32 = 0x0001; // ports matched, stream analyzed
pub const SMB_STAT_SMB1: u32 = 0x0002;
pub const SMB_STAT_SMB2: u32 = 0x0004;
pub const SMB_STAT_SMB3: u32 = 0x0008; // recognized, not parsed
pub const SMB_STAT_MALFORMED: u32 = 0x0010;
pub const SMB_STAT_AUTH: u32 = 0x0020; // NTLMSSP material extracted
pub const SMB_STAT_WFSMB1: u32 = 0x0040; // file written from SMB1
pub const SMB_STAT_WFSMB2: u32 = 0x0080; // file written from SMB2
pub const SMB_STAT_RFSMB2: u32 = 0x0100; // file read through SMB2
pub const SMB_STAT_NAMETRUNC: u32 = 0x0200; // file name truncated
pub const SMB_STAT_FNAMEL: u32 = 0x0400; // accessed-file list overflowed
pub const SMB_STAT_DIAL_OOB: u32 = 0x0800; // dialect index out of bounds
pub const SMB_STAT_SEQ_RESET: u32 = 0x1000; // reassembly reset on missing segment

const NB_SESSION_PORT: u16 = 139;
const SMB_DIRECT_PORT: u16 = 445;
const NB_HDR_LEN: usize = 4;
const SMB1_HDR_LEN: usize = 32;
const SMB2_HDR_LEN: usize = 64;
const SMB2_WRITE_LEN: usize = 48;
const SMB2_READ_RESP_LEN: usize = 16;
const SMB2_OP_N: usize = 19;
const FNAME_MAX: usize = 128;

const SMB1_MAGIC: [u8; 4] = [0xff, b'S', b'M', b'B'];
const SMB2_MAGIC: [u8; 4] = [0xfe, b'S', b'M', b'B'];
const SMB3_MAGIC: [u8; 4] = [0xfd, b'S', b'M', b'B'];

const SMB1_CMD_NEGOTIATE: u8 = 0x72;
const SMB1_CMD_SESSION_SETUP: u8 = 0x73;
const SMB1_CMD_WRITE_ANDX: u8 = 0x2f;

const SMB2_OP_NEGOTIATE: u16 = 0;
const SMB2_OP_SESSION_SETUP: u16 = 1;
const SMB2_OP_TREE_CONNECT: u16 = 3;
const SMB2_OP_CREATE: u16 = 5;
const SMB2_OP_READ: u16 = 8;
const SMB2_OP_WRITE: u16 = 9;

/// Windows FILETIME (100 ns ticks since 1601) to Unix seconds.
pub fn filetime_to_unix(t: u64) -> i64 {
    (t / 10_000_000) as i64 - 11_644_473_600
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
enum HdrState {
    #[default]
    None,
    /// Partial NetBIOS header.
    Nb,
    /// Magic read pending: version unknown.
    Smb,
    Smb1,
    Smb2,
    /// Partial SMB2 WRITE request structure.
    Write,
    /// Partial SMB2 READ response structure.
    Read,
    /// Write payload continues in following segments.
    Data,
    /// Read payload continues in following segments.
    RData,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    stat: u32,
    hdrstat: HdrState,
    hdroff: usize,
    scratch: Vec<u8>,
    tcp_seq: u32,
    seq_valid: bool,
    msg_id: u64,
    // write reconstruction
    left: u64,
    woff: u64,
    fid_name: String,
    // read reconstruction
    rname: String,
    roff: u64,
    rleft: u64,
    // metadata
    dialects1: Vec<String>,
    dialects2: Vec<u16>,
    session_flags: u16,
    sec_mode: u8,
    caps: u32,
    server_start_time: i64,
    max_trans: u32,
    max_read: u32,
    max_write: u32,
    guid: String,
    path: String,
    fname: String,
    fnames: Vec<String>,
    opcodes: u32,
    nopcode: [u16; SMB2_OP_N],
    // NTLMSSP
    user: String,
    domain: String,
    host: String,
    target: String,
    session_key: String,
    nt_proof: String,
    client_challenge: String,
    server_challenge: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SmbRecord {
    pub stat: u32,
    pub dialects1: Vec<String>,
    pub dialects2: Vec<u16>,
    pub session_flags: u16,
    pub sec_mode: u8,
    pub caps: u32,
    pub server_start_time: i64,
    pub max_trans: u32,
    pub max_read: u32,
    pub max_write: u32,
    pub guid: String,
    pub path: String,
    pub opcodes: u32,
    pub opcode_cnt: Vec<u16>,
    pub user: String,
    pub domain: String,
    pub host: String,
    pub target: String,
    pub session_key: String,
    pub nt_proof: String,
    pub server_challenge: String,
    pub fnames: Vec<String>,
}

impl SmbRecord {
    pub fn append(&self, buf: &mut OutputBuffer) {
        buf.append_u32(self.stat);
        buf.append_rep_count(self.dialects1.len() as u32);
        for d in &self.dialects1 {
            buf.append_str(d);
        }
        buf.append_rep_count(self.dialects2.len() as u32);
        for d in &self.dialects2 {
            buf.append_u16(*d);
        }
        buf.append_u16(self.session_flags);
        buf.append_u8(self.sec_mode);
        buf.append_u32(self.caps);
        buf.append_i64(self.server_start_time);
        buf.append_u32(self.max_trans);
        buf.append_u32(self.max_read);
        buf.append_u32(self.max_write);
        buf.append_str(&self.guid);
        buf.append_str(&self.path);
        buf.append_u32(self.opcodes);
        buf.append_rep_count(self.opcode_cnt.len() as u32);
        for c in &self.opcode_cnt {
            buf.append_u16(*c);
        }
        buf.append_str(&self.user);
        buf.append_str(&self.domain);
        buf.append_str(&self.host);
        buf.append_str(&self.target);
        buf.append_str(&self.session_key);
        buf.append_str(&self.nt_proof);
        buf.append_str(&self.server_challenge);
        buf.append_rep_count(self.fnames.len() as u32);
        for f in &self.fnames {
            buf.append_str(f);
        }
    }
}

#[derive(Debug)]
pub struct SmbDissector {
    slots: Vec<Slot>,
    num_fname: usize,
    save_dir: Option<PathBuf>,
    guid_map: Option<PathBuf>,
    auth_file: Option<PathBuf>,
    agg_stat: u32,
    num_smb: [u64; 3],
    num_auth: u64,
}

impl SmbDissector {
    pub fn new(cfg: &AnalyzerConfig) -> SmbDissector {
        SmbDissector {
            slots: vec![Slot::default(); cfg.max_flows],
            num_fname: cfg.smb_num_fname,
            save_dir: cfg.smb_save_dir.clone(),
            guid_map: cfg.guid_map_file.clone(),
            auth_file: cfg.auth_file.clone(),
            agg_stat: 0,
            num_smb: [0; 3],
            num_auth: 0,
        }
    }

    pub fn reset_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Slot::default();
        }
    }

    pub fn on_new_flow(&mut self, pkt: &PacketRecord<'_>, idx: usize) {
        let (sp, dp) = pkt.ports();
        if pkt.l4_proto() == Some(crate::protocol::L3_TCP)
            && (sp == NB_SESSION_PORT
                || dp == NB_SESSION_PORT
                || sp == SMB_DIRECT_PORT
                || dp == SMB_DIRECT_PORT)
            && let Some(slot) = self.slots.get_mut(idx)
        {
            slot.stat |= SMB_STAT_SMB;
        }
    }

    pub fn on_layer4(
        &mut self,
        pkt: &PacketRecord<'_>,
        idx: usize,
        opp_idx: Option<usize>,
        findex: u64,
        files: &mut FileManager,
    ) {
        if idx >= self.slots.len() || self.slots[idx].stat & SMB_STAT_SMB == 0 {
            return;
        }
        if pkt.status & crate::packet::PKT_FRAG_NOT_FIRST != 0 {
            return;
        }
        let Some(tcp) = pkt.tcp() else { return };
        let l7 = pkt.l7_bytes();

        {
            let slot = &mut self.slots[idx];
            // A gap in the byte stream invalidates any partial structure.
            if slot.seq_valid && slot.hdrstat != HdrState::None && tcp.seq > slot.tcp_seq {
                slot.hdrstat = HdrState::None;
                slot.hdroff = 0;
                slot.stat |= SMB_STAT_SEQ_RESET;
            }
            slot.tcp_seq = tcp.seq.wrapping_add(l7.len() as u32);
            slot.seq_valid = true;
        }
        if l7.is_empty() {
            return;
        }

        let mut pos = 0usize;
        // Each iteration consumes one resumable unit: a pending payload
        // chunk, a partial header completion, or one whole message.
        let mut guard = 0;
        while pos < l7.len() {
            guard += 1;
            if guard > 512 {
                self.slots[idx].stat |= SMB_STAT_MALFORMED;
                return;
            }
            let state = self.slots[idx].hdrstat;
            pos = match state {
                HdrState::Data => self.continue_write(idx, l7, pos, findex, files),
                HdrState::RData => self.continue_read(idx, l7, pos, findex, files),
                HdrState::Write => self.resume_struct(idx, l7, pos, SMB2_WRITE_LEN, HdrState::Write),
                HdrState::Read => self.resume_struct(idx, l7, pos, SMB2_READ_RESP_LEN, HdrState::Read),
                HdrState::Smb1 => self.resume_struct(idx, l7, pos, SMB1_HDR_LEN, HdrState::Smb1),
                HdrState::Smb2 => self.resume_struct(idx, l7, pos, SMB2_HDR_LEN, HdrState::Smb2),
                HdrState::Smb => self.resume_struct(idx, l7, pos, 4, HdrState::Smb),
                HdrState::Nb => self.resume_struct(idx, l7, pos, NB_HDR_LEN, HdrState::Nb),
                HdrState::None => self.start_message(idx, opp_idx, l7, pos, findex, files),
            };
            if pos == usize::MAX {
                return;
            }
        }
    }

    /// Copy bytes of a partially received structure into the scratch buffer;
    /// when complete, dispatch it. Returns the new position or MAX to stop.
    fn resume_struct(
        &mut self,
        idx: usize,
        l7: &[u8],
        pos: usize,
        want: usize,
        state: HdrState,
    ) -> usize {
        let (chunk, complete) = {
            let slot = &mut self.slots[idx];
            let need = want.saturating_sub(slot.hdroff);
            let take = need.min(l7.len() - pos);
            slot.scratch.extend_from_slice(&l7[pos..pos + take]);
            slot.hdroff += take;
            (take, slot.hdroff >= want)
        };
        if !complete {
            return usize::MAX; // wait for the next segment
        }
        let scratch = std::mem::take(&mut self.slots[idx].scratch);
        self.slots[idx].hdroff = 0;
        self.slots[idx].hdrstat = HdrState::None;
        match state {
            HdrState::Nb => {
                // NetBIOS header rebuilt; the SMB magic follows inline.
                self.slots[idx].hdrstat = HdrState::Smb;
                pos + chunk
            }
            HdrState::Smb => {
                match scratch.get(..4) {
                    Some(m) if m == SMB1_MAGIC => {
                        self.slots[idx].hdrstat = HdrState::Smb1;
                        self.slots[idx].scratch = scratch;
                        self.slots[idx].hdroff = 4;
                    }
                    Some(m) if m == SMB2_MAGIC => {
                        self.slots[idx].hdrstat = HdrState::Smb2;
                        self.slots[idx].scratch = scratch;
                        self.slots[idx].hdroff = 4;
                    }
                    Some(m) if m == SMB3_MAGIC => {
                        self.num_smb[2] += 1;
                        self.slots[idx].stat |= SMB_STAT_SMB3;
                    }
                    _ => {}
                }
                pos + chunk
            }
            HdrState::Smb1 => {
                // Header complete, but the command body was lost with the
                // segment boundary bookkeeping; skip to stream resync.
                self.smb1_header(idx, &scratch);
                pos + chunk
            }
            HdrState::Smb2 => {
                self.smb2_header(idx, &scratch);
                pos + chunk
            }
            HdrState::Write => {
                self.begin_write(idx, &scratch);
                self.slots[idx].hdrstat = HdrState::Data;
                pos + chunk
            }
            HdrState::Read => {
                let dlen = u32::from_le_bytes([scratch[4], scratch[5], scratch[6], scratch[7]]);
                self.slots[idx].rleft = dlen as u64;
                self.slots[idx].hdrstat = HdrState::RData;
                pos + chunk
            }
            _ => pos + chunk,
        }
    }

    /// Parse one complete NetBIOS-framed message starting at `pos`.
    fn start_message(
        &mut self,
        idx: usize,
        opp_idx: Option<usize>,
        l7: &[u8],
        pos: usize,
        findex: u64,
        files: &mut FileManager,
    ) -> usize {
        let avail = &l7[pos..];
        if avail.len() < NB_HDR_LEN {
            // NetBIOS session messages start with a zero type byte.
            if avail.first().is_some_and(|&b| b != 0) {
                return usize::MAX;
            }
            let slot = &mut self.slots[idx];
            slot.hdrstat = HdrState::Nb;
            slot.scratch = avail.to_vec();
            slot.hdroff = avail.len();
            return usize::MAX;
        }
        if avail[0] != 0 {
            return usize::MAX;
        }
        let nb_len = u32::from_be_bytes([0, avail[1], avail[2], avail[3]]) as usize;
        let msg_start = pos + NB_HDR_LEN;
        let msg_end = (msg_start + nb_len).min(l7.len());
        let msg = &l7[msg_start..msg_end];

        if msg.len() < 4 {
            let slot = &mut self.slots[idx];
            slot.hdrstat = HdrState::Smb;
            slot.scratch = msg.to_vec();
            slot.hdroff = msg.len();
            return usize::MAX;
        }

        if msg[..4] == SMB1_MAGIC {
            self.num_smb[0] += 1;
            if msg.len() < SMB1_HDR_LEN {
                let slot = &mut self.slots[idx];
                slot.hdrstat = HdrState::Smb1;
                slot.scratch = msg.to_vec();
                slot.hdroff = msg.len();
                return usize::MAX;
            }
            self.smb1_header(idx, &msg[..SMB1_HDR_LEN]);
            self.smb1_body(idx, msg, findex, files);
            msg_start + nb_len
        } else if msg[..4] == SMB2_MAGIC {
            self.num_smb[1] += 1;
            if msg.len() < SMB2_HDR_LEN {
                let slot = &mut self.slots[idx];
                slot.hdrstat = HdrState::Smb2;
                slot.scratch = msg.to_vec();
                slot.hdroff = msg.len();
                return usize::MAX;
            }
            self.smb2_message(idx, opp_idx, msg, findex, files);
            // The write path may have queued a Data continuation.
            if self.slots[idx].hdrstat == HdrState::Data
                || self.slots[idx].hdrstat == HdrState::RData
            {
                msg_start + nb_len.min(msg.len())
            } else {
                msg_start + nb_len
            }
        } else if msg[..4] == SMB3_MAGIC {
            self.num_smb[2] += 1;
            self.slots[idx].stat |= SMB_STAT_SMB3;
            msg_start + nb_len
        } else {
            usize::MAX
        }
    }

    fn smb1_header(&mut self, idx: usize, hdr: &[u8]) {
        if hdr.len() < SMB1_HDR_LEN {
            return;
        }
        self.slots[idx].stat |= SMB_STAT_SMB1;
        self.slots[idx].msg_id = u16::from_le_bytes([hdr[30], hdr[31]]) as u64;
    }

    /// SMB1 command bodies: NEGOTIATE dialects, SESSION_SETUP NTLMSSP,
    /// WRITE_ANDX carve.
    fn smb1_body(&mut self, idx: usize, msg: &[u8], findex: u64, files: &mut FileManager) {
        let cmd = msg[4];
        let body = &msg[SMB1_HDR_LEN..];
        match cmd {
            SMB1_CMD_NEGOTIATE => {
                // word count, then byte count, then 0x02-prefixed strings.
                if body.len() < 3 {
                    return;
                }
                let wct = body[0] as usize;
                let Some(rest) = body.get(1 + wct * 2 + 2..) else { return };
                let mut i = 0usize;
                while i < rest.len() && rest[i] == 0x02 {
                    let end = rest[i + 1..]
                        .iter()
                        .position(|&b| b == 0)
                        .map(|p| i + 1 + p)
                        .unwrap_or(rest.len());
                    let dialect = String::from_utf8_lossy(&rest[i + 1..end]).into_owned();
                    let slot = &mut self.slots[idx];
                    if !slot.dialects1.contains(&dialect) {
                        if slot.dialects1.len() < 8 {
                            slot.dialects1.push(dialect);
                        } else {
                            slot.stat |= SMB_STAT_DIAL_OOB;
                        }
                    }
                    i = end + 1;
                }
            }
            SMB1_CMD_SESSION_SETUP => self.ntlmssp(idx, body),
            SMB1_CMD_WRITE_ANDX => {
                // words: andx(4) fid(2) offset(4) reserved(4) writemode(2)
                // remaining(2) datalenhigh(2) datalen(2) dataoff(2) [offhigh]
                if body.len() < 1 + 24 {
                    return;
                }
                let w = &body[1..];
                let fid = u16::from_le_bytes([w[4], w[5]]);
                let off = u32::from_le_bytes([w[6], w[7], w[8], w[9]]) as u64;
                let dlen = u16::from_le_bytes([w[20], w[21]]) as u64;
                let doff = u16::from_le_bytes([w[22], w[23]]) as usize;
                self.slots[idx].stat |= SMB_STAT_WFSMB1;
                self.slots[idx].fid_name = format!("{fid:04x}");
                self.slots[idx].left = dlen;
                self.slots[idx].woff = off;
                if doff < msg.len() {
                    let data_pos = doff; // offset is from the SMB header
                    let chunk = &msg[data_pos.min(msg.len())..];
                    self.write_chunk(idx, chunk, findex, files);
                }
            }
            _ => {}
        }
    }

    fn smb2_header(&mut self, idx: usize, hdr: &[u8]) {
        if hdr.len() < SMB2_HDR_LEN {
            return;
        }
        self.slots[idx].stat |= SMB_STAT_SMB2;
        self.slots[idx].msg_id = u64::from_le_bytes([
            hdr[24], hdr[25], hdr[26], hdr[27], hdr[28], hdr[29], hdr[30], hdr[31],
        ]);
    }

    fn smb2_message(
        &mut self,
        idx: usize,
        opp_idx: Option<usize>,
        msg: &[u8],
        findex: u64,
        files: &mut FileManager,
    ) {
        let hdr = &msg[..SMB2_HDR_LEN];
        let hdr_len = u16::from_le_bytes([hdr[4], hdr[5]]);
        if hdr_len as usize != SMB2_HDR_LEN {
            self.slots[idx].stat |= SMB_STAT_MALFORMED;
            return;
        }
        self.smb2_header(idx, hdr);
        let is_request = u32::from_le_bytes([hdr[16], hdr[17], hdr[18], hdr[19]]) & 1 == 0;
        let opcode = u16::from_le_bytes([hdr[12], hdr[13]]);
        if opcode as usize >= SMB2_OP_N {
            self.slots[idx].stat |= SMB_STAT_MALFORMED;
            return;
        }
        {
            let slot = &mut self.slots[idx];
            slot.opcodes |= 1 << opcode;
            slot.nopcode[opcode as usize] = slot.nopcode[opcode as usize].saturating_add(1);
        }
        let body = &msg[SMB2_HDR_LEN..];

        match opcode {
            SMB2_OP_NEGOTIATE => {
                if !is_request && body.len() >= 64 {
                    let slot = &mut self.slots[idx];
                    slot.sec_mode = body[2];
                    slot.dialects2.push(u16::from_le_bytes([body[4], body[5]]));
                    slot.guid = format_guid(&body[8..24]);
                    slot.caps = u32::from_le_bytes([body[24], body[25], body[26], body[27]]);
                    slot.max_trans = u32::from_le_bytes([body[28], body[29], body[30], body[31]]);
                    slot.max_read = u32::from_le_bytes([body[32], body[33], body[34], body[35]]);
                    slot.max_write = u32::from_le_bytes([body[36], body[37], body[38], body[39]]);
                    let start = u64::from_le_bytes([
                        body[48], body[49], body[50], body[51], body[52], body[53], body[54],
                        body[55],
                    ]);
                    slot.server_start_time = filetime_to_unix(start);
                } else if is_request && body.len() >= 36 {
                    let cnt = u16::from_le_bytes([body[2], body[3]]) as usize;
                    for d in body[36..].chunks_exact(2).take(cnt.min(8)) {
                        self.slots[idx].dialects2.push(u16::from_le_bytes([d[0], d[1]]));
                    }
                }
            }
            SMB2_OP_SESSION_SETUP => {
                if body.len() >= 2 {
                    if !is_request {
                        self.slots[idx].session_flags = u16::from_le_bytes([body[2], body[3]]);
                    }
                    self.ntlmssp(idx, body);
                }
            }
            SMB2_OP_TREE_CONNECT => {
                if is_request && body.len() >= 8 {
                    let poff = u16::from_le_bytes([body[4], body[5]]) as usize;
                    let plen = u16::from_le_bytes([body[6], body[7]]) as usize;
                    let start = poff.saturating_sub(SMB2_HDR_LEN);
                    if let Some(raw) = body.get(start..start + plen) {
                        self.slots[idx].path = utf16le_to_string(raw, FNAME_MAX);
                    }
                }
            }
            SMB2_OP_CREATE => {
                if is_request {
                    if body.len() >= 48 {
                        let noff = u16::from_le_bytes([body[44], body[45]]) as usize;
                        let nlen = u16::from_le_bytes([body[46], body[47]]) as usize;
                        let start = noff.saturating_sub(SMB2_HDR_LEN);
                        if let Some(raw) = body.get(start..start + nlen) {
                            let name = utf16le_to_string(raw, FNAME_MAX);
                            if nlen / 2 > FNAME_MAX {
                                self.slots[idx].stat |= SMB_STAT_NAMETRUNC;
                            }
                            let num_fname = self.num_fname;
                            let slot = &mut self.slots[idx];
                            slot.fname = name.clone();
                            if !slot.fnames.contains(&name) {
                                if slot.fnames.len() < num_fname {
                                    slot.fnames.push(name);
                                } else {
                                    slot.stat |= SMB_STAT_FNAMEL;
                                }
                            }
                        }
                    }
                } else if body.len() >= 80 {
                    // CREATE response: bind the file id to the name the
                    // opposite flow asked for.
                    let fid = format_guid(&body[64..80]);
                    let opp_name = opp_idx
                        .and_then(|o| self.slots.get(o))
                        .map(|s| s.fname.clone())
                        .unwrap_or_default();
                    if !opp_name.is_empty()
                        && let Some(map) = self.guid_map.clone()
                    {
                        let _ = files.append_line(
                            &map,
                            &format!("File_Id_{fid}_{findex}\t{opp_name}"),
                        );
                    }
                }
            }
            SMB2_OP_WRITE => {
                if is_request {
                    self.slots[idx].stat |= SMB_STAT_WFSMB2;
                    if body.len() < SMB2_WRITE_LEN {
                        let slot = &mut self.slots[idx];
                        slot.hdrstat = HdrState::Write;
                        slot.scratch = body.to_vec();
                        slot.hdroff = body.len();
                        return;
                    }
                    let dataoff = u16::from_le_bytes([body[2], body[3]]) as usize;
                    self.begin_write(idx, &body[..SMB2_WRITE_LEN]);
                    let start = dataoff.saturating_sub(SMB2_HDR_LEN);
                    if let Some(data) = body.get(start..) {
                        self.write_chunk(idx, data, findex, files);
                    } else {
                        self.slots[idx].hdrstat = HdrState::Data;
                    }
                }
            }
            SMB2_OP_READ => {
                if is_request {
                    if body.len() >= 32 {
                        let slot = &mut self.slots[idx];
                        slot.roff = u64::from_le_bytes([
                            body[8], body[9], body[10], body[11], body[12], body[13], body[14],
                            body[15],
                        ]);
                        slot.rname = format_guid(&body[16..32]);
                    }
                } else {
                    // READ response: file id and offset come from the
                    // opposite flow's request, matched by message id.
                    if body.len() < SMB2_READ_RESP_LEN {
                        let slot = &mut self.slots[idx];
                        slot.hdrstat = HdrState::Read;
                        slot.scratch = body.to_vec();
                        slot.hdroff = body.len();
                        return;
                    }
                    let dataoff = body[2] as usize;
                    let dlen =
                        u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as u64;
                    if dlen == 0 {
                        return;
                    }
                    let Some(o) = opp_idx else { return };
                    let (slot, opp) =
                        crate::dispatcher::pair_mut(&mut self.slots, idx, Some(o));
                    let Some(opp) = opp else { return };
                    if opp.msg_id != slot.msg_id || opp.rname.is_empty() {
                        return;
                    }
                    slot.stat |= SMB_STAT_RFSMB2;
                    slot.rname = opp.rname.clone();
                    slot.roff = opp.roff;
                    slot.rleft = dlen;
                    let start = dataoff.saturating_sub(SMB2_HDR_LEN);
                    if let Some(data) = body.get(start..) {
                        self.read_chunk(idx, data, findex, files);
                    } else {
                        self.slots[idx].hdrstat = HdrState::RData;
                    }
                }
            }
            _ => {}
        }
    }

    fn begin_write(&mut self, idx: usize, w: &[u8]) {
        if w.len() < SMB2_WRITE_LEN {
            return;
        }
        let dlen = u32::from_le_bytes([w[4], w[5], w[6], w[7]]) as u64;
        let off = u64::from_le_bytes([w[8], w[9], w[10], w[11], w[12], w[13], w[14], w[15]]);
        let slot = &mut self.slots[idx];
        slot.left = dlen;
        slot.woff = off;
        slot.fid_name = format_guid(&w[16..32]);
    }

    /// Write as much of the pending payload as this segment carries.
    fn write_chunk(&mut self, idx: usize, data: &[u8], findex: u64, files: &mut FileManager) {
        let (name, off, take) = {
            let slot = &mut self.slots[idx];
            let take = (slot.left as usize).min(data.len());
            (slot.fid_name.clone(), slot.woff, take)
        };
        if take > 0
            && let Some(dir) = self.save_dir.clone()
        {
            let path = dir.join(format!("File_Id_{name}_{findex}"));
            let _ = files.write_at(&path, off, &data[..take]);
        }
        let slot = &mut self.slots[idx];
        slot.woff += take as u64;
        slot.left -= take as u64;
        slot.hdrstat = if slot.left > 0 { HdrState::Data } else { HdrState::None };
    }

    fn continue_write(
        &mut self,
        idx: usize,
        l7: &[u8],
        pos: usize,
        findex: u64,
        files: &mut FileManager,
    ) -> usize {
        let before = self.slots[idx].left as usize;
        self.write_chunk(idx, &l7[pos..], findex, files);
        pos + before.min(l7.len() - pos)
    }

    fn read_chunk(&mut self, idx: usize, data: &[u8], findex: u64, files: &mut FileManager) {
        let (name, off, take) = {
            let slot = &mut self.slots[idx];
            let take = (slot.rleft as usize).min(data.len());
            (slot.rname.clone(), slot.roff, take)
        };
        if take > 0
            && !name.is_empty()
            && let Some(dir) = self.save_dir.clone()
        {
            let path = dir.join(format!("File_Id_{name}_{findex}_r"));
            let _ = files.write_at(&path, off, &data[..take]);
        }
        let slot = &mut self.slots[idx];
        slot.roff += take as u64;
        slot.rleft -= take as u64;
        slot.hdrstat = if slot.rleft > 0 { HdrState::RData } else { HdrState::None };
    }

    fn continue_read(
        &mut self,
        idx: usize,
        l7: &[u8],
        pos: usize,
        findex: u64,
        files: &mut FileManager,
    ) -> usize {
        let before = self.slots[idx].rleft as usize;
        self.read_chunk(idx, &l7[pos..], findex, files);
        pos + before.min(l7.len() - pos)
    }

    /// Locate and decode an NTLMSSP blob inside a security buffer.
    fn ntlmssp(&mut self, idx: usize, body: &[u8]) {
        const MAGIC: &[u8] = b"NTLMSSP\0";
        let Some(start) = body.windows(MAGIC.len()).position(|w| w == MAGIC) else {
            return;
        };
        let blob = &body[start..];
        if blob.len() < 12 {
            return;
        }
        let msg_type = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]);
        match msg_type {
            // CHALLENGE: the 8-byte server nonce.
            2 => {
                if let Some(nonce) = blob.get(24..32) {
                    self.slots[idx].server_challenge = hex_string(nonce);
                    self.slots[idx].stat |= SMB_STAT_AUTH;
                }
                if let Some(raw) = sec_buf(blob, 12) {
                    self.slots[idx].target = utf16le_to_string(raw, 64);
                }
            }
            // AUTH: NT response carries the proof and client challenge.
            3 => {
                if let Some(nt) = sec_buf(blob, 20)
                    && nt.len() >= 16
                {
                    self.slots[idx].nt_proof = hex_string(&nt[..16]);
                    self.slots[idx].client_challenge = hex_string(&nt[16..]);
                }
                if let Some(raw) = sec_buf(blob, 28) {
                    self.slots[idx].domain = utf16le_to_string(raw, 64);
                }
                if let Some(raw) = sec_buf(blob, 36) {
                    self.slots[idx].user = utf16le_to_string(raw, 64);
                }
                if let Some(raw) = sec_buf(blob, 44) {
                    self.slots[idx].host = utf16le_to_string(raw, 64);
                }
                if let Some(raw) = sec_buf(blob, 52) {
                    self.slots[idx].session_key = hex_string(raw);
                }
                if !self.slots[idx].nt_proof.is_empty() {
                    self.slots[idx].stat |= SMB_STAT_AUTH;
                }
            }
            _ => {}
        }
    }

    /// Emit the NTLMv2 crack line when a flow pair yielded the whole tuple.
    pub fn on_flow_terminate(
        &mut self,
        idx: usize,
        opp_idx: Option<usize>,
        files: &mut FileManager,
    ) -> SmbRecord {
        if let (Some(o), Some(auth)) = (opp_idx, self.auth_file.clone()) {
            let server_challenge = self
                .slots
                .get(o)
                .map(|s| s.server_challenge.clone())
                .unwrap_or_default();
            let slot = &self.slots[idx];
            if !slot.user.is_empty()
                && !slot.domain.is_empty()
                && !server_challenge.is_empty()
                && !slot.nt_proof.is_empty()
                && !slot.client_challenge.is_empty()
            {
                let line = format!(
                    "{}::{}:{}:{}:{}",
                    slot.user, slot.domain, server_challenge, slot.nt_proof, slot.client_challenge
                );
                let _ = files.append_line(&auth, &line);
                self.num_auth += 1;
            }
        }

        let slot = self.slots.get(idx).cloned().unwrap_or_default();
        self.agg_stat |= slot.stat;
        SmbRecord {
            stat: slot.stat,
            dialects1: slot.dialects1,
            dialects2: slot.dialects2,
            session_flags: slot.session_flags,
            sec_mode: slot.sec_mode,
            caps: slot.caps,
            server_start_time: slot.server_start_time,
            max_trans: slot.max_trans,
            max_read: slot.max_read,
            max_write: slot.max_write,
            guid: slot.guid,
            path: slot.path,
            opcodes: slot.opcodes,
            opcode_cnt: slot.nopcode.to_vec(),
            user: slot.user,
            domain: slot.domain,
            host: slot.host,
            target: slot.target,
            session_key: slot.session_key,
            nt_proof: slot.nt_proof,
            server_challenge: slot.server_challenge,
            fnames: slot.fnames,
        }
    }
}

fn format_guid(raw: &[u8]) -> String {
    if raw.len() < 16 {
        return String::new();
    }
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        u16::from_le_bytes([raw[4], raw[5]]),
        u16::from_le_bytes([raw[6], raw[7]]),
        raw[8],
        raw[9],
        raw[10],
        raw[11],
        raw[12],
        raw[13],
        raw[14],
        raw[15],
    )
}

fn hex_string(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// Security-buffer descriptor: length, max length, offset from blob start.
fn sec_buf<'a>(blob: &'a [u8], desc_off: usize) -> Option<&'a [u8]> {
    let len = u16::from_le_bytes([*blob.get(desc_off)?, *blob.get(desc_off + 1)?]) as usize;
    let off =
        u32::from_le_bytes([*blob.get(desc_off + 4)?, *blob.get(desc_off + 5)?, *blob.get(desc_off + 6)?, *blob.get(desc_off + 7)?]) as usize;
    if len == 0 {
        return None;
    }
    blob.get(off..off + len)
}

fn utf16le_to_string(raw: &[u8], max_chars: usize) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .take(max_chars)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

impl Dissector for SmbDissector {
    fn name(&self) -> &'static str {
        PLUGIN
    }

    fn schema(&self) -> Schema {
        let mut s = Schema::new(PLUGIN);
        s.push("smbStat", ColumnType::H32, "SMB status")
            .push("smbDialects", ColumnType::Rep(vec![ColumnType::Str]), "SMB1 dialects")
            .push("smbDialects2", ColumnType::Rep(vec![ColumnType::U16]), "SMB2 dialect revisions")
            .push("smbSessFlags", ColumnType::H16, "SMB2 session flags")
            .push("smbSecMode", ColumnType::H8, "SMB2 security mode")
            .push("smbCaps", ColumnType::H32, "SMB2 capabilities")
            .push("smbSrvStartTime", ColumnType::I64, "SMB server start time, Unix seconds")
            .push("smbMaxSizeT", ColumnType::U32, "SMB max transaction size")
            .push("smbMaxSizeR", ColumnType::U32, "SMB max read size")
            .push("smbMaxSizeW", ColumnType::U32, "SMB max write size")
            .push("smbGUID", ColumnType::Str, "SMB server GUID")
            .push("smbPath", ColumnType::Str, "SMB share path")
            .push("smbOpcodes", ColumnType::H32, "SMB2 opcode bitfield")
            .push("smbOpcodeCnt", ColumnType::Rep(vec![ColumnType::U16]), "SMB2 opcode counters")
            .push("smbUser", ColumnType::Str, "NTLMSSP user name")
            .push("smbDomain", ColumnType::Str, "NTLMSSP domain")
            .push("smbHost", ColumnType::Str, "NTLMSSP host name")
            .push("smbTarget", ColumnType::Str, "NTLMSSP target name")
            .push("smbSessionKey", ColumnType::Str, "NTLMSSP session key")
            .push("smbNTProof", ColumnType::Str, "NTLMv2 proof string")
            .push("smbServChallenge", ColumnType::Str, "NTLM server challenge")
            .push("smbFiles", ColumnType::Rep(vec![ColumnType::Str]), "SMB accessed files");
        s
    }

    fn report(&self, report: &mut Report) -> Result<(), AnalyzerError> {
        if self.agg_stat != 0 {
            report.line(PLUGIN, &format!("Aggregated smbStat=0x{:08x}", self.agg_stat))?;
        }
        if self.num_smb.iter().any(|&n| n > 0) {
            report.line(
                PLUGIN,
                &format!(
                    "Number of SMB1, SMB2, SMB3 messages: {}, {}, {}",
                    self.num_smb[0], self.num_smb[1], self.num_smb[2]
                ),
            )?;
        }
        if self.num_auth > 0 {
            report.line(PLUGIN, &format!("NTLMv2 authentications extracted: {}", self.num_auth))?;
        }
        Ok(())
    }

    fn monitoring(&mut self, state: MonitoringState) -> String {
        match state {
            MonitoringState::Header => "smbStat\tsmb1Msgs\tsmb2Msgs".into(),
            MonitoringState::Value => {
                format!("0x{:08x}\t{}\t{}", self.agg_stat, self.num_smb[0], self.num_smb[1])
            }
        }
    }

    fn save_state(&self, out: &mut String) {
        crate::state::push_entry(out, "smbStat", self.agg_stat as u64);
        crate::state::push_entry(out, "smb1Msgs", self.num_smb[0]);
        crate::state::push_entry(out, "smb2Msgs", self.num_smb[1]);
        crate::state::push_entry(out, "smb3Msgs", self.num_smb[2]);
    }

    fn restore_state(&mut self, blob: &str) {
        if let Some(v) = crate::state::lookup(blob, "smbStat") {
            self.agg_stat |= v as u32;
        }
        if let Some(v) = crate::state::lookup(blob, "smb1Msgs") {
            self.num_smb[0] = v;
        }
        if let Some(v) = crate::state::lookup(blob, "smb2Msgs") {
            self.num_smb[1] = v;
        }
        if let Some(v) = crate::state::lookup(blob, "smb3Msgs") {
            self.num_smb[2] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filetime_epoch_conversion() {
        // 2021-01-01 00:00:00 UTC as FILETIME.
        assert_eq!(filetime_to_unix(132_537_600_000_000_000), 1_609_459_200);
        // The Windows epoch itself.
        assert_eq!(filetime_to_unix(0), -11_644_473_600);
    }

    #[test]
    fn guid_formatting() {
        let raw: Vec<u8> = (0u8..16).collect();
        assert_eq!(format_guid(&raw), "03020100-0504-0706-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn utf16_decoding_is_bounded() {
        let raw = [b'a', 0, b'b', 0, b'c', 0];
        assert_eq!(utf16le_to_string(&raw, 64), "abc");
        assert_eq!(utf16le_to_string(&raw, 2), "ab");
    }
}
