//! Append-only serialization buffer for one flow record.
//!
//! Fixed-width fields are little-endian; strings are bytes plus a NUL;
//! repeating groups lead with a u32 count; timestamps are
//! `(u64 seconds, u32 microseconds)`; addresses are raw network bytes.

use crate::time::Timeval;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> OutputBuffer {
        OutputBuffer::default()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn append_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn append_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn append_ip4(&mut self, v: [u8; 4]) {
        self.buf.extend_from_slice(&v);
    }

    pub fn append_ip6(&mut self, v: [u8; 16]) {
        self.buf.extend_from_slice(&v);
    }

    pub fn append_mac(&mut self, v: [u8; 6]) {
        self.buf.extend_from_slice(&v);
    }

    pub fn append_str(&mut self, v: &str) {
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
    }

    pub fn append_time(&mut self, t: Timeval) {
        self.append_u64(t.sec);
        self.append_u32(t.usec);
    }

    /// Count prefix for a repeating group.
    pub fn append_rep_count(&mut self, n: u32) {
        self.append_u32(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let mut b = OutputBuffer::new();
        b.append_u16(0x1234);
        b.append_str("ab");
        b.append_time(Timeval::new(2, 3));
        assert_eq!(
            b.as_bytes(),
            &[
                0x34, 0x12, // u16 LE
                b'a', b'b', 0, // NUL-terminated string
                2, 0, 0, 0, 0, 0, 0, 0, // seconds
                3, 0, 0, 0, // microseconds
            ]
        );
    }
}
