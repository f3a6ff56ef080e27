//! Per-packet metadata stream: one tab-separated row per packet, column
//! header emitted at start.
//!
//! Column alignment relies on every contributing dissector printing its
//! columns for every packet, blank when not applicable, exactly in header
//! order.

use std::io::Write;

use crate::AnalyzerError;

pub struct PacketFile {
    w: Box<dyn Write>,
    row: Vec<String>,
    header_written: bool,
    header: Vec<&'static str>,
}

impl std::fmt::Debug for PacketFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFile")
            .field("columns", &self.header.len())
            .finish()
    }
}

impl PacketFile {
    pub fn new(w: Box<dyn Write>) -> PacketFile {
        PacketFile { w, row: Vec::new(), header_written: false, header: Vec::new() }
    }

    /// Declare columns during init; order fixes row layout.
    pub fn declare_columns(&mut self, cols: &[&'static str]) {
        self.header.extend_from_slice(cols);
    }

    pub fn push(&mut self, field: String) {
        self.row.push(field);
    }

    pub fn push_empty(&mut self, n: usize) {
        for _ in 0..n {
            self.row.push(String::new());
        }
    }

    pub fn end_row(&mut self) -> Result<(), AnalyzerError> {
        if !self.header_written {
            writeln!(self.w, "{}", self.header.join("\t"))
                .map_err(|e| AnalyzerError::Io { context: "packet file header".into(), source: e })?;
            self.header_written = true;
        }
        // Pad short rows so the column count always matches the header.
        while self.row.len() < self.header.len() {
            self.row.push(String::new());
        }
        writeln!(self.w, "{}", self.row.join("\t"))
            .map_err(|e| AnalyzerError::Io { context: "packet file row".into(), source: e })?;
        self.row.clear();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), AnalyzerError> {
        self.w
            .flush()
            .map_err(|e| AnalyzerError::Io { context: "packet file flush".into(), source: e })
    }
}
