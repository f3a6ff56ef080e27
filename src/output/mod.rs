//! Output back-ends: the binary flow file, the per-packet metadata stream,
//! the operator report and the side-channel file manager.

pub mod buffer;
pub mod files;
pub mod packet_file;
pub mod report;
pub mod schema;

pub use buffer::OutputBuffer;
pub use files::FileManager;
pub use packet_file::PacketFile;
pub use report::{MonitoringState, Report, pct};
pub use schema::{ColumnSpec, ColumnType, Schema};

use std::io::Write;

use crate::AnalyzerError;

/// Binary column-store flow file: a text preamble listing every declared
/// schema, then one length-prefixed record per terminated flow.
pub struct FlowWriter {
    w: Box<dyn Write>,
    preamble_written: bool,
    records: u64,
}

impl std::fmt::Debug for FlowWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWriter").field("records", &self.records).finish()
    }
}

impl FlowWriter {
    pub fn new(w: Box<dyn Write>) -> FlowWriter {
        FlowWriter { w, preamble_written: false, records: 0 }
    }

    pub fn write_preamble(&mut self, schemas: &[Schema]) -> Result<(), AnalyzerError> {
        if self.preamble_written {
            return Ok(());
        }
        for schema in schemas {
            for col in &schema.columns {
                writeln!(self.w, "# {}\t{}\t{:?}\t{}", schema.plugin, col.name, col.ty, col.desc)
                    .map_err(|e| AnalyzerError::Io {
                        context: "flow file preamble".into(),
                        source: e,
                    })?;
            }
        }
        writeln!(self.w, "# end-of-schema").map_err(|e| AnalyzerError::Io {
            context: "flow file preamble".into(),
            source: e,
        })?;
        self.preamble_written = true;
        Ok(())
    }

    /// One terminated flow: `u32` record length, then the concatenated
    /// dissector columns. Written in a single call so a record is never
    /// partially visible.
    pub fn write_record(&mut self, buf: &OutputBuffer) -> Result<(), AnalyzerError> {
        let mut rec = Vec::with_capacity(buf.len() + 4);
        rec.extend_from_slice(&(buf.len() as u32).to_le_bytes());
        rec.extend_from_slice(buf.as_bytes());
        self.w.write_all(&rec).map_err(|e| AnalyzerError::Io {
            context: "flow file record".into(),
            source: e,
        })?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> Result<(), AnalyzerError> {
        self.w
            .flush()
            .map_err(|e| AnalyzerError::Io { context: "flow file flush".into(), source: e })
    }
}
