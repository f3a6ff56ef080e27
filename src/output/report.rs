//! Operator report stream: `[plugin] message` lines plus the periodic
//! monitoring rows.

use std::io::Write;

use crate::AnalyzerError;

/// Monitoring output phase requested from each dissector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringState {
    /// Emit the column header once.
    Header,
    /// Emit current values (callers usually want deltas since last tick).
    Value,
}

pub struct Report {
    w: Box<dyn Write>,
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Report").finish()
    }
}

impl Report {
    pub fn new(w: Box<dyn Write>) -> Report {
        Report { w }
    }

    pub fn line(&mut self, plugin: &str, msg: &str) -> Result<(), AnalyzerError> {
        writeln!(self.w, "[{plugin}] {msg}")
            .map_err(|e| AnalyzerError::Io { context: "report stream".into(), source: e })
    }

    pub fn raw(&mut self, msg: &str) -> Result<(), AnalyzerError> {
        writeln!(self.w, "{msg}")
            .map_err(|e| AnalyzerError::Io { context: "report stream".into(), source: e })
    }

    pub fn flush(&mut self) -> Result<(), AnalyzerError> {
        self.w
            .flush()
            .map_err(|e| AnalyzerError::Io { context: "report flush".into(), source: e })
    }
}

/// Percentage helper for report lines; 0 when the denominator is 0.
pub fn pct(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { 100.0 * num as f64 / den as f64 }
}
