//! Column schemas for the binary flow file.
//!
//! Each dissector declares an ordered list of `(name, type, description)` at
//! init and must append exactly that schema's worth of values at flow
//! termination. The declared schemas are written as the flow file preamble
//! so readers can interpret the column store without the crate.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// Unsigned values rendered in hex by text back-ends; binary layout
    /// matches the same-width unsigned type.
    H8,
    H16,
    H32,
    F32,
    F64,
    Ip4,
    Ip6,
    Mac,
    Str,
    Time,
    /// Repeating group: a u32 count followed by that many tuples.
    Rep(Vec<ColumnType>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub desc: &'static str,
}

impl ColumnSpec {
    pub fn new(name: &'static str, ty: ColumnType, desc: &'static str) -> ColumnSpec {
        ColumnSpec { name, ty, desc }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    pub plugin: &'static str,
    pub columns: Vec<ColumnSpec>,
}

impl Schema {
    pub fn new(plugin: &'static str) -> Schema {
        Schema { plugin, columns: Vec::new() }
    }

    pub fn push(&mut self, name: &'static str, ty: ColumnType, desc: &'static str) -> &mut Self {
        self.columns.push(ColumnSpec::new(name, ty, desc));
        self
    }
}
