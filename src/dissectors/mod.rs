//! Protocol dissectors. Each owns a per-flow slot arena indexed by flow
//! slot, zero-initialized on flow creation and serialized in schema order at
//! flow termination.

pub mod arp;
pub mod basic_stats;
pub mod centrality;
pub mod dhcp;
pub mod netflow_export;
pub mod ospf;
pub mod smb;
pub mod tcp_flags;
pub mod tor;
pub mod voip;

/// Bounded C-string scan shared by dissectors reading fixed-width text
/// fields: stops at the first NUL and never reads past the field.
pub(crate) fn bounded_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
