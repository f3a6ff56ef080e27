//! Printable save/restore of process-wide aggregates so a capture can be
//! resumed. Each dissector contributes `name=hex` lines; unknown names are
//! ignored on restore so state files stay forward-compatible.

/// Append one aggregate as a `name=hex` line.
pub fn push_entry(out: &mut String, name: &str, value: u64) {
    out.push_str(name);
    out.push('=');
    out.push_str(&format!("{value:x}"));
    out.push('\n');
}

/// Parse a saved state blob into `(name, value)` pairs, skipping anything
/// that does not parse.
pub fn entries(blob: &str) -> impl Iterator<Item = (&str, u64)> {
    blob.lines().filter_map(|line| {
        let (name, hex) = line.split_once('=')?;
        let value = u64::from_str_radix(hex.trim(), 16).ok()?;
        Some((name.trim(), value))
    })
}

/// Fetch one named aggregate from a saved blob.
pub fn lookup(blob: &str, name: &str) -> Option<u64> {
    entries(blob).find(|(n, _)| *n == name).map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut s = String::new();
        push_entry(&mut s, "arpStat", 0x83);
        push_entry(&mut s, "tcpFStat", 0xdead);
        assert_eq!(lookup(&s, "arpStat"), Some(0x83));
        assert_eq!(lookup(&s, "tcpFStat"), Some(0xdead));
        assert_eq!(lookup(&s, "missing"), None);
    }

    #[test]
    fn garbage_lines_are_ignored(){
        let blob = "ok=1\nnot a line\nbad=zz\n";
        let all: Vec<_> = entries(blob).collect();
        assert_eq!(all, vec![("ok", 1)]);
    }
}
