use serde::Serialize;

/// Packet timestamp as seconds and microseconds since the Unix epoch.
///
/// This is the capture clock, not wall time: flow aging and every
/// inter-arrival computation run off these values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Timeval {
    pub sec: u64,
    pub usec: u32,
}

pub(crate) const MICROS_PER_SEC: f64 = 1_000_000.0;

impl Timeval {
    pub const ZERO: Timeval = Timeval { sec: 0, usec: 0 };

    pub fn new(sec: u64, usec: u32) -> Self {
        Timeval {
            sec: sec + (usec / 1_000_000) as u64,
            usec: usec % 1_000_000,
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        let clamped = secs.max(0.0);
        let sec = clamped.trunc() as u64;
        let usec = ((clamped - sec as f64) * MICROS_PER_SEC).round() as u32;
        Timeval::new(sec, usec)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.usec as f64 / MICROS_PER_SEC
    }

    /// Signed difference `self - earlier` in seconds. Negative when the
    /// capture clock jumped backwards.
    pub fn diff_secs(&self, earlier: Timeval) -> f64 {
        (self.sec as f64 - earlier.sec as f64)
            + (self.usec as f64 - earlier.usec as f64) / MICROS_PER_SEC
    }

    /// `self - dur` seconds, clamped at the epoch. Used for boot-time
    /// back-projection from TCP timestamp options.
    pub fn sub_secs_f64(&self, dur: f64) -> Timeval {
        Timeval::from_secs_f64(self.as_secs_f64() - dur)
    }

    pub fn saturating_sub(&self, other: Timeval) -> Timeval {
        let d = self.diff_secs(other);
        if d <= 0.0 { Timeval::ZERO } else { Timeval::from_secs_f64(d) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_overflowing_micros() {
        let t = Timeval::new(10, 2_500_000);
        assert_eq!(t, Timeval { sec: 12, usec: 500_000 });
    }

    #[test]
    fn diff_is_signed() {
        let a = Timeval::new(10, 200_000);
        let b = Timeval::new(11, 100_000);
        assert!((b.diff_secs(a) - 0.9).abs() < 1e-9);
        assert!((a.diff_secs(b) + 0.9).abs() < 1e-9);
    }

    #[test]
    fn duration_saturates_at_epoch() {
        let a = Timeval::new(1, 0);
        let b = Timeval::new(2, 0);
        assert_eq!(a.saturating_sub(b), Timeval::ZERO);
        assert_eq!(b.saturating_sub(a), Timeval::new(1, 0));
    }
}
