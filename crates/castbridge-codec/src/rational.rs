//! Rational timebases and integer timestamp rescaling.

/// A rational number, used as a stream timebase (seconds per tick).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// Millisecond timebase used by the video encoder path.
    pub const MILLIS: Rational = Rational::new(1, 1000);

    /// The MPEG-TS timebase.
    pub const MPEGTS: Rational = Rational::new(1, 90_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Timebase of `1/sample_rate`, used by audio encoders.
    pub fn per_sample(sample_rate: u32) -> Self {
        Self::new(1, sample_rate as i32)
    }

    /// Ticks converted to seconds.
    pub fn to_seconds(self, ticks: i64) -> f64 {
        ticks as f64 * self.num as f64 / self.den as f64
    }
}

/// Rescale a timestamp between timebases with round-to-nearest
/// (half away from zero) semantics: `q' = round(q · num₁·den₂ / (den₁·num₂))`.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let a = value as i128 * from.num as i128 * to.den as i128;
    let b = from.den as i128 * to.num as i128;
    let half = b.abs() / 2;
    let rounded = if a >= 0 { (a + half) / b } else { (a - half) / b };
    rounded as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(rescale(12345, tb, tb), 12345);
    }

    #[test]
    fn test_millis_to_mpegts() {
        assert_eq!(rescale(1000, Rational::MILLIS, Rational::MPEGTS), 90_000);
        assert_eq!(rescale(2002, Rational::MILLIS, Rational::MPEGTS), 180_180);
    }

    #[test]
    fn test_sample_rate_to_mpegts() {
        // 48000 samples = one second = 90000 ticks.
        let tb = Rational::per_sample(48_000);
        assert_eq!(rescale(48_000, tb, Rational::MPEGTS), 90_000);
        assert_eq!(rescale(1024, tb, Rational::MPEGTS), 1920);
    }

    #[test]
    fn test_rounding_half_away() {
        // 1 tick of 1/3 into 1/2: 1 * 2 / 3 = 0.666… -> 1
        assert_eq!(rescale(1, Rational::new(1, 3), Rational::new(1, 2)), 1);
        // 1 tick of 1/4 into 1/2: 0.5 -> 1 (away from zero)
        assert_eq!(rescale(1, Rational::new(1, 4), Rational::new(1, 2)), 1);
        assert_eq!(rescale(-1, Rational::new(1, 4), Rational::new(1, 2)), -1);
    }

    #[test]
    fn test_no_overflow_on_large_pts() {
        let pts = i64::MAX / 100_000;
        let out = rescale(pts, Rational::new(1, 1000), Rational::MPEGTS);
        assert_eq!(out, pts * 90);
    }

    #[test]
    fn test_to_seconds() {
        assert!((Rational::MPEGTS.to_seconds(180_000) - 2.0).abs() < 1e-9);
    }
}
