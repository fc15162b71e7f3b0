use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Instant;

/// A signed span of space time, in microseconds.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct SpaceDuration {
    micros: i64,
}

impl SpaceDuration {
    pub const ZERO: SpaceDuration = SpaceDuration { micros: 0 };

    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    pub fn from_secs(secs: i64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    pub fn as_secs_f32(&self) -> f32 {
        self.micros as f32 / 1_000_000.0
    }

    pub fn saturating_mul(&self, factor: i64) -> Self {
        Self {
            micros: self.micros.saturating_mul(factor),
        }
    }
}

impl fmt::Display for SpaceDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.micros)
    }
}

/// A point on the space-global timebase: a monotonic microsecond tick since
/// the space epoch. Every server stamps kinematic state with these so that
/// extrapolation agrees across nodes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct SpaceInstant {
    micros: u64,
}

impl SpaceInstant {
    pub const EPOCH: SpaceInstant = SpaceInstant { micros: 0 };

    pub fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    pub fn as_micros(&self) -> u64 {
        self.micros
    }

    /// Duration since `earlier`, saturating to zero if `earlier` is actually
    /// later than `self`.
    pub fn saturating_since(&self, earlier: SpaceInstant) -> SpaceDuration {
        SpaceDuration {
            micros: self.micros.saturating_sub(earlier.micros) as i64,
        }
    }
}

impl Add<SpaceDuration> for SpaceInstant {
    type Output = SpaceInstant;

    fn add(self, rhs: SpaceDuration) -> SpaceInstant {
        SpaceInstant {
            micros: (self.micros as i64 + rhs.micros).max(0) as u64,
        }
    }
}

impl AddAssign<SpaceDuration> for SpaceInstant {
    fn add_assign(&mut self, rhs: SpaceDuration) {
        *self = *self + rhs;
    }
}

impl Sub<SpaceInstant> for SpaceInstant {
    type Output = SpaceDuration;

    fn sub(self, rhs: SpaceInstant) -> SpaceDuration {
        SpaceDuration {
            micros: self.micros as i64 - rhs.micros as i64,
        }
    }
}

impl fmt::Display for SpaceInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}us", self.micros)
    }
}

/// Maps the process-local monotonic clock into the space-global timebase.
/// One `TimeSource` is shared per server; components never read the wall
/// clock directly.
#[derive(Clone, Debug)]
pub struct TimeSource {
    anchor: Instant,
    base: SpaceInstant,
}

impl TimeSource {
    /// Anchor the space timebase at `base` as of right now.
    pub fn new(base: SpaceInstant) -> Self {
        Self {
            anchor: Instant::now(),
            base,
        }
    }

    pub fn now(&self) -> SpaceInstant {
        let elapsed = self.anchor.elapsed();
        self.base + SpaceDuration::from_micros(elapsed.as_micros() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic() {
        let t0 = SpaceInstant::from_millis(10);
        let t1 = t0 + SpaceDuration::from_millis(5);
        assert_eq!(t1, SpaceInstant::from_millis(15));
        assert_eq!(t1 - t0, SpaceDuration::from_millis(5));
        assert_eq!(t0 - t1, SpaceDuration::from_millis(-5));
    }

    #[test]
    fn saturating_since_clamps() {
        let t0 = SpaceInstant::from_millis(10);
        let t1 = SpaceInstant::from_millis(15);
        assert_eq!(t0.saturating_since(t1), SpaceDuration::ZERO);
        assert_eq!(t1.saturating_since(t0), SpaceDuration::from_millis(5));
    }

    #[test]
    fn negative_add_clamps_at_epoch() {
        let t0 = SpaceInstant::from_micros(3);
        assert_eq!(t0 + SpaceDuration::from_micros(-10), SpaceInstant::EPOCH);
    }

    #[test]
    fn time_source_is_monotonic() {
        let source = TimeSource::new(SpaceInstant::from_secs(100));
        let a = source.now();
        let b = source.now();
        assert!(b >= a);
        assert!(a >= SpaceInstant::from_secs(100));
    }
}
