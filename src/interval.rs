//! Frame interval normalization and vertical timing derivation.

use std::fmt;

use crate::traits::{Result, SensorError};

/// Time per frame as `numerator / denominator` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameInterval {
    /// Numerator (seconds).
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
}

impl FrameInterval {
    /// Interval of `numerator / denominator` seconds, as given.
    #[must_use]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// One frame every `1 / fps` seconds.
    #[must_use]
    pub const fn from_fps(fps: u32) -> Self {
        Self::new(1, fps)
    }

    /// Validate and reduce a caller-supplied interval.
    pub fn parse(numerator: u32, denominator: u32) -> Result<Self> {
        if numerator == 0 || denominator == 0 {
            return Err(SensorError::InvalidArgument(format!(
                "frame interval {numerator}/{denominator}"
            )));
        }
        Ok(Self::new(numerator, denominator).normalized())
    }

    /// True when neither part is zero.
    pub const fn is_valid(self) -> bool {
        self.numerator != 0 && self.denominator != 0
    }

    /// Reduce to lowest terms. Invalid intervals are returned unchanged.
    #[must_use]
    pub const fn normalized(self) -> Self {
        if !self.is_valid() {
            return self;
        }
        let div = gcd(self.numerator, self.denominator);
        Self::new(self.numerator / div, self.denominator / div)
    }

    /// Frame rate rounded to the nearest integer.
    pub const fn fps(self) -> u32 {
        if self.numerator == 0 {
            return 0;
        }
        (self.denominator + (self.numerator >> 1)) / self.numerator
    }

    /// True when `self` asks for more frames per second than `other`.
    pub fn is_faster_than(self, other: Self) -> bool {
        u64::from(self.denominator) * u64::from(other.numerator)
            > u64::from(other.denominator) * u64::from(self.numerator)
    }
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl From<v4l::Fraction> for FrameInterval {
    fn from(fraction: v4l::Fraction) -> Self {
        Self::new(fraction.numerator, fraction.denominator)
    }
}

impl From<FrameInterval> for v4l::Fraction {
    fn from(interval: FrameInterval) -> Self {
        Self::new(interval.numerator, interval.denominator)
    }
}

/// Greatest common divisor. `gcd(0, n) == n`.
pub const fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let rem = a % b;
        a = b;
        b = rem;
    }
    a
}

/// Frame length (VTS) that stretches `nominal_vts` from `nominal` to `requested`.
///
/// With unit numerators this is `nominal_vts * nominal_den / requested_den`.
pub fn proportional_vts(nominal_vts: u32, nominal: FrameInterval, requested: FrameInterval) -> u32 {
    let num = u64::from(nominal_vts)
        * u64::from(requested.numerator)
        * u64::from(nominal.denominator);
    let den = u64::from(requested.denominator) * u64::from(nominal.numerator);
    if den == 0 {
        return nominal_vts;
    }
    u32::try_from(num / den).unwrap_or(u32::MAX)
}
