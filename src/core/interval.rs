// This module implements the static value analysis used throughout the IR: closed integer
// intervals over i64 with overflow detection, extended by an affine congruence class
// (modulus/remainder) into SteppedInterval. Interval arithmetic never wraps; whenever an
// endpoint computation overflows the result collapses to the unbounded interval. Congruences
// are merged with gcd rules (sum and difference keep the gcd of the moduli, scaling by a
// constant multiplies the modulus) and degrade to the trivial class (modulus 1) when a
// product would overflow. A modulus of zero marks an exactly known value. The planner uses
// the result for alignment proofs of vector loads and for may-alias distances between loads
// and stores; the IR factory uses it to split unaligned vector loads.

//! Interval and congruence analysis.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// Closed interval `[min, max]` over 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub min: i64,
    pub max: i64,
}

impl Interval {
    /// The interval that says nothing.
    pub const UNBOUNDED: Interval = Interval {
        min: i64::MIN,
        max: i64::MAX,
    };

    /// Range of a sign-extended 32-bit value.
    pub const I32: Interval = Interval {
        min: i32::MIN as i64,
        max: i32::MAX as i64,
    };

    pub fn new(min: i64, max: i64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn point(value: i64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    /// True when either endpoint carries the sentinel.
    pub fn is_unbounded(&self) -> bool {
        self.min == i64::MIN || self.max == i64::MAX
    }

    pub fn is_point(&self) -> bool {
        self.min == self.max && !self.is_unbounded()
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }

    /// Number of values in the interval, if it fits an i64.
    pub fn len(&self) -> Option<i64> {
        self.max.checked_sub(self.min)?.checked_add(1)
    }

    /// Smallest interval containing both.
    pub fn hull(self, other: Interval) -> Interval {
        Interval {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    fn from_checked(min: Option<i64>, max: Option<i64>) -> Interval {
        match (min, max) {
            (Some(min), Some(max)) if min != i64::MIN && max != i64::MAX => Interval { min, max },
            _ => Interval::UNBOUNDED,
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::UNBOUNDED
    }
}

impl Add for Interval {
    type Output = Interval;

    fn add(self, rhs: Interval) -> Interval {
        if self.is_unbounded() || rhs.is_unbounded() {
            return Interval::UNBOUNDED;
        }
        Interval::from_checked(self.min.checked_add(rhs.min), self.max.checked_add(rhs.max))
    }
}

impl Sub for Interval {
    type Output = Interval;

    fn sub(self, rhs: Interval) -> Interval {
        if self.is_unbounded() || rhs.is_unbounded() {
            return Interval::UNBOUNDED;
        }
        Interval::from_checked(self.min.checked_sub(rhs.max), self.max.checked_sub(rhs.min))
    }
}

impl Mul for Interval {
    type Output = Interval;

    fn mul(self, rhs: Interval) -> Interval {
        if self.is_unbounded() || rhs.is_unbounded() {
            return Interval::UNBOUNDED;
        }
        let corners = [
            self.min.checked_mul(rhs.min),
            self.min.checked_mul(rhs.max),
            self.max.checked_mul(rhs.min),
            self.max.checked_mul(rhs.max),
        ];
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for corner in corners {
            match corner {
                Some(v) => {
                    min = min.min(v);
                    max = max.max(v);
                }
                None => return Interval::UNBOUNDED,
            }
        }
        Interval::from_checked(Some(min), Some(max))
    }
}

impl Neg for Interval {
    type Output = Interval;

    fn neg(self) -> Interval {
        Interval::point(0) - self
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[unbounded]")
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    // gcd(i64::MIN, 0) does not fit; 1 is always a sound modulus
    i64::try_from(a).unwrap_or(1)
}

/// An interval together with the congruence class `value ≡ remainder (mod modulus)`.
///
/// `modulus == 0` means the value is exactly `remainder`; `modulus == 1` means
/// nothing is known about divisibility. The remainder is kept normalized to
/// `0..modulus` for positive moduli.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SteppedInterval {
    pub interval: Interval,
    pub modulus: i64,
    pub remainder: i64,
}

impl SteppedInterval {
    pub const UNKNOWN: SteppedInterval = SteppedInterval {
        interval: Interval::UNBOUNDED,
        modulus: 1,
        remainder: 0,
    };

    /// Exactly `value`.
    pub fn constant(value: i64) -> Self {
        Self {
            interval: Interval::point(value),
            modulus: 0,
            remainder: value,
        }
    }

    /// Somewhere in `interval`, divisibility unknown.
    pub fn range(interval: Interval) -> Self {
        Self {
            interval,
            modulus: 1,
            remainder: 0,
        }
    }

    pub fn with_congruence(interval: Interval, modulus: i64, remainder: i64) -> Self {
        Self::normalized(interval, Some(modulus), Some(remainder))
    }

    fn normalized(interval: Interval, modulus: Option<i64>, remainder: Option<i64>) -> Self {
        match (modulus, remainder) {
            (Some(0), Some(r)) => Self {
                interval,
                modulus: 0,
                remainder: r,
            },
            (Some(m), Some(r)) if m != i64::MIN => {
                let m = m.abs();
                Self {
                    interval,
                    modulus: m,
                    remainder: r.rem_euclid(m),
                }
            }
            _ => Self::range(interval),
        }
    }

    pub fn is_constant(&self) -> bool {
        self.modulus == 0
    }

    /// The value's residue modulo `align` when it is statically known.
    pub fn residue(&self, align: i64) -> Option<i64> {
        if self.modulus == 0 {
            Some(self.remainder.rem_euclid(align))
        } else if self.modulus % align == 0 {
            Some(self.remainder.rem_euclid(align))
        } else {
            None
        }
    }

    /// True when the value is provably a multiple of `align`.
    pub fn is_aligned(&self, align: i64) -> bool {
        self.residue(align) == Some(0)
    }

    /// Shift by a constant.
    pub fn offset(self, delta: i64) -> Self {
        self + SteppedInterval::constant(delta)
    }

    /// Multiply by a constant.
    pub fn scale(self, factor: i64) -> Self {
        if factor == 0 {
            return SteppedInterval::constant(0);
        }
        let interval = self.interval * Interval::point(factor);
        Self::normalized(
            interval,
            self.modulus.checked_mul(factor),
            self.remainder.checked_mul(factor),
        )
    }

    pub fn hull(self, other: SteppedInterval) -> Self {
        let interval = self.interval.hull(other.interval);
        let diff = self.remainder.checked_sub(other.remainder);
        let modulus = diff.map(|d| gcd(gcd(self.modulus, other.modulus), d));
        Self::normalized(interval, modulus, Some(self.remainder))
    }
}

impl Default for SteppedInterval {
    fn default() -> Self {
        SteppedInterval::UNKNOWN
    }
}

impl Add for SteppedInterval {
    type Output = SteppedInterval;

    fn add(self, rhs: SteppedInterval) -> SteppedInterval {
        Self::normalized(
            self.interval + rhs.interval,
            Some(gcd(self.modulus, rhs.modulus)),
            self.remainder.checked_add(rhs.remainder),
        )
    }
}

impl Sub for SteppedInterval {
    type Output = SteppedInterval;

    fn sub(self, rhs: SteppedInterval) -> SteppedInterval {
        Self::normalized(
            self.interval - rhs.interval,
            Some(gcd(self.modulus, rhs.modulus)),
            self.remainder.checked_sub(rhs.remainder),
        )
    }
}

impl Mul for SteppedInterval {
    type Output = SteppedInterval;

    fn mul(self, rhs: SteppedInterval) -> SteppedInterval {
        if rhs.is_constant() {
            return self.scale(rhs.remainder);
        }
        if self.is_constant() {
            return rhs.scale(self.remainder);
        }
        // (m1*a + r1)(m2*b + r2) = m1*m2*ab + m1*r2*a + m2*r1*b + r1*r2
        let interval = self.interval * rhs.interval;
        let parts = (
            self.modulus.checked_mul(rhs.modulus),
            self.modulus.checked_mul(rhs.remainder),
            rhs.modulus.checked_mul(self.remainder),
        );
        let modulus = match parts {
            (Some(a), Some(b), Some(c)) => Some(gcd(gcd(a, b), c)),
            _ => None,
        };
        Self::normalized(interval, modulus, self.remainder.checked_mul(rhs.remainder))
    }
}

impl fmt::Display for SteppedInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modulus == 0 {
            write!(f, "={}", self.remainder)
        } else {
            write!(f, "{} {}(mod {})", self.interval, self.remainder, self.modulus)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [Interval; 5] = [
        Interval { min: -3, max: 7 },
        Interval { min: 0, max: 0 },
        Interval { min: 2, max: 9 },
        Interval { min: -100, max: -50 },
        Interval { min: -1, max: 1 },
    ];

    #[test]
    fn test_interval_soundness() {
        for a in SAMPLES {
            for b in SAMPLES {
                let sum = a + b;
                let diff = a - b;
                let prod = a * b;
                for x in a.min..=a.max {
                    for y in b.min..=b.max {
                        assert!(sum.contains(x + y), "{a} + {b} misses {}", x + y);
                        assert!(diff.contains(x - y), "{a} - {b} misses {}", x - y);
                        assert!(prod.contains(x * y), "{a} * {b} misses {}", x * y);
                    }
                }
            }
        }
    }

    #[test]
    fn test_interval_overflow_collapses() {
        let big = Interval::new(i64::MAX - 10, i64::MAX - 1);
        assert!((big + Interval::point(100)).is_unbounded());
        assert!((big * Interval::point(2)).is_unbounded());
        assert!((Interval::UNBOUNDED + Interval::point(1)).is_unbounded());
        assert_eq!(-Interval::new(1, 4), Interval::new(-4, -1));
    }

    #[test]
    fn test_congruence_propagation() {
        // x in [0, 12], x ≡ 0 mod 4
        let x = SteppedInterval::with_congruence(Interval::new(0, 12), 4, 0);
        let addr = x.scale(4).offset(0x1000);
        assert_eq!(addr.modulus, 16);
        assert!(addr.is_aligned(16));

        let shifted = addr.offset(4);
        assert_eq!(shifted.residue(16), Some(4));
        assert!(shifted.is_aligned(4));
        assert!(!shifted.is_aligned(16));

        let y = SteppedInterval::range(Interval::new(0, 3));
        let row = y.scale(16);
        let sum = addr + row;
        assert_eq!(sum.modulus, 16);
        assert_eq!(sum.interval, Interval::new(0x1000, 0x1000 + 48 + 48));
    }

    #[test]
    fn test_congruence_of_products() {
        let a = SteppedInterval::with_congruence(Interval::new(2, 10), 4, 2);
        let b = SteppedInterval::with_congruence(Interval::new(3, 9), 6, 3);
        let p = a * b;
        for x in (2..=10).step_by(4) {
            for y in (3..=9).step_by(6) {
                assert_eq!((x * y - p.remainder).rem_euclid(p.modulus), 0);
            }
        }
    }

    #[test]
    fn test_congruence_overflow_degrades() {
        let a = SteppedInterval::with_congruence(Interval::new(0, 100), 1 << 40, 0);
        let b = a.scale(1 << 40);
        assert_eq!(b.modulus, 1);
        assert_eq!(b.remainder, 0);
    }

    #[test]
    fn test_hull_keeps_common_stride() {
        let a = SteppedInterval::constant(8);
        let b = SteppedInterval::constant(20);
        let h = a.hull(b);
        assert_eq!(h.interval, Interval::new(8, 20));
        assert_eq!(h.modulus, 12);
        assert_eq!(h.remainder, 8);
    }
}
