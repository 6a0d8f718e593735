//! Bit-packed (thread, scalar clock) pairs.
//!
//! A vector timestamp is a sorted sequence of per-thread scalar clocks. Each
//! component packs the 18-bit thread index and the 46-bit clock value into a
//! single `u64`, thread in the high bits so that ordering on the raw word is
//! ordering on `(thread, clock)`.
//!
//! The packing is deliberately isolated here so the layout can be swapped
//! (say, for a byte-per-field debug layout) without touching any ordering or
//! comparison logic.

use std::fmt;

use crate::ThrId;

/// Bits reserved for the thread index.
pub const THR_BITS: u32 = 18;

/// Bits reserved for the scalar clock.
pub const CLOCK_BITS: u32 = 46;

/// Maximum number of distinct threads over a process lifetime.
pub const MAX_THREADS: u32 = 1 << THR_BITS;

/// Largest representable scalar clock value.
pub const MAX_CLOCK: u64 = (1 << CLOCK_BITS) - 1;

const CLOCK_MASK: u64 = MAX_CLOCK;

/// One vector-timestamp component: a thread index and its scalar clock,
/// packed into a single word.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ScalarPair(u64);

impl ScalarPair {
    /// Pack a component. Returns `None` if `clock` exceeds [`MAX_CLOCK`]
    /// or is zero (canonical form never stores zero scalars).
    #[inline]
    #[must_use]
    pub const fn new(thr: ThrId, clock: u64) -> Option<Self> {
        if clock == 0 || clock > MAX_CLOCK {
            return None;
        }
        Some(Self(((thr.get() as u64) << CLOCK_BITS) | clock))
    }

    /// The thread index.
    #[inline]
    #[must_use]
    pub const fn thr(self) -> ThrId {
        // The high bits were produced from a valid ThrId in `new`.
        match ThrId::new((self.0 >> CLOCK_BITS) as u32) {
            Some(t) => t,
            None => unreachable!(),
        }
    }

    /// The scalar clock value. Always in `1..=MAX_CLOCK`.
    #[inline]
    #[must_use]
    pub const fn clock(self) -> u64 {
        self.0 & CLOCK_MASK
    }

    /// Replace the clock value, keeping the thread.
    ///
    /// Returns `None` on overflow past [`MAX_CLOCK`] or a zero clock.
    #[inline]
    #[must_use]
    pub const fn with_clock(self, clock: u64) -> Option<Self> {
        if clock == 0 || clock > MAX_CLOCK {
            return None;
        }
        Some(Self((self.0 & !CLOCK_MASK) | clock))
    }

    /// The raw packed word. Stable input for content hashing.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ScalarPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.thr(), self.clock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thr(raw: u32) -> ThrId {
        ThrId::new(raw).unwrap()
    }

    #[test]
    fn pack_round_trip() {
        for &t in &[0_u32, 1, 17, MAX_THREADS - 1] {
            for &c in &[1_u64, 2, 1000, MAX_CLOCK - 1, MAX_CLOCK] {
                let p = ScalarPair::new(thr(t), c).unwrap();
                assert_eq!(p.thr().get(), t);
                assert_eq!(p.clock(), c);
            }
        }
    }

    #[test]
    fn zero_clock_rejected() {
        assert!(ScalarPair::new(thr(3), 0).is_none());
    }

    #[test]
    fn clock_overflow_rejected() {
        assert!(ScalarPair::new(thr(3), MAX_CLOCK + 1).is_none());
        let p = ScalarPair::new(thr(3), MAX_CLOCK).unwrap();
        assert!(p.with_clock(MAX_CLOCK + 1).is_none());
    }

    #[test]
    fn with_clock_preserves_thread() {
        let p = ScalarPair::new(thr(9), 5).unwrap();
        let q = p.with_clock(6).unwrap();
        assert_eq!(q.thr().get(), 9);
        assert_eq!(q.clock(), 6);
    }

    #[test]
    fn raw_order_is_thread_then_clock() {
        let a = ScalarPair::new(thr(1), MAX_CLOCK).unwrap();
        let b = ScalarPair::new(thr(2), 1).unwrap();
        assert!(a < b, "thread index dominates the packed ordering");

        let c = ScalarPair::new(thr(2), 2).unwrap();
        assert!(b < c, "clock orders within one thread");
    }

    #[test]
    fn debug_format() {
        let p = ScalarPair::new(thr(4), 12).unwrap();
        assert_eq!(format!("{p:?}"), "#4@12");
    }
}
