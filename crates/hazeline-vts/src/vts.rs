//! The vector-timestamp value type.
//!
//! A [`VectorTimestamp`] is an ordered, duplicate-free sequence of
//! `(thread, scalar)` components, sorted ascending by thread index. A thread
//! absent from the sequence has scalar 0; canonical form never stores a zero
//! scalar. Values are immutable once built; every operation returns a new
//! value.

use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

use hazeline_error::{HazelineError, Result};
use hazeline_types::pack::MAX_CLOCK;
use hazeline_types::{ScalarPair, ThrId};

/// Inline capacity for components. Most programs synchronize among a handful
/// of threads, so the common case avoids heap allocation entirely.
const INLINE_COMPONENTS: usize = 4;

/// An immutable vector timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VectorTimestamp {
    comps: SmallVec<[ScalarPair; INLINE_COMPONENTS]>,
}

impl VectorTimestamp {
    /// The empty timestamp: every thread at scalar 0.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A timestamp with a single nonzero component.
    ///
    /// # Panics
    ///
    /// Panics if `scalar` is zero or exceeds the representable clock range;
    /// callers construct singletons only from freshly assigned clocks.
    #[must_use]
    pub fn singleton(thr: ThrId, scalar: u64) -> Self {
        let pair = ScalarPair::new(thr, scalar).expect("singleton scalar out of range");
        let mut comps = SmallVec::new();
        comps.push(pair);
        Self { comps }
    }

    /// Number of nonzero components.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.comps.len()
    }

    /// Whether every component is zero.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    /// The scalar for `thr`, 0 if absent.
    #[must_use]
    pub fn get(&self, thr: ThrId) -> u64 {
        self.comps
            .binary_search_by_key(&thr, |p| p.thr())
            .map_or(0, |i| self.comps[i].clock())
    }

    /// Iterate components in ascending thread order.
    pub fn iter(&self) -> impl Iterator<Item = ScalarPair> + '_ {
        self.comps.iter().copied()
    }

    /// Whether the component sequence is in canonical form: strictly
    /// ascending thread indices, no zero scalars. Zero scalars are
    /// unrepresentable in [`ScalarPair`], so only ordering is checked.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.comps.windows(2).all(|w| w[0].thr() < w[1].thr())
    }

    /// New timestamp with `thr`'s component incremented by 1 (set to 1 if
    /// absent).
    ///
    /// Fails with [`HazelineError::ClockOverflow`] if the scalar would leave
    /// its fixed bit width. That is a hard limit of the encoding; the caller
    /// must treat it as fatal.
    pub fn tick(&self, thr: ThrId) -> Result<Self> {
        let mut comps = SmallVec::with_capacity(self.comps.len() + 1);
        let mut ticked = false;
        for &p in &self.comps {
            if p.thr() == thr {
                let next = p
                    .with_clock(p.clock() + 1)
                    .ok_or(HazelineError::ClockOverflow {
                        thread: thr.get(),
                        max: MAX_CLOCK,
                    })?;
                comps.push(next);
                ticked = true;
            } else {
                if !ticked && p.thr() > thr {
                    comps.push(ScalarPair::new(thr, 1).expect("1 is always representable"));
                    ticked = true;
                }
                comps.push(p);
            }
        }
        if !ticked {
            comps.push(ScalarPair::new(thr, 1).expect("1 is always representable"));
        }
        Ok(Self { comps })
    }

    /// Componentwise maximum over the union of threads.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        let mut comps = SmallVec::with_capacity(self.comps.len().max(other.comps.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.comps.len() && j < other.comps.len() {
            let (a, b) = (self.comps[i], other.comps[j]);
            match a.thr().cmp(&b.thr()) {
                std::cmp::Ordering::Less => {
                    comps.push(a);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    comps.push(b);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    comps.push(if a.clock() >= b.clock() { a } else { b });
                    i += 1;
                    j += 1;
                }
            }
        }
        comps.extend_from_slice(&self.comps[i..]);
        comps.extend_from_slice(&other.comps[j..]);
        Self { comps }
    }

    /// True iff every component of `self` is ≤ the corresponding component
    /// of `other` (absent = 0).
    #[must_use]
    pub fn leq(&self, other: &Self) -> bool {
        self.first_not_leq(other).is_none()
    }

    /// The first thread (ascending) by which `self` fails to be ≤ `other`,
    /// or `None` if `self ⊑ other`. Used to orient race diagnostics.
    #[must_use]
    pub fn first_not_leq(&self, other: &Self) -> Option<ThrId> {
        let mut j = 0;
        for &a in &self.comps {
            while j < other.comps.len() && other.comps[j].thr() < a.thr() {
                j += 1;
            }
            let b = if j < other.comps.len() && other.comps[j].thr() == a.thr() {
                other.comps[j].clock()
            } else {
                0
            };
            if a.clock() > b {
                return Some(a.thr());
            }
        }
        None
    }

    /// New timestamp with every component belonging to a thread in `dead`
    /// removed. `dead` must be sorted ascending.
    #[must_use]
    pub fn without_threads(&self, dead: &[ThrId]) -> Self {
        debug_assert!(dead.windows(2).all(|w| w[0] < w[1]), "dead list not sorted");
        let comps = self
            .comps
            .iter()
            .copied()
            .filter(|p| dead.binary_search(&p.thr()).is_err())
            .collect();
        Self { comps }
    }

    /// Structural content hash, stable across clones.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut h = Xxh3::new();
        for p in &self.comps {
            h.update(&p.raw().to_le_bytes());
        }
        h.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn thr(raw: u32) -> ThrId {
        ThrId::new(raw).unwrap()
    }

    /// Build a timestamp from (thread, scalar) pairs by repeated ticking,
    /// exercising the public construction path only.
    fn vts_of(pairs: &[(u32, u64)]) -> VectorTimestamp {
        let mut v = VectorTimestamp::empty();
        for &(t, n) in pairs {
            for _ in 0..n {
                v = v.tick(thr(t)).unwrap();
            }
        }
        v
    }

    #[test]
    fn singleton_and_get() {
        let v = VectorTimestamp::singleton(thr(5), 3);
        assert_eq!(v.get(thr(5)), 3);
        assert_eq!(v.get(thr(4)), 0);
        assert_eq!(v.len(), 1);
        assert!(v.is_canonical());
    }

    #[test]
    fn tick_inserts_in_order() {
        let v = vts_of(&[(7, 1)]);
        let v = v.tick(thr(2)).unwrap();
        let v = v.tick(thr(9)).unwrap();
        let comps: Vec<_> = v.iter().map(|p| (p.thr().get(), p.clock())).collect();
        assert_eq!(comps, vec![(2, 1), (7, 1), (9, 1)]);
        assert!(v.is_canonical());
    }

    #[test]
    fn tick_monotone_and_strict() {
        let v = vts_of(&[(1, 2), (3, 1)]);
        let t = v.tick(thr(3)).unwrap();
        assert!(v.leq(&t));
        assert_ne!(v, t);
        assert_eq!(t.get(thr(3)), 2);
    }

    #[test]
    fn tick_overflow_is_fatal() {
        let base = ScalarPair::new(thr(0), MAX_CLOCK).unwrap();
        let mut comps = SmallVec::new();
        comps.push(base);
        let v = VectorTimestamp { comps };
        let err = v.tick(thr(0)).unwrap_err();
        assert!(matches!(err, HazelineError::ClockOverflow { thread: 0, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn join_is_componentwise_max() {
        let a = vts_of(&[(1, 3), (4, 1)]);
        let b = vts_of(&[(1, 1), (2, 5)]);
        let j = a.join(&b);
        assert_eq!(j.get(thr(1)), 3);
        assert_eq!(j.get(thr(2)), 5);
        assert_eq!(j.get(thr(4)), 1);
        assert!(j.is_canonical());
    }

    #[test]
    fn leq_absent_means_zero() {
        let a = vts_of(&[(2, 1)]);
        let b = vts_of(&[(1, 4), (2, 2), (3, 1)]);
        assert!(a.leq(&b));
        assert!(!b.leq(&a));
        assert_eq!(b.first_not_leq(&a), Some(thr(1)));
    }

    #[test]
    fn first_not_leq_reports_lowest_thread() {
        let a = vts_of(&[(1, 1), (5, 9)]);
        let b = vts_of(&[(5, 2)]);
        // Fails at thread 1 (1 > 0) before thread 5 (9 > 2).
        assert_eq!(a.first_not_leq(&b), Some(thr(1)));
    }

    #[test]
    fn without_threads_drops_components() {
        let v = vts_of(&[(1, 2), (3, 4), (8, 1)]);
        let pruned = v.without_threads(&[thr(3), thr(8)]);
        assert_eq!(pruned.get(thr(1)), 2);
        assert_eq!(pruned.get(thr(3)), 0);
        assert_eq!(pruned.get(thr(8)), 0);
        assert_eq!(pruned.len(), 1);
    }

    #[test]
    fn content_hash_tracks_structure() {
        let a = vts_of(&[(1, 2), (3, 1)]);
        let b = vts_of(&[(3, 1), (1, 2)]);
        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());

        let c = a.tick(thr(1)).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    // -----------------------------------------------------------------------
    // Lattice laws
    // -----------------------------------------------------------------------

    fn arb_vts() -> impl Strategy<Value = VectorTimestamp> {
        proptest::collection::vec((0_u32..12, 1_u64..6), 0..6).prop_map(|pairs| {
            let mut v = VectorTimestamp::empty();
            for (t, n) in pairs {
                for _ in 0..n {
                    v = v.tick(ThrId::new(t).unwrap()).unwrap();
                }
            }
            v
        })
    }

    proptest! {
        #[test]
        fn prop_leq_reflexive(a in arb_vts()) {
            prop_assert!(a.leq(&a));
        }

        #[test]
        fn prop_leq_antisymmetric(a in arb_vts(), b in arb_vts()) {
            if a.leq(&b) && b.leq(&a) {
                prop_assert_eq!(a, b);
            }
        }

        #[test]
        fn prop_join_is_upper_bound(a in arb_vts(), b in arb_vts()) {
            let j = a.join(&b);
            prop_assert!(a.leq(&j));
            prop_assert!(b.leq(&j));
        }

        #[test]
        fn prop_join_is_least_upper_bound(a in arb_vts(), b in arb_vts(), c in arb_vts()) {
            // Any common upper bound dominates the join.
            if a.leq(&c) && b.leq(&c) {
                prop_assert!(a.join(&b).leq(&c));
            }
        }

        #[test]
        fn prop_join_commutes(a in arb_vts(), b in arb_vts()) {
            prop_assert_eq!(a.join(&b), b.join(&a));
        }

        #[test]
        fn prop_tick_strictly_monotone(a in arb_vts(), t in 0_u32..12) {
            let ticked = a.tick(ThrId::new(t).unwrap()).unwrap();
            prop_assert!(a.leq(&ticked));
            prop_assert!(!ticked.leq(&a));
        }

        #[test]
        fn prop_canonical_closed_under_ops(a in arb_vts(), b in arb_vts()) {
            prop_assert!(a.join(&b).is_canonical());
            prop_assert!(a.tick(ThrId::ROOT).unwrap().is_canonical());
        }
    }
}
