//! Memo cache for comparison and join over interned handles.
//!
//! Hot access patterns compare the same few handle pairs over and over (a
//! thread's clock against the constraints of the line it is scanning). The
//! cache is direct-mapped with two ways per set, MRU in way 0, and is keyed
//! by the raw handle pair, so it must be invalidated wholesale whenever
//! handles are swept or remapped.

use hazeline_types::VtsId;

/// Sets per cache. Power of two for mask indexing.
const SETS: usize = 1024;

/// Ways per set.
const WAYS: usize = 2;

/// SplitMix64 finalization, used to spread handle pairs across sets.
#[inline]
#[must_use]
#[allow(clippy::unreadable_literal)]
fn mix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[inline]
fn pair_key(a: VtsId, b: VtsId) -> u64 {
    (u64::from(a.raw()) << 32) | u64::from(b.raw())
}

#[derive(Clone, Copy)]
struct Entry<V: Copy> {
    key: u64,
    value: V,
}

struct Bank<V: Copy> {
    sets: Vec<[Option<Entry<V>>; WAYS]>,
}

impl<V: Copy> Bank<V> {
    fn new() -> Self {
        Self {
            sets: vec![[None; WAYS]; SETS],
        }
    }

    fn probe(&mut self, key: u64) -> Option<V> {
        let set = &mut self.sets[(mix64(key) as usize) & (SETS - 1)];
        if let Some(e) = set[0] {
            if e.key == key {
                return Some(e.value);
            }
        }
        if let Some(e) = set[1] {
            if e.key == key {
                // Promote to MRU.
                set.swap(0, 1);
                return Some(e.value);
            }
        }
        None
    }

    fn insert(&mut self, key: u64, value: V) {
        let set = &mut self.sets[(mix64(key) as usize) & (SETS - 1)];
        set[1] = set[0];
        set[0] = Some(Entry { key, value });
    }

    fn clear(&mut self) {
        for set in &mut self.sets {
            *set = [None; WAYS];
        }
    }
}

/// Two-bank memo: one bank for ordering comparisons, one for joins.
pub struct CmpCache {
    leq: Bank<bool>,
    join: Bank<VtsId>,
    hits: u64,
    misses: u64,
}

impl CmpCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            leq: Bank::new(),
            join: Bank::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Probe the comparison bank for `a ⊑ b`.
    pub fn probe_leq(&mut self, a: VtsId, b: VtsId) -> Option<bool> {
        let hit = self.leq.probe(pair_key(a, b));
        self.note(hit.is_some());
        hit
    }

    /// Record `a ⊑ b == result`.
    pub fn insert_leq(&mut self, a: VtsId, b: VtsId, result: bool) {
        self.leq.insert(pair_key(a, b), result);
    }

    /// Probe the join bank. Join is commutative, so the key is normalized.
    pub fn probe_join(&mut self, a: VtsId, b: VtsId) -> Option<VtsId> {
        let (lo, hi) = if a.raw() <= b.raw() { (a, b) } else { (b, a) };
        let hit = self.join.probe(pair_key(lo, hi));
        self.note(hit.is_some());
        hit
    }

    /// Record `join(a, b) == result`.
    pub fn insert_join(&mut self, a: VtsId, b: VtsId, result: VtsId) {
        let (lo, hi) = if a.raw() <= b.raw() { (a, b) } else { (b, a) };
        self.join.insert(pair_key(lo, hi), result);
    }

    /// Drop every memoized entry. Required before any handle is swept or
    /// remapped; a stale entry would resurrect a dead handle.
    pub fn invalidate_all(&mut self) {
        self.leq.clear();
        self.join.clear();
    }

    /// `(hits, misses)` since construction.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn note(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }
}

impl Default for CmpCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> VtsId {
        VtsId::from_raw(raw)
    }

    #[test]
    fn leq_probe_miss_then_hit() {
        let mut c = CmpCache::new();
        assert_eq!(c.probe_leq(id(1), id(2)), None);
        c.insert_leq(id(1), id(2), true);
        assert_eq!(c.probe_leq(id(1), id(2)), Some(true));
        // Direction matters for comparisons.
        assert_eq!(c.probe_leq(id(2), id(1)), None);
    }

    #[test]
    fn join_key_is_commutative() {
        let mut c = CmpCache::new();
        c.insert_join(id(5), id(3), id(9));
        assert_eq!(c.probe_join(id(3), id(5)), Some(id(9)));
        assert_eq!(c.probe_join(id(5), id(3)), Some(id(9)));
    }

    #[test]
    fn second_way_retains_previous_entry() {
        let mut c = CmpCache::new();
        // Whether or not the two keys collide on a set, one insert must
        // never evict the immediately preceding entry (way 1 catches the
        // colliding case).
        c.insert_leq(id(1), id(2), true);
        c.insert_leq(id(1), id(3), false);
        assert_eq!(c.probe_leq(id(1), id(3)), Some(false));
        assert_eq!(c.probe_leq(id(1), id(2)), Some(true));
    }

    #[test]
    fn invalidate_clears_everything() {
        let mut c = CmpCache::new();
        c.insert_leq(id(1), id(2), true);
        c.insert_join(id(1), id(2), id(7));
        c.invalidate_all();
        assert_eq!(c.probe_leq(id(1), id(2)), None);
        assert_eq!(c.probe_join(id(1), id(2)), None);
    }

    #[test]
    fn stats_count_probes() {
        let mut c = CmpCache::new();
        let _ = c.probe_leq(id(1), id(2));
        c.insert_leq(id(1), id(2), true);
        let _ = c.probe_leq(id(1), id(2));
        assert_eq!(c.stats(), (1, 1));
    }
}
