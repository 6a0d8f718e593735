//! Shadow-line representations.
//!
//! A line covers 32 consecutive bytes of guest address space. Most lines hold
//! at most 4 distinct shadow values and compress to [`LineZ`]: a small value
//! dictionary plus a 2-bit-per-byte index array. Lines with more than 4
//! distinct values fall back to the full form: 32 explicit values stored in
//! the pooled, reference-counted [`FLineArena`].

use hazeline_types::SVal;

use crate::bitpack::{self, PACKED_BYTES};

/// Bytes covered by one shadow line.
pub const LINE_BYTES: usize = 32;

/// log2 of [`LINE_BYTES`].
pub const LINE_SHIFT: u32 = 5;

/// Dictionary entries in the compressed form.
pub const DICT_ENTRIES: usize = 4;

// ---------------------------------------------------------------------------
// LineZ: compressed form
// ---------------------------------------------------------------------------

/// Compressed line: up to 4 distinct values and per-byte dictionary indices.
///
/// Unused dictionary entries hold `SVal::NoAccess` and are never indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineZ {
    dict: [SVal; DICT_ENTRIES],
    ix2: [u8; PACKED_BYTES],
}

impl LineZ {
    /// A line with every byte equal to `sv`.
    #[must_use]
    pub fn uniform(sv: SVal) -> Self {
        Self {
            dict: [sv, SVal::NoAccess, SVal::NoAccess, SVal::NoAccess],
            ix2: bitpack::splat2(0),
        }
    }

    /// The value of byte `i` (0..32).
    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> SVal {
        self.dict[usize::from(bitpack::get2(&self.ix2, i))]
    }

    /// Try to compress 32 explicit values. Fails with `None` when more than
    /// 4 distinct values occur.
    #[must_use]
    pub fn compress(vals: &[SVal; LINE_BYTES]) -> Option<Self> {
        let mut dict = [SVal::NoAccess; DICT_ENTRIES];
        let mut used = 0_usize;
        let mut ix2 = [0_u8; PACKED_BYTES];
        for (i, &v) in vals.iter().enumerate() {
            let di = match dict[..used].iter().position(|&d| d == v) {
                Some(di) => di,
                None => {
                    if used == DICT_ENTRIES {
                        return None;
                    }
                    dict[used] = v;
                    used += 1;
                    used - 1
                }
            };
            bitpack::set2(&mut ix2, i, di as u8);
        }
        Some(Self { dict, ix2 })
    }

    /// Expand into 32 explicit values.
    pub fn decompress(&self, out: &mut [SVal; LINE_BYTES]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.get(i);
        }
    }

    /// Whether every byte of the line is untracked.
    #[must_use]
    pub fn is_uniform_noaccess(&self) -> bool {
        (0..LINE_BYTES).all(|i| !self.get(i).is_tracked())
    }

    /// Visit each byte's value in order.
    pub fn for_each(&self, mut f: impl FnMut(SVal)) {
        for i in 0..LINE_BYTES {
            f(self.get(i));
        }
    }

    /// Rewrite every dictionary entry through `f` (handle remapping).
    pub fn map_values(&mut self, mut f: impl FnMut(SVal) -> SVal) {
        for d in &mut self.dict {
            *d = f(*d);
        }
    }
}

// ---------------------------------------------------------------------------
// FLineArena: full-form lines, pooled and reference-counted
// ---------------------------------------------------------------------------

/// Index into the full-line arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FLineIdx(u32);

impl FLineIdx {
    #[inline]
    #[must_use]
    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

struct FSlot {
    vals: [SVal; LINE_BYTES],
    rc: u32,
}

/// Pool of full-form lines with a free list.
///
/// A slot may be shared by several stored lines (whole-line shadow copies);
/// the count tracks referencing lines, not bytes.
pub struct FLineArena {
    slots: Vec<Option<FSlot>>,
    free: Vec<u32>,
    high_water: u64,
}

impl FLineArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            high_water: 0,
        }
    }

    /// Allocate a slot holding `vals`, with a reference count of 1.
    pub fn alloc(&mut self, vals: [SVal; LINE_BYTES]) -> FLineIdx {
        let slot = FSlot { vals, rc: 1 };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            return FLineIdx(idx);
        }
        let idx = u32::try_from(self.slots.len()).expect("full-line arena index overflow");
        self.slots.push(Some(slot));
        self.high_water += 1;
        FLineIdx(idx)
    }

    /// Add a reference to a slot (whole-line sharing).
    pub fn rcinc(&mut self, idx: FLineIdx) {
        let slot = self.slot_mut(idx);
        slot.rc += 1;
    }

    /// Drop a reference. Frees the slot when the count reaches zero and
    /// returns `true` in that case.
    pub fn rcdec(&mut self, idx: FLineIdx) -> bool {
        let slot = self.slot_mut(idx);
        assert!(slot.rc > 0, "FLineArena::rcdec below zero");
        slot.rc -= 1;
        if slot.rc == 0 {
            self.slots[idx.0 as usize] = None;
            self.free.push(idx.0);
            true
        } else {
            false
        }
    }

    /// The values in a slot.
    #[must_use]
    pub fn get(&self, idx: FLineIdx) -> &[SVal; LINE_BYTES] {
        &self.slots[idx.0 as usize]
            .as_ref()
            .expect("FLineIdx refers to a freed slot")
            .vals
    }

    /// Current reference count of a slot (tests and invariant checks).
    #[must_use]
    pub fn rc(&self, idx: FLineIdx) -> u32 {
        self.slots[idx.0 as usize].as_ref().map_or(0, |s| s.rc)
    }

    /// Number of live slots.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Total slots ever allocated.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Visit every live slot's values mutably, once per slot even when
    /// shared (handle remapping).
    pub fn for_each_live_mut(&mut self, mut f: impl FnMut(&mut [SVal; LINE_BYTES])) {
        for slot in self.slots.iter_mut().flatten() {
            f(&mut slot.vals);
        }
    }

    fn slot_mut(&mut self, idx: FLineIdx) -> &mut FSlot {
        self.slots[idx.0 as usize]
            .as_mut()
            .expect("FLineIdx refers to a freed slot")
    }
}

impl Default for FLineArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FLineArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FLineArena")
            .field("live", &self.live_count())
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CompressedLine
// ---------------------------------------------------------------------------

/// A stored shadow line: compressed in place, or a handle into the
/// full-line pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedLine {
    /// Dictionary-compressed.
    Z(LineZ),
    /// Full form, pooled.
    F(FLineIdx),
}

impl CompressedLine {
    /// A line with every byte untracked.
    #[must_use]
    pub fn noaccess() -> Self {
        Self::Z(LineZ::uniform(SVal::NoAccess))
    }

    /// Whether every byte of the line is untracked.
    #[must_use]
    pub fn is_uniform_noaccess(&self, arena: &FLineArena) -> bool {
        match self {
            Self::Z(z) => z.is_uniform_noaccess(),
            Self::F(idx) => arena.get(*idx).iter().all(|v| !v.is_tracked()),
        }
    }

    /// Expand into 32 explicit values.
    pub fn decompress(&self, arena: &FLineArena, out: &mut [SVal; LINE_BYTES]) {
        match self {
            Self::Z(z) => z.decompress(out),
            Self::F(idx) => *out = *arena.get(*idx),
        }
    }

    /// Visit each byte's value in order.
    pub fn for_each(&self, arena: &FLineArena, mut f: impl FnMut(SVal)) {
        match self {
            Self::Z(z) => z.for_each(f),
            Self::F(idx) => {
                for &v in arena.get(*idx) {
                    f(v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hazeline_types::VtsId;

    fn clean(r: u32, w: u32) -> SVal {
        SVal::Clean {
            rmin: VtsId::from_raw(r),
            wmin: VtsId::from_raw(w),
        }
    }

    #[test]
    fn uniform_line_reads_back() {
        let z = LineZ::uniform(clean(1, 2));
        for i in 0..LINE_BYTES {
            assert_eq!(z.get(i), clean(1, 2));
        }
        assert!(!z.is_uniform_noaccess());
        assert!(LineZ::uniform(SVal::NoAccess).is_uniform_noaccess());
    }

    #[test]
    fn compress_within_dictionary_budget() {
        let mut vals = [SVal::NoAccess; LINE_BYTES];
        vals[0] = clean(1, 1);
        vals[7] = clean(2, 2);
        vals[31] = clean(3, 3);
        let z = LineZ::compress(&vals).expect("4 distinct values compress");
        let mut out = [SVal::NoAccess; LINE_BYTES];
        z.decompress(&mut out);
        assert_eq!(out, vals);
    }

    #[test]
    fn compress_fails_past_four_distinct() {
        let mut vals = [SVal::NoAccess; LINE_BYTES];
        for i in 0..4 {
            vals[i] = clean(i as u32 + 1, i as u32 + 1);
        }
        // NoAccess itself is the fifth distinct value.
        assert!(LineZ::compress(&vals).is_none());

        // Exactly four distinct values still fit.
        for v in &mut vals {
            if !v.is_tracked() {
                *v = clean(1, 1);
            }
        }
        assert!(LineZ::compress(&vals).is_some());
    }

    #[test]
    fn arena_alloc_share_free() {
        let mut arena = FLineArena::new();
        let vals = {
            let mut v = [SVal::NoAccess; LINE_BYTES];
            v[3] = clean(5, 6);
            v
        };
        let idx = arena.alloc(vals);
        assert_eq!(arena.rc(idx), 1);
        assert_eq!(arena.get(idx)[3], clean(5, 6));

        arena.rcinc(idx);
        assert!(!arena.rcdec(idx), "shared slot survives one release");
        assert!(arena.rcdec(idx), "last release frees");
        assert_eq!(arena.live_count(), 0);

        // Freed index is recycled.
        let idx2 = arena.alloc(vals);
        assert_eq!(idx2.raw(), idx.raw());
    }

    #[test]
    fn compressed_line_round_trip_through_arena() {
        let mut arena = FLineArena::new();
        let mut vals = [SVal::NoAccess; LINE_BYTES];
        for i in 0..8 {
            vals[i] = clean(i as u32, i as u32 + 1);
        }
        let line = CompressedLine::F(arena.alloc(vals));
        let mut out = [SVal::NoAccess; LINE_BYTES];
        line.decompress(&arena, &mut out);
        assert_eq!(out, vals);
        assert!(!line.is_uniform_noaccess(&arena));
        assert!(CompressedLine::noaccess().is_uniform_noaccess(&arena));
    }
}
