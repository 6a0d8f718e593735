//! Compressed two-level shadow memory for the Hazeline happens-before engine.
//!
//! Maps every byte of the monitored address space to a shadow value. Storage
//! is a sparse map of 8 KiB segments holding dictionary-compressed 32-byte
//! lines, fronted by a working-set cache of decompressed lines. Reference
//! counts on interned timestamp handles are maintained eagerly: one count per
//! byte that stores the handle, adjusted at every byte mutation and audited
//! by walking the flushed store.

pub mod bitpack;
pub mod cache;
pub mod line;
pub mod segment;

pub use cache::LineCache;
pub use line::{CompressedLine, FLineArena, FLineIdx, LineZ, LINE_BYTES, LINE_SHIFT};
pub use segment::{Segment, SegmentMap, LINES_PER_SEGMENT, SEGMENT_BYTES, SEGMENT_SHIFT};

use hazeline_types::SVal;
use hazeline_vts::{VtsRemap, VtsTable};

/// Add one per-byte reference for each handle stored in `sv`.
#[inline]
pub fn retain_sval(table: &mut VtsTable, sv: SVal) {
    sv.for_each_id(|id| table.rcinc(id));
}

/// Drop one per-byte reference for each handle stored in `sv`.
#[inline]
pub fn release_sval(table: &mut VtsTable, sv: SVal) {
    sv.for_each_id(|id| table.rcdec(id));
}

/// Counters exposed by [`ShadowMemory::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShadowStats {
    /// Cache fills from the segment map.
    pub cache_fills: u64,
    /// Cache writebacks into the segment map.
    pub cache_writebacks: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Segments currently allocated.
    pub segments: usize,
    /// Segments ever allocated.
    pub segments_allocated: u64,
    /// Segments scavenged.
    pub segments_scavenged: u64,
    /// Full-form lines currently pooled.
    pub full_lines: usize,
}

/// The shadow-memory store.
pub struct ShadowMemory {
    map: SegmentMap,
    arena: FLineArena,
    cache: LineCache,
}

impl ShadowMemory {
    /// Create an empty store: every byte untracked.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: SegmentMap::new(),
            arena: FLineArena::new(),
            cache: LineCache::new(),
        }
    }

    /// Mutable access to the decompressed 32-value line containing `addr`.
    /// This is the hot-path entry: the caller mutates values in place and is
    /// responsible for reference-count adjustments on what it overwrites.
    #[inline]
    pub fn line_mut(&mut self, addr: u64) -> &mut [SVal; LINE_BYTES] {
        let base = addr & !(LINE_BYTES as u64 - 1);
        self.cache.line_mut(base, &mut self.map, &mut self.arena)
    }

    /// The shadow value of one byte.
    pub fn read_sval(&mut self, addr: u64) -> SVal {
        let line = self.line_mut(addr);
        line[(addr & (LINE_BYTES as u64 - 1)) as usize]
    }

    /// Set every byte in `[addr, addr + size)` to `sv`, adjusting reference
    /// counts for both the overwritten and the stored values.
    pub fn set_range(&mut self, table: &mut VtsTable, addr: u64, size: u64, sv: SVal) {
        let mut a = addr;
        let end = addr.saturating_add(size);
        while a < end {
            let line = self.cache.line_mut(
                a & !(LINE_BYTES as u64 - 1),
                &mut self.map,
                &mut self.arena,
            );
            let start = (a & (LINE_BYTES as u64 - 1)) as usize;
            let remaining = usize::try_from(end - a).unwrap_or(usize::MAX);
            let span = LINE_BYTES.min(start.saturating_add(remaining));
            for slot in &mut line[start..span] {
                release_sval(table, *slot);
                retain_sval(table, sv);
                *slot = sv;
            }
            a += (span - start) as u64;
        }
    }

    /// Shadow `memmove`: copy the shadow values of `[src, src + size)` onto
    /// `[dst, dst + size)`, with reference counts adjusted per byte.
    ///
    /// Whole-line aligned copies of non-overlapping ranges share full-form
    /// pool slots instead of duplicating them.
    pub fn copy_range(&mut self, table: &mut VtsTable, src: u64, dst: u64, size: u64) {
        if size == 0 || src == dst {
            return;
        }
        let overlap = src < dst.saturating_add(size) && dst < src.saturating_add(size);
        let line_sz = LINE_BYTES as u64;
        if !overlap && src % line_sz == 0 && dst % line_sz == 0 && size % line_sz == 0 {
            self.copy_aligned_lines(table, src, dst, size);
            return;
        }

        // General path: snapshot the source values, then write. Handles
        // overlap in either direction.
        let n = usize::try_from(size).expect("shadow copy size fits usize");
        let mut snapshot = Vec::with_capacity(n);
        for off in 0..size {
            snapshot.push(self.read_sval(src + off));
        }
        for (off, &sv) in snapshot.iter().enumerate() {
            let a = dst + off as u64;
            let line = self.line_mut(a);
            let i = (a & (line_sz - 1)) as usize;
            release_sval(table, line[i]);
            retain_sval(table, sv);
            line[i] = sv;
        }
    }

    /// Run `f` over every stored handle occurrence (one per byte holding
    /// it, shared full-form lines visited once per referencing line).
    /// Flushes the cache so the walk covers everything.
    pub fn for_each_id_occurrence(&mut self, mut f: impl FnMut(hazeline_types::VtsId)) {
        self.cache.flush(&mut self.map, &mut self.arena);
        let arena = &self.arena;
        self.map.for_each(|_, seg| {
            for li in 0..LINES_PER_SEGMENT {
                seg.line(li).for_each(arena, |sv| sv.for_each_id(&mut f));
            }
        });
    }

    /// Run `f` over every stored per-byte shadow value. Flushes the cache
    /// first so the walk covers everything.
    pub fn for_each_sval(&mut self, mut f: impl FnMut(SVal)) {
        self.cache.flush(&mut self.map, &mut self.arena);
        let arena = &self.arena;
        self.map.for_each(|_, seg| {
            for li in 0..LINES_PER_SEGMENT {
                seg.line(li).for_each(arena, &mut f);
            }
        });
    }

    /// Rewrite every stored handle through a pruning remap.
    pub fn remap_ids(&mut self, remap: &VtsRemap) {
        self.cache.flush(&mut self.map, &mut self.arena);
        let map_sv = |sv: SVal| match sv {
            SVal::NoAccess => SVal::NoAccess,
            SVal::Clean { rmin, wmin } => SVal::Clean {
                rmin: remap.lookup(rmin),
                wmin: remap.lookup(wmin),
            },
        };
        self.arena.for_each_live_mut(|vals| {
            for v in vals.iter_mut() {
                *v = map_sv(*v);
            }
        });
        self.map.for_each_mut(|_, seg| {
            for li in 0..LINES_PER_SEGMENT {
                if let CompressedLine::Z(z) = seg.line_mut(li) {
                    z.map_values(&map_sv);
                }
            }
        });
    }

    /// Flush the working-set cache and release fully untracked segments.
    pub fn scavenge(&mut self) -> usize {
        self.cache.flush(&mut self.map, &mut self.arena);
        self.map.scavenge(&mut self.arena)
    }

    /// Flush the working-set cache, making stored forms authoritative.
    pub fn flush_cache(&mut self) {
        self.cache.flush(&mut self.map, &mut self.arena);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ShadowStats {
        let (cache_fills, cache_writebacks, cache_hits) = self.cache.stats();
        ShadowStats {
            cache_fills,
            cache_writebacks,
            cache_hits,
            segments: self.map.len(),
            segments_allocated: self.map.allocated_total(),
            segments_scavenged: self.map.scavenged_total(),
            full_lines: self.arena.live_count(),
        }
    }

    fn copy_aligned_lines(&mut self, table: &mut VtsTable, src: u64, dst: u64, size: u64) {
        self.cache.flush(&mut self.map, &mut self.arena);
        let line_sz = LINE_BYTES as u64;
        for k in 0..(size / line_sz) {
            let s = src + k * line_sz;
            let d = dst + k * line_sz;

            let src_line = self
                .map
                .get(SegmentMap::key_of(s))
                .map_or(CompressedLine::noaccess(), |seg| {
                    *seg.line(SegmentMap::line_index_of(s))
                });

            // Per-byte counts for the incoming values.
            src_line.for_each(&self.arena, |sv| retain_sval(table, sv));

            // Release what the destination line held.
            let dst_key = SegmentMap::key_of(d);
            if let Some(seg) = self.map.get_mut(dst_key) {
                let old = *seg.line(SegmentMap::line_index_of(d));
                match old {
                    CompressedLine::Z(z) => z.for_each(|sv| release_sval(table, sv)),
                    CompressedLine::F(idx) => {
                        for &sv in self.arena.get(idx) {
                            release_sval(table, sv);
                        }
                        self.arena.rcdec(idx);
                    }
                }
            } else if matches!(src_line, CompressedLine::Z(z) if z.is_uniform_noaccess()) {
                // Copying untracked onto an unallocated destination: no-op.
                continue;
            }

            if let CompressedLine::F(idx) = src_line {
                self.arena.rcinc(idx);
            }
            *self
                .map
                .get_or_alloc(dst_key)
                .line_mut(SegmentMap::line_index_of(d)) = src_line;
        }
    }
}

impl Default for ShadowMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShadowMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowMemory")
            .field("map", &self.map)
            .field("arena", &self.arena)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hazeline_types::{ThrId, VtsId};
    use hazeline_vts::VtsTable;

    fn intern_singleton(table: &mut VtsTable, thr: u32, clock: u64) -> VtsId {
        let v = hazeline_vts::VectorTimestamp::singleton(ThrId::new(thr).unwrap(), clock);
        table.intern_or_reuse(&v).unwrap()
    }

    fn clean(table: &mut VtsTable, thr: u32, clock: u64) -> SVal {
        let id = intern_singleton(table, thr, clock);
        SVal::Clean {
            rmin: id,
            wmin: id,
        }
    }

    #[test]
    fn default_state_is_noaccess() {
        let mut shadow = ShadowMemory::new();
        assert_eq!(shadow.read_sval(0x1234), SVal::NoAccess);
        assert_eq!(shadow.read_sval(u64::MAX - 7), SVal::NoAccess);
    }

    #[test]
    fn set_range_tracks_refcounts_per_byte() {
        let mut shadow = ShadowMemory::new();
        let mut table = VtsTable::new();
        let sv = clean(&mut table, 1, 1);
        let SVal::Clean { rmin, .. } = sv else {
            unreachable!()
        };

        shadow.set_range(&mut table, 100, 10, sv);
        // rmin and wmin are the same handle: 2 counts per byte.
        assert_eq!(table.rc(rmin), 20);
        assert_eq!(shadow.read_sval(100), sv);
        assert_eq!(shadow.read_sval(109), sv);
        assert_eq!(shadow.read_sval(110), SVal::NoAccess);

        shadow.set_range(&mut table, 100, 10, SVal::NoAccess);
        assert_eq!(table.rc(rmin), 0, "all per-byte references released");
    }

    #[test]
    fn set_range_spanning_lines_and_segments() {
        let mut shadow = ShadowMemory::new();
        let mut table = VtsTable::new();
        let sv = clean(&mut table, 2, 3);

        // Straddles the boundary between segment 0 and segment 1.
        let start = SEGMENT_BYTES - 16;
        shadow.set_range(&mut table, start, 32, sv);
        assert_eq!(shadow.read_sval(start), sv);
        assert_eq!(shadow.read_sval(start + 31), sv);
        assert_eq!(shadow.read_sval(start + 32), SVal::NoAccess);
        shadow.flush_cache();
        assert_eq!(shadow.stats().segments, 2);
    }

    #[test]
    fn copy_range_moves_values_and_counts() {
        let mut shadow = ShadowMemory::new();
        let mut table = VtsTable::new();
        let sv = clean(&mut table, 1, 1);
        let SVal::Clean { rmin, .. } = sv else {
            unreachable!()
        };

        shadow.set_range(&mut table, 64, 8, sv);
        shadow.copy_range(&mut table, 64, 200, 8);
        assert_eq!(shadow.read_sval(200), sv);
        assert_eq!(shadow.read_sval(207), sv);
        assert_eq!(table.rc(rmin), 32, "16 bytes hold the handle twice each");
    }

    #[test]
    fn copy_range_overlapping_forward() {
        let mut shadow = ShadowMemory::new();
        let mut table = VtsTable::new();
        let a = clean(&mut table, 1, 1);
        let b = clean(&mut table, 2, 1);

        shadow.set_range(&mut table, 0, 4, a);
        shadow.set_range(&mut table, 4, 4, b);
        // Copy [0,8) onto [4,12): overlap; snapshot semantics required.
        shadow.copy_range(&mut table, 0, 4, 8);
        assert_eq!(shadow.read_sval(4), a);
        assert_eq!(shadow.read_sval(7), a);
        assert_eq!(shadow.read_sval(8), b);
        assert_eq!(shadow.read_sval(11), b);
    }

    #[test]
    fn aligned_line_copy_shares_pool_slots() {
        let mut shadow = ShadowMemory::new();
        let mut table = VtsTable::new();

        // Build a line with 5 distinct values so it spills to the pool.
        for i in 0..5 {
            let sv = clean(&mut table, i + 1, 1);
            shadow.set_range(&mut table, u64::from(i), 1, sv);
        }
        shadow.flush_cache();
        assert_eq!(shadow.stats().full_lines, 1);

        shadow.copy_range(&mut table, 0, 4096, 32);
        assert_eq!(
            shadow.stats().full_lines,
            1,
            "aligned copy shares the pooled line"
        );
        assert_eq!(shadow.read_sval(4096), shadow.read_sval(0));

        // Diverging the copy clones it out of the shared slot.
        let sv = clean(&mut table, 9, 1);
        shadow.set_range(&mut table, 4096, 1, sv);
        shadow.flush_cache();
        assert_eq!(shadow.stats().full_lines, 2);
        assert_ne!(shadow.read_sval(4096), shadow.read_sval(0));
    }

    #[test]
    fn occurrence_walk_matches_refcounts() {
        let mut shadow = ShadowMemory::new();
        let mut table = VtsTable::new();
        let sv = clean(&mut table, 3, 2);
        let SVal::Clean { rmin, .. } = sv else {
            unreachable!()
        };

        shadow.set_range(&mut table, 10, 5, sv);
        let mut count = 0_u32;
        shadow.for_each_id_occurrence(|id| {
            if id == rmin {
                count += 1;
            }
        });
        assert_eq!(count, table.rc(rmin), "walk agrees with eager counts");
    }

    #[test]
    fn scavenge_after_clearing_range() {
        let mut shadow = ShadowMemory::new();
        let mut table = VtsTable::new();
        let sv = clean(&mut table, 1, 1);

        shadow.set_range(&mut table, 0, 64, sv);
        shadow.flush_cache();
        assert_eq!(shadow.stats().segments, 1);

        shadow.set_range(&mut table, 0, 64, SVal::NoAccess);
        assert_eq!(shadow.scavenge(), 1);
        assert_eq!(shadow.stats().segments, 0);
    }
}
