//! Working-set cache of decompressed shadow lines.
//!
//! The hot path operates on 32-entry arrays of explicit shadow values. The
//! cache holds the most recently touched lines in that form, fully
//! associative with LRU eviction; eviction recompresses and writes the line
//! back into its segment. While a line is resident here, the cached copy is
//! the authoritative value: anything inspecting stored Z/F forms must
//! [`LineCache::flush`] first.

use hazeline_types::SVal;

use crate::line::{CompressedLine, FLineArena, LineZ, LINE_BYTES};
use crate::segment::SegmentMap;

/// Resident lines.
const CACHE_LINES: usize = 64;

struct Entry {
    /// Line base address (32-byte aligned).
    tag: u64,
    vals: [SVal; LINE_BYTES],
    dirty: bool,
    last_used: u64,
}

/// The cache.
pub struct LineCache {
    entries: Vec<Entry>,
    tick: u64,
    fills: u64,
    writebacks: u64,
    hits: u64,
}

impl LineCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(CACHE_LINES),
            tick: 0,
            fills: 0,
            writebacks: 0,
            hits: 0,
        }
    }

    /// Mutable access to the decompressed line containing `line_base`
    /// (must be 32-byte aligned), filling from the segment map on a miss
    /// and evicting the least recently used resident line if full.
    ///
    /// The entry is marked dirty: callers on this path overwhelmingly write.
    pub fn line_mut(
        &mut self,
        line_base: u64,
        map: &mut SegmentMap,
        arena: &mut FLineArena,
    ) -> &mut [SVal; LINE_BYTES] {
        debug_assert_eq!(line_base % LINE_BYTES as u64, 0, "unaligned line base");
        self.tick += 1;
        let tick = self.tick;

        if let Some(pos) = self.entries.iter().position(|e| e.tag == line_base) {
            self.hits += 1;
            let e = &mut self.entries[pos];
            e.last_used = tick;
            e.dirty = true;
            return &mut self.entries[pos].vals;
        }

        if self.entries.len() == CACHE_LINES {
            let lru = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i)
                .expect("cache is non-empty");
            let victim = self.entries.swap_remove(lru);
            self.write_back(&victim, map, arena);
        }

        let mut vals = [SVal::NoAccess; LINE_BYTES];
        if let Some(seg) = map.get(SegmentMap::key_of(line_base)) {
            seg.line(SegmentMap::line_index_of(line_base))
                .decompress(arena, &mut vals);
        }
        self.fills += 1;
        self.entries.push(Entry {
            tag: line_base,
            vals,
            dirty: true,
            last_used: tick,
        });
        let last = self.entries.len() - 1;
        &mut self.entries[last].vals
    }

    /// Write back every dirty line and drop all residency. After this, the
    /// stored Z/F forms are authoritative and may be inspected or rewritten
    /// directly.
    pub fn flush(&mut self, map: &mut SegmentMap, arena: &mut FLineArena) {
        let entries = std::mem::take(&mut self.entries);
        for e in &entries {
            if e.dirty {
                self.write_back(e, map, arena);
            }
        }
    }

    /// `(fills, writebacks, hits)` since construction.
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.fills, self.writebacks, self.hits)
    }

    fn write_back(&mut self, e: &Entry, map: &mut SegmentMap, arena: &mut FLineArena) {
        let all_noaccess = e.vals.iter().all(|v| !v.is_tracked());
        let key = SegmentMap::key_of(e.tag);
        if all_noaccess && map.get(key).is_none() {
            // Nothing tracked and no segment to clear: skip allocation.
            return;
        }
        self.writebacks += 1;
        let seg = map.get_or_alloc(key);
        let line = seg.line_mut(SegmentMap::line_index_of(e.tag));
        if let CompressedLine::F(idx) = *line {
            arena.rcdec(idx);
        }
        *line = match LineZ::compress(&e.vals) {
            Some(z) => CompressedLine::Z(z),
            None => CompressedLine::F(arena.alloc(e.vals)),
        };
    }
}

impl Default for LineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineCache")
            .field("resident", &self.entries.len())
            .field("fills", &self.fills)
            .field("writebacks", &self.writebacks)
            .field("hits", &self.hits)
            .finish_non_exhaustive()
    }
}
