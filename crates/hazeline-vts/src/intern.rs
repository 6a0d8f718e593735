//! Interning table for vector timestamps.
//!
//! Every distinct timestamp value is stored once and addressed by a
//! [`VtsId`]; equal content always yields the same handle, so handle
//! equality is value equality. Slots carry an explicit reference count
//! maintained eagerly by every storage location (shadow values, thread
//! clocks, synchronization objects). A count reaching zero does not free the
//! slot; reclamation happens only in batch [`VtsTable::gc`] passes, and
//! components of fully retired threads are dropped by [`VtsTable::prune`],
//! which re-dedups and hands the caller a handle remap.

use std::collections::HashMap;

use smallvec::SmallVec;

use hazeline_error::{HazelineError, Result};
use hazeline_types::{ThrId, VtsId};

use crate::cmp_cache::CmpCache;
use crate::vts::VectorTimestamp;

/// Hard limit on live interned timestamps.
pub const MAX_VTS_IDS: u32 = 1 << 26;

struct Slot {
    vts: VectorTimestamp,
    hash: u64,
    rc: u32,
}

/// The interning table.
pub struct VtsTable {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Content hash → slot indices with that hash.
    buckets: HashMap<u64, SmallVec<[u32; 2]>>,
    live: usize,
    /// Live count at the end of the last GC pass; growth is measured
    /// against this floor.
    floor: usize,
    interned_total: u64,
    swept_total: u64,
}

/// Outcome of one [`VtsTable::gc`] sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSweep {
    /// Slots reclaimed this pass.
    pub swept: usize,
    /// Live slots remaining.
    pub live: usize,
}

/// Outcome of one [`VtsTable::prune`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Live slots before pruning.
    pub before: usize,
    /// Live slots after re-dedup.
    pub after: usize,
    /// Retired threads whose components were dropped.
    pub threads_dropped: usize,
}

/// Old-handle → new-handle map produced by pruning.
///
/// Every handle that was live at prune time has an entry; looking up any
/// other handle is an engine bug.
pub struct VtsRemap {
    map: Vec<Option<VtsId>>,
}

impl VtsRemap {
    /// Translate a pre-prune handle.
    #[must_use]
    pub fn lookup(&self, old: VtsId) -> VtsId {
        self.map
            .get(old.index())
            .copied()
            .flatten()
            .expect("stale VtsId survived pruning")
    }
}

impl VtsTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: HashMap::new(),
            live: 0,
            floor: 0,
            interned_total: 0,
            swept_total: 0,
        }
    }

    /// Intern `vts`, returning the existing handle for equal content or a
    /// fresh slot otherwise.
    ///
    /// The returned handle has an unchanged reference count; the caller must
    /// `rcinc` it for every location it stores the handle in.
    pub fn intern_or_reuse(&mut self, vts: &VectorTimestamp) -> Result<VtsId> {
        let hash = vts.content_hash();
        if let Some(bucket) = self.buckets.get(&hash) {
            for &idx in bucket {
                let slot = self.slots[idx as usize]
                    .as_ref()
                    .expect("bucket entry points at a free slot");
                if slot.vts == *vts {
                    return Ok(VtsId::from_raw(idx));
                }
            }
        }

        let idx = if let Some(idx) = self.free.pop() {
            idx
        } else {
            let idx = u32::try_from(self.slots.len())
                .ok()
                .filter(|&i| i < MAX_VTS_IDS)
                .ok_or(HazelineError::VtsTableExhausted { limit: MAX_VTS_IDS })?;
            self.slots.push(None);
            idx
        };

        self.slots[idx as usize] = Some(Slot {
            vts: vts.clone(),
            hash,
            rc: 0,
        });
        self.buckets.entry(hash).or_default().push(idx);
        self.live += 1;
        self.interned_total += 1;
        Ok(VtsId::from_raw(idx))
    }

    /// Resolve a handle to its timestamp.
    ///
    /// # Panics
    ///
    /// Panics on a freed handle; holding one is an engine bug.
    #[must_use]
    pub fn get(&self, id: VtsId) -> &VectorTimestamp {
        self.slots[id.index()]
            .as_ref()
            .map(|s| &s.vts)
            .expect("VtsId refers to a freed slot")
    }

    /// Increment a handle's reference count.
    pub fn rcinc(&mut self, id: VtsId) {
        let slot = self.slots[id.index()]
            .as_mut()
            .expect("rcinc on freed VtsId");
        slot.rc += 1;
    }

    /// Decrement a handle's reference count. The slot is not freed here even
    /// at zero; only [`Self::gc`] reclaims.
    pub fn rcdec(&mut self, id: VtsId) {
        let slot = self.slots[id.index()]
            .as_mut()
            .expect("rcdec on freed VtsId");
        assert!(slot.rc > 0, "rcdec below zero on {id}");
        slot.rc -= 1;
    }

    /// Current reference count of a handle (test and invariant-check aid).
    #[must_use]
    pub fn rc(&self, id: VtsId) -> u32 {
        self.slots[id.index()].as_ref().map_or(0, |s| s.rc)
    }

    /// Number of live slots.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Total interned since construction (including swept).
    #[must_use]
    pub fn interned_total(&self) -> u64 {
        self.interned_total
    }

    /// Total swept since construction.
    #[must_use]
    pub fn swept_total(&self) -> u64 {
        self.swept_total
    }

    /// Whether the table has grown enough since the last GC to warrant a
    /// pass. `min_live` suppresses GC on small tables; `growth_factor`
    /// scales the post-GC floor.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn should_gc(&self, min_live: usize, growth_factor: f64) -> bool {
        if self.live < min_live {
            return false;
        }
        let threshold = (self.floor.max(min_live) as f64) * growth_factor;
        self.live as f64 > threshold
    }

    /// Sweep every slot whose reference count is zero.
    ///
    /// The caller must first flush any cache holding decompressed shadow
    /// state (so that all stored handles are counted) and must invalidate
    /// comparison memos afterwards.
    pub fn gc(&mut self) -> GcSweep {
        let mut swept = 0_usize;
        for idx in 0..self.slots.len() {
            let reclaim = matches!(&self.slots[idx], Some(s) if s.rc == 0);
            if reclaim {
                let slot = self.slots[idx].take().expect("checked above");
                Self::bucket_remove(&mut self.buckets, slot.hash, idx as u32);
                self.free.push(idx as u32);
                swept += 1;
            }
        }
        self.live -= swept;
        self.swept_total += swept as u64;
        self.floor = self.live;
        tracing::debug!(swept, live = self.live, "vts gc sweep complete");
        GcSweep {
            swept,
            live: self.live,
        }
    }

    /// Rewrite every live timestamp to drop components of the given fully
    /// retired threads, re-dedup, and return the handle remap.
    ///
    /// `dead` must be sorted ascending. Safe because a retired thread can
    /// never again be the subject of an ordering query. The caller must
    /// rewrite every stored handle through the remap and invalidate
    /// comparison memos.
    pub fn prune(&mut self, dead: &[ThrId]) -> Result<(PruneOutcome, VtsRemap)> {
        let before = self.live;
        let mut fresh = VtsTable::new();
        let mut map: Vec<Option<VtsId>> = vec![None; self.slots.len()];

        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let pruned = slot.vts.without_threads(dead);
            let new_id = fresh.intern_or_reuse(&pruned)?;
            // Reference counts transfer; collapsing slots sum theirs.
            let fresh_slot = fresh.slots[new_id.index()]
                .as_mut()
                .expect("just interned");
            fresh_slot.rc += slot.rc;
            map[idx] = Some(new_id);
        }

        fresh.floor = fresh.live;
        fresh.interned_total = self.interned_total;
        fresh.swept_total = self.swept_total;
        let outcome = PruneOutcome {
            before,
            after: fresh.live,
            threads_dropped: dead.len(),
        };
        tracing::info!(
            before,
            after = fresh.live,
            threads_dropped = dead.len(),
            "vts prune complete"
        );
        *self = fresh;
        Ok((outcome, VtsRemap { map }))
    }

    /// Visit every live handle and its reference count (invariant checks).
    pub fn for_each_live(&self, mut f: impl FnMut(VtsId, u32)) {
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(s) = slot {
                f(VtsId::from_raw(idx as u32), s.rc);
            }
        }
    }

    fn bucket_remove(
        buckets: &mut HashMap<u64, SmallVec<[u32; 2]>>,
        hash: u64,
        idx: u32,
    ) {
        let bucket = buckets.get_mut(&hash).expect("slot hash missing bucket");
        let pos = bucket
            .iter()
            .position(|&i| i == idx)
            .expect("slot missing from its bucket");
        bucket.swap_remove(pos);
        if bucket.is_empty() {
            buckets.remove(&hash);
        }
    }
}

impl Default for VtsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VtsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtsTable")
            .field("live", &self.live)
            .field("floor", &self.floor)
            .field("interned_total", &self.interned_total)
            .field("swept_total", &self.swept_total)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handle-level operations (table + memo cache)
// ---------------------------------------------------------------------------

/// `a ⊑ b` over handles, memoized.
pub fn id_leq(table: &VtsTable, cache: &mut CmpCache, a: VtsId, b: VtsId) -> bool {
    if a == b {
        return true;
    }
    if let Some(hit) = cache.probe_leq(a, b) {
        return hit;
    }
    let result = table.get(a).leq(table.get(b));
    cache.insert_leq(a, b, result);
    result
}

/// `join(a, b)` over handles, memoized. The result handle is interned but
/// not reference-counted; the caller incs when storing.
pub fn id_join(
    table: &mut VtsTable,
    cache: &mut CmpCache,
    a: VtsId,
    b: VtsId,
) -> Result<VtsId> {
    if a == b {
        return Ok(a);
    }
    if let Some(hit) = cache.probe_join(a, b) {
        return Ok(hit);
    }
    let joined = table.get(a).join(table.get(b));
    let result = table.intern_or_reuse(&joined)?;
    cache.insert_join(a, b, result);
    Ok(result)
}

/// Tick `id`'s component for `thr`, returning the interned successor handle
/// (not reference-counted).
pub fn id_tick(table: &mut VtsTable, id: VtsId, thr: ThrId) -> Result<VtsId> {
    let ticked = table.get(id).tick(thr)?;
    table.intern_or_reuse(&ticked)
}
