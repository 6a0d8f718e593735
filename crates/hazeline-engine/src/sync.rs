//! Synchronization objects.
//!
//! An SO is a detachable pair of vector-timestamp handles that carries a
//! happens-before edge across any synchronization primitive: the external
//! glue maps mutexes, condvars, semaphores and barriers onto `send`/`recv`
//! against these objects. The send/recv semantics live on the engine facade;
//! this module is the arena.

use hazeline_types::{SoId, VtsId};

/// The clock pair an SO carries once something has been sent through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoClocks {
    /// Read-clock payload, joined into receivers' read clocks.
    pub vi_r: VtsId,
    /// Write-clock payload, joined into receivers' write clocks on strong
    /// receives only.
    pub vi_w: VtsId,
}

/// A synchronization object. `clocks` stays `None` until the first send;
/// receiving from a never-sent object creates no ordering.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncObj {
    /// The carried clock pair, unset until the first send.
    pub clocks: Option<SoClocks>,
}

/// Arena of synchronization objects with a free list.
pub struct SoArena {
    slots: Vec<Option<SyncObj>>,
    free: Vec<u32>,
    allocated_total: u64,
}

impl SoArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            allocated_total: 0,
        }
    }

    /// Allocate a fresh, never-sent object.
    pub fn alloc(&mut self) -> SoId {
        self.allocated_total += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(SyncObj::default());
            return SoId::from_raw(idx);
        }
        let idx = u32::try_from(self.slots.len()).expect("SO arena index overflow");
        self.slots.push(Some(SyncObj::default()));
        SoId::from_raw(idx)
    }

    /// Free an object, returning its final state so the caller can release
    /// clock references. Freeing an unknown handle returns `None`.
    pub fn dealloc(&mut self, so: SoId) -> Option<SyncObj> {
        let slot = self.slots.get_mut(so.raw() as usize)?;
        let obj = slot.take()?;
        self.free.push(so.raw());
        Some(obj)
    }

    /// Look up an object.
    #[must_use]
    pub fn get(&self, so: SoId) -> Option<&SyncObj> {
        self.slots.get(so.raw() as usize)?.as_ref()
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, so: SoId) -> Option<&mut SyncObj> {
        self.slots.get_mut(so.raw() as usize)?.as_mut()
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Visit every live object.
    pub fn for_each(&self, mut f: impl FnMut(SoId, &SyncObj)) {
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(obj) = slot {
                #[allow(clippy::cast_possible_truncation)]
                f(SoId::from_raw(idx as u32), obj);
            }
        }
    }

    /// Visit every live object mutably.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(SoId, &mut SyncObj)) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(obj) = slot {
                #[allow(clippy::cast_possible_truncation)]
                f(SoId::from_raw(idx as u32), obj);
            }
        }
    }
}

impl Default for SoArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoArena")
            .field("live", &self.live_count())
            .field("allocated_total", &self.allocated_total)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_recycles_slots() {
        let mut arena = SoArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        assert_ne!(a, b);
        assert_eq!(arena.live_count(), 2);

        let obj = arena.dealloc(a).expect("live object frees");
        assert!(obj.clocks.is_none());
        assert_eq!(arena.live_count(), 1);
        assert!(arena.dealloc(a).is_none(), "double free is caught");

        let c = arena.alloc();
        assert_eq!(c.raw(), a.raw(), "freed slot recycled");
    }

    #[test]
    fn fresh_objects_are_never_sent() {
        let mut arena = SoArena::new();
        let so = arena.alloc();
        assert!(arena.get(so).unwrap().clocks.is_none());
    }
}
