//! Conflict-history cache: the "other stack" in a race report.
//!
//! Two layers:
//! - [`RcecTable`]: interned, reference-counted call-stack fingerprints,
//!   deduplicated by structural hash so all accesses from one site share a
//!   single entry.
//! - [`ConflictCache`]: per-address records of recent accesses, keyed by
//!   `(address, thread, kind)`, hash-indexed by address and chained on a
//!   global LRU list bounded by the configured capacity. Evicting the tail
//!   releases its fingerprint reference.

use std::collections::HashMap;

use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

use hazeline_types::{AccessKind, IdentityBuildHasher, LockSetId, RcecId, ThrId};

/// Frames captured per stack fingerprint.
pub const STACK_DEPTH: usize = 8;

/// Largest single access width; bounds the lookback window when scanning
/// record start addresses for overlap.
const MAX_ACCESS_BYTES: u64 = 8;

const NIL: u32 = u32::MAX;

/// A fixed-depth call-stack fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StackFingerprint {
    /// Program-counter words, outermost first, zero-padded.
    pub frames: [u64; STACK_DEPTH],
}

impl StackFingerprint {
    /// The all-zero fingerprint (no stack available).
    pub const EMPTY: Self = Self {
        frames: [0; STACK_DEPTH],
    };

    /// Structural hash for interning.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut h = Xxh3::new();
        for f in &self.frames {
            h.update(&f.to_le_bytes());
        }
        h.digest()
    }
}

/// External collaborator that can produce call stacks and lock-set
/// snapshots for the currently running thread.
pub trait StackSource {
    /// Capture the thread's current call stack.
    fn capture(&mut self, thr: ThrId) -> StackFingerprint;

    /// Snapshot of the lock set the thread currently holds.
    fn current_locks(&mut self, thr: ThrId) -> LockSetId;
}

// ---------------------------------------------------------------------------
// RcecTable
// ---------------------------------------------------------------------------

struct RcecSlot {
    fp: StackFingerprint,
    hash: u64,
    rc: u32,
}

/// Interning table for stack fingerprints.
pub struct RcecTable {
    slots: Vec<Option<RcecSlot>>,
    free: Vec<u32>,
    buckets: HashMap<u64, SmallVec<[u32; 2]>>,
    live: usize,
}

impl RcecTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: HashMap::new(),
            live: 0,
        }
    }

    /// Intern `fp`, returning a handle carrying one new reference.
    pub fn intern(&mut self, fp: &StackFingerprint) -> RcecId {
        let hash = fp.content_hash();
        if let Some(bucket) = self.buckets.get(&hash) {
            for &idx in bucket {
                let slot = self.slots[idx as usize]
                    .as_mut()
                    .expect("bucket entry points at a free slot");
                if slot.fp == *fp {
                    slot.rc += 1;
                    return RcecId::from_raw(idx);
                }
            }
        }
        let idx = if let Some(idx) = self.free.pop() {
            idx
        } else {
            let idx = u32::try_from(self.slots.len()).expect("RCEC table index overflow");
            self.slots.push(None);
            idx
        };
        self.slots[idx as usize] = Some(RcecSlot {
            fp: *fp,
            hash,
            rc: 1,
        });
        self.buckets.entry(hash).or_default().push(idx);
        self.live += 1;
        RcecId::from_raw(idx)
    }

    /// Drop one reference; frees the slot at zero.
    pub fn rcdec(&mut self, id: RcecId) {
        let idx = id.raw() as usize;
        let slot = self.slots[idx].as_mut().expect("rcdec on freed RcecId");
        assert!(slot.rc > 0, "RcecTable::rcdec below zero");
        slot.rc -= 1;
        if slot.rc == 0 {
            let hash = slot.hash;
            self.slots[idx] = None;
            let bucket = self.buckets.get_mut(&hash).expect("hash missing bucket");
            let pos = bucket
                .iter()
                .position(|&i| i == id.raw())
                .expect("slot missing from bucket");
            bucket.swap_remove(pos);
            if bucket.is_empty() {
                self.buckets.remove(&hash);
            }
            self.free.push(id.raw());
            self.live -= 1;
        }
    }

    /// Resolve a handle.
    #[must_use]
    pub fn get(&self, id: RcecId) -> &StackFingerprint {
        &self.slots[id.raw() as usize]
            .as_ref()
            .expect("RcecId refers to a freed slot")
            .fp
    }

    /// Number of live fingerprints.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }
}

impl Default for RcecTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ConflictCache
// ---------------------------------------------------------------------------

/// A resolved historical access, returned from lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ConflictRecord {
    /// The thread that performed the access.
    pub thr: ThrId,
    /// Read or write.
    pub kind: AccessKind,
    /// Start address of the access.
    pub addr: u64,
    /// Width in bytes.
    pub size: u8,
    /// Lock-set snapshot at access time.
    pub locks: LockSetId,
    /// The captured call stack.
    pub stack: StackFingerprint,
}

struct OldRef {
    addr: u64,
    size: u8,
    thr: ThrId,
    kind: AccessKind,
    locks: LockSetId,
    rcec: RcecId,
    /// Recency stamp; larger is newer.
    stamp: u64,
    prev: u32,
    next: u32,
}

/// Bounded cache of recent accesses for race diagnostics.
pub struct ConflictCache {
    rcecs: RcecTable,
    records: Vec<Option<OldRef>>,
    free: Vec<u32>,
    by_addr: HashMap<u64, SmallVec<[u32; 2]>, IdentityBuildHasher>,
    head: u32,
    tail: u32,
    len: usize,
    capacity: usize,
    stamp: u64,
    binds: u64,
    evictions: u64,
}

impl ConflictCache {
    /// Create a cache bounded to `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rcecs: RcecTable::new(),
            records: Vec::new(),
            free: Vec::new(),
            by_addr: HashMap::with_hasher(IdentityBuildHasher::default()),
            head: NIL,
            tail: NIL,
            len: 0,
            capacity: capacity.max(1),
            stamp: 0,
            binds: 0,
            evictions: 0,
        }
    }

    /// Record an access: intern the stack, then insert or refresh the
    /// `(addr, thr, kind)` record at the LRU head. Evicts the tail past
    /// capacity.
    pub fn bind(
        &mut self,
        addr: u64,
        size: u8,
        kind: AccessKind,
        thr: ThrId,
        locks: LockSetId,
        stack: &StackFingerprint,
    ) {
        self.binds += 1;
        self.stamp += 1;
        let rcec = self.rcecs.intern(stack);

        if let Some(bucket) = self.by_addr.get(&addr) {
            if let Some(&idx) = bucket.iter().find(|&&i| {
                let r = self.records[i as usize].as_ref().expect("bucket points at live record");
                r.thr == thr && r.kind == kind
            }) {
                let old_rcec = {
                    let r = self.records[idx as usize].as_mut().expect("live record");
                    let old = r.rcec;
                    r.rcec = rcec;
                    r.size = size;
                    r.locks = locks;
                    r.stamp = self.stamp;
                    old
                };
                self.rcecs.rcdec(old_rcec);
                self.unlink(idx);
                self.push_head(idx);
                return;
            }
        }

        let idx = if let Some(idx) = self.free.pop() {
            idx
        } else {
            let idx = u32::try_from(self.records.len()).expect("conflict cache index overflow");
            self.records.push(None);
            idx
        };
        self.records[idx as usize] = Some(OldRef {
            addr,
            size,
            thr,
            kind,
            locks,
            rcec,
            stamp: self.stamp,
            prev: NIL,
            next: NIL,
        });
        self.by_addr.entry(addr).or_default().push(idx);
        self.push_head(idx);
        self.len += 1;

        while self.len > self.capacity {
            self.evict_tail();
        }
    }

    /// The most recent record overlapping `[addr, addr + size)` from a
    /// thread other than `exclude` whose kind conflicts with `kind`.
    #[must_use]
    pub fn lookup(
        &self,
        addr: u64,
        size: u64,
        kind: AccessKind,
        exclude: ThrId,
    ) -> Option<ConflictRecord> {
        let mut best: Option<&OldRef> = None;
        self.scan_overlapping(addr, size, |r| {
            if r.thr != exclude
                && kind.conflicts_with(r.kind)
                && best.map_or(true, |b| r.stamp > b.stamp)
            {
                best = Some(r);
            }
        });
        best.map(|r| self.resolve(r))
    }

    /// Visit every record overlapping `[addr, addr + size)`, most recent
    /// first, regardless of thread or kind.
    pub fn for_each_overlapping(
        &self,
        addr: u64,
        size: u64,
        mut f: impl FnMut(&ConflictRecord),
    ) {
        let mut found: Vec<&OldRef> = Vec::new();
        self.scan_overlapping(addr, size, |r| found.push(r));
        found.sort_by(|a, b| b.stamp.cmp(&a.stamp));
        for r in found {
            f(&self.resolve(r));
        }
    }

    /// Records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live interned fingerprints.
    #[must_use]
    pub fn rcec_live(&self) -> usize {
        self.rcecs.live_count()
    }

    /// `(binds, evictions)` since construction.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.binds, self.evictions)
    }

    fn scan_overlapping<'a>(&'a self, addr: u64, size: u64, mut f: impl FnMut(&'a OldRef)) {
        if size == 0 {
            return;
        }
        let end = addr.saturating_add(size);
        // Records are indexed by start address; a record starting up to
        // MAX_ACCESS_BYTES - 1 below the window can still overlap it.
        let scan_from = addr.saturating_sub(MAX_ACCESS_BYTES - 1);
        for a in scan_from..end {
            let Some(bucket) = self.by_addr.get(&a) else {
                continue;
            };
            for &idx in bucket {
                let r = self.records[idx as usize]
                    .as_ref()
                    .expect("bucket points at live record");
                if r.addr < end && addr < r.addr + u64::from(r.size) {
                    f(r);
                }
            }
        }
    }

    fn resolve(&self, r: &OldRef) -> ConflictRecord {
        ConflictRecord {
            thr: r.thr,
            kind: r.kind,
            addr: r.addr,
            size: r.size,
            locks: r.locks,
            stack: *self.rcecs.get(r.rcec),
        }
    }

    fn push_head(&mut self, idx: u32) {
        {
            let r = self.records[idx as usize].as_mut().expect("live record");
            r.prev = NIL;
            r.next = self.head;
        }
        if self.head != NIL {
            self.records[self.head as usize]
                .as_mut()
                .expect("head is live")
                .prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let r = self.records[idx as usize].as_ref().expect("live record");
            (r.prev, r.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.records[prev as usize].as_mut().expect("live record").next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.records[next as usize].as_mut().expect("live record").prev = prev;
        }
    }

    fn evict_tail(&mut self) {
        let idx = self.tail;
        assert_ne!(idx, NIL, "evict on empty cache");
        self.unlink(idx);
        let r = self.records[idx as usize].take().expect("tail is live");
        let bucket = self
            .by_addr
            .get_mut(&r.addr)
            .expect("record address missing bucket");
        let pos = bucket
            .iter()
            .position(|&i| i == idx)
            .expect("record missing from bucket");
        bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.by_addr.remove(&r.addr);
        }
        self.rcecs.rcdec(r.rcec);
        self.free.push(idx);
        self.len -= 1;
        self.evictions += 1;
    }
}

impl std::fmt::Debug for ConflictCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictCache")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("rcec_live", &self.rcecs.live_count())
            .field("binds", &self.binds)
            .field("evictions", &self.evictions)
            .finish_non_exhaustive()
    }
}
