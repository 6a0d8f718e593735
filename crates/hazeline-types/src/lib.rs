//! Foundation types for the Hazeline happens-before engine.
//!
//! Small, copyable handle newtypes and the shadow-value representation shared
//! by every other crate in the workspace. Algorithms live elsewhere; this
//! crate only defines the vocabulary.

pub mod pack;

pub use pack::{ScalarPair, MAX_CLOCK, MAX_THREADS};

use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};

// ---------------------------------------------------------------------------
// ThrId
// ---------------------------------------------------------------------------

/// Dense thread identifier, assigned once per guest thread for its lifetime.
///
/// Identifiers are handed out monotonically starting at 0 (the root thread)
/// and are never reused. The space is bounded by [`MAX_THREADS`]; exhausting
/// it is a fatal, reported condition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ThrId(u32);

impl ThrId {
    /// The root thread, alive from engine construction.
    pub const ROOT: Self = Self(0);

    /// Create a thread id from a raw index.
    ///
    /// Returns `None` if `raw` is outside the representable range.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw < MAX_THREADS {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Get the raw index.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The raw index as a `usize`, for dense table indexing.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// VtsId / SoId / RcecId / LockSetId
// ---------------------------------------------------------------------------

/// Interned handle to a vector timestamp.
///
/// Equal timestamp content always maps to the same handle, so handle equality
/// is value equality. Handles are only valid against the table that issued
/// them and may be remapped wholesale by a pruning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct VtsId(u32);

impl VtsId {
    /// Wrap a raw slot index.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw slot index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The raw slot index as a `usize`.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VtsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vts:{}", self.0)
    }
}

/// Handle to a synchronization object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct SoId(u32);

impl SoId {
    /// Wrap a raw slot index.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw slot index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "so:{}", self.0)
    }
}

/// Handle to an interned call-stack fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct RcecId(u32);

impl RcecId {
    /// Wrap a raw slot index.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw slot index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Opaque snapshot of the lock set a thread held at access time.
///
/// The engine never interprets this value; it is captured from the external
/// synchronization glue and replayed verbatim in diagnostics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct LockSetId(pub u32);

// ---------------------------------------------------------------------------
// AccessKind
// ---------------------------------------------------------------------------

/// Kind of a monitored memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AccessKind {
    /// A load.
    Read,
    /// A store.
    Write,
}

impl AccessKind {
    /// Whether this access is a store.
    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }

    /// Whether two accesses of these kinds can race. Two reads never conflict.
    #[inline]
    #[must_use]
    pub const fn conflicts_with(self, other: Self) -> bool {
        self.is_write() || other.is_write()
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

// ---------------------------------------------------------------------------
// SVal: per-byte shadow value
// ---------------------------------------------------------------------------

/// Shadow value for one byte of guest memory.
///
/// `Clean` carries the minimum vector timestamps a later read (`rmin`) or
/// write (`wmin`) must dominate to be race-free. Invariant on race-free
/// histories: `rmin ⊑ wmin` componentwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SVal {
    /// Untracked memory. Accesses are never flagged.
    NoAccess,
    /// Tracked memory with read/write ordering constraints.
    Clean {
        /// Minimum clock a racing-free read must dominate.
        rmin: VtsId,
        /// Minimum clock a racing-free write must dominate.
        wmin: VtsId,
    },
}

impl SVal {
    /// Whether this byte is tracked at all.
    #[inline]
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        matches!(self, Self::Clean { .. })
    }

    /// Visit the vector-timestamp handles held by this value.
    #[inline]
    pub fn for_each_id(self, mut f: impl FnMut(VtsId)) {
        if let Self::Clean { rmin, wmin } = self {
            f(rmin);
            f(wmin);
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How aggressively the vector-timestamp table prunes components of fully
/// retired threads during garbage collection.
///
/// Pruning trades CPU (a full rewrite and re-dedup of every live timestamp)
/// for long-run memory stability. The exact thresholds are tuning knobs, not
/// pinned behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PrunePolicy {
    /// Never prune; retired components persist until their timestamps die.
    Never,
    /// Prune when retired threads exist and the table has grown past twice
    /// its post-GC floor.
    Auto,
    /// Prune on every GC pass that has retired threads available.
    Always,
}

/// How much conflict history the engine retains for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HistoryLevel {
    /// No second-stack diagnostics at all.
    None,
    /// Per-thread bounded local clock/stack sample log only.
    Approx,
    /// Full conflict-history cache (per-address LRU of prior accesses).
    Full,
}

/// Engine construction-time configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Capacity of the conflict-history LRU (number of old-access records).
    pub conflict_cache_capacity: usize,
    /// Conflict-history fidelity.
    pub history_level: HistoryLevel,
    /// Pruning aggressiveness for the timestamp table.
    pub prune_policy: PrunePolicy,
    /// Never garbage-collect the timestamp table below this live count.
    pub vts_gc_min_live: usize,
    /// Garbage-collect once the live count exceeds this factor times the
    /// live count recorded at the end of the previous pass.
    pub vts_gc_growth_factor: f64,
    /// Enable the per-thread access filter. Disabling it forces every access
    /// through the state machine; race verdicts must be identical either way.
    pub enable_filter: bool,
    /// Bound on the per-thread local clock sample log (`HistoryLevel::Approx`).
    pub local_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_cache_capacity: 1_000_000,
            history_level: HistoryLevel::Full,
            prune_policy: PrunePolicy::Auto,
            vts_gc_min_live: 1024,
            vts_gc_growth_factor: 2.0,
            enable_filter: true,
            local_log_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity hashers for dense integer keys
// ---------------------------------------------------------------------------

/// Fast identity hasher for keys that are already well-distributed integers
/// (segment base addresses, conflict-record addresses). Skips mixing and uses
/// the raw value directly.
#[derive(Default)]
pub struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn write(&mut self, _: &[u8]) {
        // Key types used with this hasher hash via write_u32/write_u64.
        debug_assert!(false, "IdentityHasher only supports integer keys");
    }

    fn write_u32(&mut self, n: u32) {
        self.0 = u64::from(n);
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// `BuildHasher` for [`IdentityHasher`].
pub type IdentityBuildHasher = BuildHasherDefault<IdentityHasher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thr_id_bounds() {
        assert_eq!(ThrId::new(0), Some(ThrId::ROOT));
        assert!(ThrId::new(MAX_THREADS - 1).is_some());
        assert!(ThrId::new(MAX_THREADS).is_none());
    }

    #[test]
    fn thr_id_display() {
        let t = ThrId::new(7).unwrap();
        assert_eq!(t.to_string(), "#7");
    }

    #[test]
    fn access_kind_conflicts() {
        use AccessKind::{Read, Write};
        assert!(!Read.conflicts_with(Read));
        assert!(Read.conflicts_with(Write));
        assert!(Write.conflicts_with(Read));
        assert!(Write.conflicts_with(Write));
    }

    #[test]
    fn sval_id_visitation() {
        let mut seen = Vec::new();
        SVal::NoAccess.for_each_id(|id| seen.push(id));
        assert!(seen.is_empty());

        let sv = SVal::Clean {
            rmin: VtsId::from_raw(3),
            wmin: VtsId::from_raw(9),
        };
        sv.for_each_id(|id| seen.push(id));
        assert_eq!(seen, vec![VtsId::from_raw(3), VtsId::from_raw(9)]);
    }

    #[test]
    fn config_default_is_full_history() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.history_level, HistoryLevel::Full);
        assert!(cfg.enable_filter);
        assert!(cfg.vts_gc_growth_factor > 1.0);
    }
}
