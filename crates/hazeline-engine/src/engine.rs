//! The engine facade.
//!
//! [`HbEngine`] owns every table (timestamps, shadow memory, threads,
//! synchronization objects, conflict history) and exposes the entry points
//! the instrumentation harness drives: access events on the hot path,
//! synchronization events, range marking, and periodic garbage collection.
//! The harness serializes guest threads, so the engine takes `&mut self`
//! everywhere and holds no locks.

use std::collections::HashMap;

use hazeline_error::{HazelineError, Result};
use hazeline_shadow::{ShadowMemory, ShadowStats};
use hazeline_types::{
    AccessKind, EngineConfig, HistoryLevel, PrunePolicy, SVal, SoId, ThrId, MAX_THREADS,
};
use hazeline_vts::{id_join, id_tick, CmpCache, PruneOutcome, VectorTimestamp, VtsTable};

use crate::history::{ConflictCache, ConflictRecord, StackSource};
use crate::machine::{self, RaceClocks};
use crate::observe::{RaceEvent, RaceObserver};
use crate::sync::{SoArena, SoClocks};
use crate::thread::{ClockSample, Thr};

/// Retired threads accumulated before an `Auto` prune fires.
const AUTO_PRUNE_MIN_DEAD: usize = 8;

/// Monotonic engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    /// Monitored read accesses.
    pub reads: u64,
    /// Monitored write accesses.
    pub writes: u64,
    /// Accesses skipped by the per-thread filter.
    pub filter_hits: u64,
    /// Races reported.
    pub races: u64,
    /// Synchronization sends.
    pub so_sends: u64,
    /// Synchronization receives (never-sent no-ops included).
    pub so_recvs: u64,
    /// Threads ever created (root included).
    pub threads_created: u64,
    /// Threads fully retired.
    pub threads_retired: u64,
    /// Ranges marked freshly tracked.
    pub ranges_marked_new: u64,
    /// Ranges marked untracked after having been tracked.
    pub ranges_marked_noaccess: u64,
    /// Ranges marked never-tracked.
    pub ranges_marked_untracked: u64,
    /// Shadow range copies.
    pub shadow_copies: u64,
    /// Garbage-collection passes.
    pub gc_passes: u64,
    /// Pruning passes.
    pub prune_passes: u64,
}

/// Outcome of one garbage-collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcOutcome {
    /// Timestamp slots reclaimed.
    pub swept: usize,
    /// Live timestamp slots after the pass.
    pub live_after: usize,
    /// Pruning outcome, when a prune ran.
    pub pruned: Option<PruneOutcome>,
    /// Fully untracked shadow segments released.
    pub segments_scavenged: usize,
}

/// The happens-before race-detection engine.
pub struct HbEngine {
    config: EngineConfig,
    vts: VtsTable,
    cmp: CmpCache,
    shadow: ShadowMemory,
    threads: Vec<Thr>,
    /// Fully retired threads awaiting a pruning pass.
    very_dead: Vec<ThrId>,
    sos: SoArena,
    history: ConflictCache,
    stacks: Box<dyn StackSource>,
    observer: Box<dyn RaceObserver>,
    stats: EngineStats,
}

impl HbEngine {
    /// Create an engine and its root thread.
    pub fn new(
        config: EngineConfig,
        stacks: Box<dyn StackSource>,
        observer: Box<dyn RaceObserver>,
    ) -> Result<(Self, ThrId)> {
        let mut vts = VtsTable::new();
        let root_id = vts.intern_or_reuse(&VectorTimestamp::singleton(ThrId::ROOT, 1))?;
        vts.rcinc(root_id);
        vts.rcinc(root_id);

        let history = ConflictCache::new(config.conflict_cache_capacity);
        let mut engine = Self {
            config,
            vts,
            cmp: CmpCache::new(),
            shadow: ShadowMemory::new(),
            threads: vec![Thr::new(ThrId::ROOT, root_id, root_id)],
            very_dead: Vec::new(),
            sos: SoArena::new(),
            history,
            stacks,
            observer,
            stats: EngineStats::default(),
        };
        engine.stats.threads_created = 1;
        tracing::debug!("engine initialized with root thread");
        Ok((engine, ThrId::ROOT))
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    /// Create a child thread: the parent's clocks tick, the child starts at
    /// scalar 1 on its own axis with a cleared filter. Ordering between
    /// parent and child is established by the caller through a
    /// synchronization object, like any other edge.
    pub fn create_thread(&mut self, parent: ThrId) -> Result<ThrId> {
        self.check_thread(parent)?;
        let child = u32::try_from(self.threads.len())
            .ok()
            .and_then(ThrId::new)
            .ok_or(HazelineError::ThreadIdExhausted {
                limit: MAX_THREADS,
            })?;

        self.tick_clocks(parent)?;

        let init = self
            .vts
            .intern_or_reuse(&VectorTimestamp::singleton(child, 1))?;
        self.vts.rcinc(init);
        self.vts.rcinc(init);
        self.threads.push(Thr::new(child, init, init));
        self.stats.threads_created += 1;
        tracing::debug!(parent = %parent, child = %child, "thread created");
        Ok(child)
    }

    /// Mark a thread as exited. Retirement waits for the join flag too.
    pub fn thread_exited(&mut self, t: ThrId) -> Result<()> {
        self.check_thread(t)?;
        self.threads[t.index()].exited = true;
        tracing::debug!(thr = %t, "thread exited");
        self.try_retire(t);
        Ok(())
    }

    /// Mark a thread as joined-with. Retirement waits for the exit flag too.
    pub fn thread_joined_with(&mut self, t: ThrId) -> Result<()> {
        self.check_thread(t)?;
        self.threads[t.index()].joined = true;
        tracing::debug!(thr = %t, "thread joined with");
        self.try_retire(t);
        Ok(())
    }

    /// The thread resumes running after a scheduler handoff: its filter may
    /// hold validations from a world that changed while it was off-CPU.
    pub fn thread_resumes(&mut self, t: ThrId) -> Result<()> {
        self.check_thread(t)?;
        self.threads[t.index()].filter.clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Memory accesses (hot path)
    // -----------------------------------------------------------------------

    /// A monitored read of `size` bytes at `addr` by thread `t`.
    pub fn on_read(&mut self, t: ThrId, addr: u64, size: u64) -> Result<()> {
        self.on_access(t, addr, size, AccessKind::Read)
    }

    /// A monitored write of `size` bytes at `addr` by thread `t`.
    pub fn on_write(&mut self, t: ThrId, addr: u64, size: u64) -> Result<()> {
        self.on_access(t, addr, size, AccessKind::Write)
    }

    fn on_access(&mut self, t: ThrId, addr: u64, size: u64, kind: AccessKind) -> Result<()> {
        self.check_thread(t)?;
        if size == 0 {
            return Ok(());
        }
        match kind {
            AccessKind::Read => self.stats.reads += 1,
            AccessKind::Write => self.stats.writes += 1,
        }

        if self.config.enable_filter
            && self.threads[t.index()].filter.ok_to_skip(kind, addr, size)
        {
            self.stats.filter_hits += 1;
            return Ok(());
        }

        let (clock_read, clock_write) = {
            let thr = &self.threads[t.index()];
            (thr.clock_read, thr.clock_write)
        };
        let outcome = machine::process_access(
            &mut self.shadow,
            &mut self.vts,
            &mut self.cmp,
            kind,
            clock_read,
            clock_write,
            addr,
            size,
        )?;

        if let Some(clocks) = outcome.race {
            self.report_race(t, addr, size, kind, clocks);
        } else if self.config.enable_filter {
            self.threads[t.index()].filter.note_validated(kind, addr, size);
        }

        if outcome.tracked && matches!(self.config.history_level, HistoryLevel::Full) {
            let stack = self.stacks.capture(t);
            let locks = self.stacks.current_locks(t);
            self.history
                .bind(addr, clamp_width(size), kind, t, locks, &stack);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Range marking
    // -----------------------------------------------------------------------

    /// Reset `[addr, addr + size)` to freshly tracked state owned by `t`'s
    /// current write clock.
    pub fn mark_range_new(&mut self, t: ThrId, addr: u64, size: u64) -> Result<()> {
        self.check_thread(t)?;
        if size == 0 {
            return Ok(());
        }
        let cw = self.threads[t.index()].clock_write;
        let sv = SVal::Clean { rmin: cw, wmin: cw };
        self.shadow.set_range(&mut self.vts, addr, size, sv);
        self.clear_filters_range(addr, size);
        self.stats.ranges_marked_new += 1;
        tracing::trace!(thr = %t, addr, size, "range marked new");
        Ok(())
    }

    /// Stop tracking `[addr, addr + size)` (freed memory).
    pub fn mark_range_noaccess(&mut self, t: ThrId, addr: u64, size: u64) -> Result<()> {
        self.check_thread(t)?;
        if size == 0 {
            return Ok(());
        }
        self.shadow
            .set_range(&mut self.vts, addr, size, SVal::NoAccess);
        self.clear_filters_range(addr, size);
        self.stats.ranges_marked_noaccess += 1;
        tracing::trace!(thr = %t, addr, size, "range marked no-access");
        Ok(())
    }

    /// Declare `[addr, addr + size)` permanently uninteresting (device
    /// mappings, unmonitored allocations). Same shadow state as no-access,
    /// counted separately for reporting.
    pub fn mark_range_untracked(&mut self, t: ThrId, addr: u64, size: u64) -> Result<()> {
        self.check_thread(t)?;
        if size == 0 {
            return Ok(());
        }
        self.shadow
            .set_range(&mut self.vts, addr, size, SVal::NoAccess);
        self.clear_filters_range(addr, size);
        self.stats.ranges_marked_untracked += 1;
        tracing::trace!(thr = %t, addr, size, "range marked untracked");
        Ok(())
    }

    /// Shadow `memmove` from `src` to `dst` (realloc support).
    pub fn copy_shadow(&mut self, t: ThrId, src: u64, dst: u64, size: u64) -> Result<()> {
        self.check_thread(t)?;
        self.shadow.copy_range(&mut self.vts, src, dst, size);
        self.clear_filters_range(dst, size);
        self.stats.shadow_copies += 1;
        tracing::trace!(thr = %t, src, dst, size, "shadow range copied");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Synchronization objects
    // -----------------------------------------------------------------------

    /// Allocate a fresh synchronization object.
    pub fn so_alloc(&mut self) -> SoId {
        self.sos.alloc()
    }

    /// Free a synchronization object, dropping its clock references.
    /// Freeing an unknown handle is a no-op.
    pub fn so_free(&mut self, so: SoId) {
        if let Some(obj) = self.sos.dealloc(so) {
            if let Some(c) = obj.clocks {
                self.vts.rcdec(c.vi_r);
                self.vts.rcdec(c.vi_w);
            }
        }
    }

    /// Send through an SO: seed it with the sender's clocks on first use,
    /// replace (`strong`) or join otherwise, then tick the sender.
    pub fn so_send(&mut self, t: ThrId, so: SoId, strong: bool) -> Result<()> {
        self.check_thread(t)?;
        let cur = self
            .sos
            .get(so)
            .ok_or(HazelineError::UnknownSyncObject { so: so.raw() })?
            .clocks;
        let (cr, cw) = {
            let thr = &self.threads[t.index()];
            (thr.clock_read, thr.clock_write)
        };
        let (vi_r, vi_w) = match cur {
            None => (cr, cw),
            Some(_) if strong => (cr, cw),
            Some(c) => (
                id_join(&mut self.vts, &mut self.cmp, c.vi_r, cr)?,
                id_join(&mut self.vts, &mut self.cmp, c.vi_w, cw)?,
            ),
        };
        self.vts.rcinc(vi_r);
        self.vts.rcinc(vi_w);
        if let Some(c) = cur {
            self.vts.rcdec(c.vi_r);
            self.vts.rcdec(c.vi_w);
        }
        self.sos.get_mut(so).expect("checked above").clocks = Some(SoClocks { vi_r, vi_w });

        self.tick_clocks(t)?;
        self.stats.so_sends += 1;
        tracing::trace!(thr = %t, so = %so, strong, "so send");
        Ok(())
    }

    /// Receive from an SO: join its read clock into the receiver's read
    /// clock, and its write clock into the receiver's write clock iff
    /// `strong`. Receiving from a never-sent SO creates no ordering.
    pub fn so_recv(&mut self, t: ThrId, so: SoId, strong: bool) -> Result<()> {
        self.check_thread(t)?;
        self.stats.so_recvs += 1;
        let Some(c) = self
            .sos
            .get(so)
            .ok_or(HazelineError::UnknownSyncObject { so: so.raw() })?
            .clocks
        else {
            return Ok(());
        };
        let (cr, cw) = {
            let thr = &self.threads[t.index()];
            (thr.clock_read, thr.clock_write)
        };
        let new_r = id_join(&mut self.vts, &mut self.cmp, cr, c.vi_r)?;
        let new_w = if strong {
            id_join(&mut self.vts, &mut self.cmp, cw, c.vi_w)?
        } else {
            cw
        };
        self.vts.rcinc(new_r);
        self.vts.rcinc(new_w);
        self.vts.rcdec(cr);
        self.vts.rcdec(cw);
        let thr = &mut self.threads[t.index()];
        thr.clock_read = new_r;
        thr.clock_write = new_w;
        thr.filter.clear();
        tracing::trace!(thr = %t, so = %so, strong, "so recv");
        Ok(())
    }

    /// Whether anything was ever sent through `so`.
    #[must_use]
    pub fn so_ever_sent(&self, so: SoId) -> bool {
        self.sos.get(so).is_some_and(|obj| obj.clocks.is_some())
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// The most recent conflicting historical access overlapping the range,
    /// excluding `exclude`'s own accesses.
    #[must_use]
    pub fn lookup_conflict(
        &self,
        addr: u64,
        size: u64,
        kind: AccessKind,
        exclude: ThrId,
    ) -> Option<ConflictRecord> {
        self.history.lookup(addr, size, kind, exclude)
    }

    /// Visit every recorded historical access overlapping the range, most
    /// recent first.
    pub fn for_each_historical_access(
        &self,
        addr: u64,
        size: u64,
        f: impl FnMut(&ConflictRecord),
    ) {
        self.history.for_each_overlapping(addr, size, f);
    }

    /// A thread's local clock/stack samples (approximate history).
    #[must_use]
    pub fn local_clock_log(&self, t: ThrId) -> &[ClockSample] {
        self.threads
            .get(t.index())
            .map_or(&[], |thr| thr.local_log.as_slice())
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Run a GC pass if the timestamp table has grown enough since the last
    /// one. Intended to be called periodically by the harness between
    /// accesses.
    pub fn maybe_run_gc(&mut self) -> Result<Option<GcOutcome>> {
        if !self
            .vts
            .should_gc(self.config.vts_gc_min_live, self.config.vts_gc_growth_factor)
        {
            return Ok(None);
        }
        self.force_gc().map(Some)
    }

    /// Run a GC pass unconditionally: flush the shadow cache, sweep
    /// unreferenced timestamps, prune retired threads per policy, scavenge
    /// untracked segments.
    pub fn force_gc(&mut self) -> Result<GcOutcome> {
        self.shadow.flush_cache();
        self.cmp.invalidate_all();
        let sweep = self.vts.gc();
        let pruned = if self.should_prune() {
            Some(self.run_prune()?)
        } else {
            None
        };
        let segments_scavenged = self.shadow.scavenge();
        self.stats.gc_passes += 1;
        tracing::info!(
            swept = sweep.swept,
            live = self.vts.live_count(),
            pruned = pruned.is_some(),
            segments_scavenged,
            "gc pass complete"
        );
        Ok(GcOutcome {
            swept: sweep.swept,
            live_after: self.vts.live_count(),
            pruned,
            segments_scavenged,
        })
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Shadow-memory counters.
    #[must_use]
    pub fn shadow_stats(&self) -> ShadowStats {
        self.shadow.stats()
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Live interned timestamps.
    #[must_use]
    pub fn vts_live_count(&self) -> usize {
        self.vts.live_count()
    }

    /// Conflict-history records currently held.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Live interned stack fingerprints.
    #[must_use]
    pub fn rcec_live(&self) -> usize {
        self.history.rcec_live()
    }

    /// Deep invariant sweep for tests: canonical timestamp form, reference
    /// counts audited against every storage location, thread clock ordering,
    /// and (on race-free histories) the per-byte constraint ordering.
    ///
    /// # Panics
    ///
    /// Panics on any violated invariant; a violation is an engine bug.
    pub fn debug_check_invariants(&mut self) {
        let mut expected: HashMap<u32, u32> = HashMap::new();
        self.shadow.for_each_id_occurrence(|id| {
            *expected.entry(id.raw()).or_insert(0) += 1;
        });
        for thr in &self.threads {
            if !thr.retired {
                *expected.entry(thr.clock_read.raw()).or_insert(0) += 1;
                *expected.entry(thr.clock_write.raw()).or_insert(0) += 1;
            }
        }
        self.sos.for_each(|_, obj| {
            if let Some(c) = obj.clocks {
                *expected.entry(c.vi_r.raw()).or_insert(0) += 1;
                *expected.entry(c.vi_w.raw()).or_insert(0) += 1;
            }
        });

        let vts = &self.vts;
        vts.for_each_live(|id, rc| {
            assert!(
                vts.get(id).is_canonical(),
                "non-canonical timestamp behind {id}"
            );
            assert_eq!(
                expected.get(&id.raw()).copied().unwrap_or(0),
                rc,
                "refcount drift on {id}"
            );
        });

        for thr in &self.threads {
            if !thr.retired {
                assert!(
                    vts.get(thr.clock_write).leq(vts.get(thr.clock_read)),
                    "thread {} write clock exceeds read clock",
                    thr.id
                );
            }
        }

        if self.stats.races == 0 {
            let vts = &self.vts;
            self.shadow.for_each_sval(|sv| {
                if let SVal::Clean { rmin, wmin } = sv {
                    assert!(
                        vts.get(rmin).leq(vts.get(wmin)),
                        "stored read constraint exceeds write constraint"
                    );
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_thread(&self, t: ThrId) -> Result<()> {
        match self.threads.get(t.index()) {
            Some(thr) if !thr.retired => Ok(()),
            _ => Err(HazelineError::UnknownThread { thread: t.get() }),
        }
    }

    /// Advance both of `t`'s clocks on its own axis. Clears the filter and,
    /// at the approximate history level, samples the local clock log.
    fn tick_clocks(&mut self, t: ThrId) -> Result<()> {
        let (old_r, old_w) = {
            let thr = &self.threads[t.index()];
            (thr.clock_read, thr.clock_write)
        };
        let new_r = id_tick(&mut self.vts, old_r, t)?;
        let new_w = id_tick(&mut self.vts, old_w, t)?;
        self.vts.rcinc(new_r);
        self.vts.rcinc(new_w);
        self.vts.rcdec(old_r);
        self.vts.rcdec(old_w);

        let sample = if matches!(self.config.history_level, HistoryLevel::Approx) {
            Some(ClockSample {
                clock: self.vts.get(new_w).get(t),
                stack: self.stacks.capture(t),
            })
        } else {
            None
        };

        let capacity = self.config.local_log_capacity;
        let thr = &mut self.threads[t.index()];
        thr.clock_read = new_r;
        thr.clock_write = new_w;
        thr.filter.clear();
        if let Some(s) = sample {
            thr.sample_clock(s, capacity);
        }
        Ok(())
    }

    fn try_retire(&mut self, t: ThrId) {
        if !self.threads[t.index()].is_retirable() {
            return;
        }
        let (r, w) = {
            let thr = &self.threads[t.index()];
            (thr.clock_read, thr.clock_write)
        };
        self.vts.rcdec(r);
        self.vts.rcdec(w);
        let thr = &mut self.threads[t.index()];
        thr.retired = true;
        thr.local_log.clear();
        thr.filter.clear();
        self.very_dead.push(t);
        self.stats.threads_retired += 1;
        tracing::debug!(thr = %t, "thread fully retired");
    }

    fn report_race(&mut self, t: ThrId, addr: u64, size: u64, kind: AccessKind, clocks: RaceClocks) {
        self.stats.races += 1;
        let conflicting = self
            .vts
            .get(clocks.constraint)
            .first_not_leq(self.vts.get(clocks.observed));
        let prior = if matches!(self.config.history_level, HistoryLevel::Full) {
            self.history.lookup(addr, size, kind, t)
        } else {
            None
        };
        let event = RaceEvent {
            thr: t,
            addr,
            size: clamp_width(size),
            kind,
            conflicting_thread: conflicting,
            prior,
        };
        tracing::debug!(thr = %t, addr, size, kind = %kind, "race detected");
        self.observer.on_race(&event);
    }

    fn clear_filters_range(&mut self, addr: u64, size: u64) {
        for thr in &mut self.threads {
            if !thr.retired {
                thr.filter.clear_range(addr, size);
            }
        }
    }

    fn should_prune(&self) -> bool {
        if self.very_dead.is_empty() {
            return false;
        }
        match self.config.prune_policy {
            PrunePolicy::Never => false,
            PrunePolicy::Always => true,
            PrunePolicy::Auto => self.very_dead.len() >= AUTO_PRUNE_MIN_DEAD,
        }
    }

    fn run_prune(&mut self) -> Result<PruneOutcome> {
        let mut dead: Vec<ThrId> = self.very_dead.drain(..).collect();
        dead.sort_unstable();
        let (outcome, remap) = self.vts.prune(&dead)?;

        self.shadow.remap_ids(&remap);
        for thr in &mut self.threads {
            if !thr.retired {
                thr.clock_read = remap.lookup(thr.clock_read);
                thr.clock_write = remap.lookup(thr.clock_write);
            }
        }
        self.sos.for_each_mut(|_, obj| {
            if let Some(c) = &mut obj.clocks {
                c.vi_r = remap.lookup(c.vi_r);
                c.vi_w = remap.lookup(c.vi_w);
            }
        });
        self.cmp.invalidate_all();
        self.stats.prune_passes += 1;
        Ok(outcome)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn clamp_width(size: u64) -> u8 {
    size.min(u64::from(u8::MAX)) as u8
}

impl std::fmt::Debug for HbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HbEngine")
            .field("threads", &self.threads.len())
            .field("vts_live", &self.vts.live_count())
            .field("history_len", &self.history.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
