//! Happens-before transition rules for memory accesses.
//!
//! The per-byte semantics are fixed by [`msm_step`]: untracked bytes are
//! inert; tracked bytes compare the relevant constraint clock against the
//! accessing thread's clock and always fold the thread's write clock into
//! the stored state. Races are produced, never suppressed, and detection
//! does not stop further tracking.
//!
//! Multi-byte accesses are processed as maximal naturally-aligned 8/4/2/1
//! byte chunks. A chunk whose bytes share one shadow value takes a single
//! transition broadcast to the run; anything else splits in half down to
//! single bytes. A uniform write re-merges the run, since every byte
//! receives the same result. The chunking is observationally identical to
//! running every byte through [`msm_step`] alone.

use hazeline_error::Result;
use hazeline_shadow::{release_sval, retain_sval, ShadowMemory, LINE_BYTES};
use hazeline_types::{AccessKind, SVal, VtsId};
use hazeline_vts::{id_join, id_leq, CmpCache, VtsTable};

/// The three orienting clocks of a detected race: the stored constraint the
/// access failed to dominate, the thread clock that was observed, and the
/// opposite-kind constraint stored alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceClocks {
    /// The stored minimum the access had to dominate and did not.
    pub constraint: VtsId,
    /// The accessing thread's relevant clock.
    pub observed: VtsId,
    /// The other stored constraint, for orientation in reports.
    pub other: VtsId,
}

/// Result of processing one whole access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessOutcome {
    /// Orienting clocks of the first racing byte, if any.
    pub race: Option<RaceClocks>,
    /// Whether any touched byte was tracked. Untracked-only accesses leave
    /// no trace in shadow state.
    pub tracked: bool,
}

/// One per-value transition.
struct Step {
    result: SVal,
    race: Option<RaceClocks>,
}

fn msm_step(
    sv: SVal,
    kind: AccessKind,
    clock_read: VtsId,
    clock_write: VtsId,
    table: &mut VtsTable,
    cache: &mut CmpCache,
) -> Result<Step> {
    match sv {
        SVal::NoAccess => Ok(Step {
            result: SVal::NoAccess,
            race: None,
        }),
        SVal::Clean { rmin, wmin } => match kind {
            AccessKind::Read => {
                let ordered = id_leq(table, cache, rmin, clock_read);
                let wmin2 = id_join(table, cache, wmin, clock_write)?;
                Ok(Step {
                    result: SVal::Clean { rmin, wmin: wmin2 },
                    race: (!ordered).then_some(RaceClocks {
                        constraint: rmin,
                        observed: clock_read,
                        other: wmin,
                    }),
                })
            }
            AccessKind::Write => {
                let ordered = id_leq(table, cache, wmin, clock_write);
                let rmin2 = id_join(table, cache, rmin, clock_write)?;
                Ok(Step {
                    result: SVal::Clean {
                        rmin: rmin2,
                        wmin: clock_write,
                    },
                    race: (!ordered).then_some(RaceClocks {
                        constraint: wmin,
                        observed: clock_write,
                        other: rmin,
                    }),
                })
            }
        },
    }
}

/// Maximal naturally-aligned chunks covering `[addr, addr + size)`.
/// Chunk widths are 8, 4, 2 or 1; a chunk never crosses a line boundary.
fn aligned_chunks(addr: u64, size: u64) -> impl Iterator<Item = (u64, usize)> {
    let mut a = addr;
    let end = addr.saturating_add(size);
    std::iter::from_fn(move || {
        if a >= end {
            return None;
        }
        let rem = end - a;
        let w = [8_u64, 4, 2, 1]
            .into_iter()
            .find(|&w| a % w == 0 && rem >= w)
            .expect("width 1 always fits");
        let item = (a, w as usize);
        a += w;
        Some(item)
    })
}

/// Apply a transition over `slice`, splitting in half until the bytes form
/// a uniform run. Records the first race's clocks in `race`.
fn apply_run(
    slice: &mut [SVal],
    kind: AccessKind,
    clock_read: VtsId,
    clock_write: VtsId,
    table: &mut VtsTable,
    cache: &mut CmpCache,
    out: &mut AccessOutcome,
) -> Result<()> {
    let first = slice[0];
    if slice.iter().all(|&v| v == first) {
        out.tracked |= first.is_tracked();
        let step = msm_step(first, kind, clock_read, clock_write, table, cache)?;
        if out.race.is_none() {
            out.race = step.race;
        }
        if step.result != first {
            for slot in slice.iter_mut() {
                release_sval(table, *slot);
                retain_sval(table, step.result);
                *slot = step.result;
            }
        }
        return Ok(());
    }
    let mid = slice.len() / 2;
    let (lo, hi) = slice.split_at_mut(mid);
    apply_run(lo, kind, clock_read, clock_write, table, cache, out)?;
    apply_run(hi, kind, clock_read, clock_write, table, cache, out)?;
    Ok(())
}

/// Process one monitored access against shadow memory.
pub fn process_access(
    shadow: &mut ShadowMemory,
    table: &mut VtsTable,
    cache: &mut CmpCache,
    kind: AccessKind,
    clock_read: VtsId,
    clock_write: VtsId,
    addr: u64,
    size: u64,
) -> Result<AccessOutcome> {
    let mut out = AccessOutcome {
        race: None,
        tracked: false,
    };
    for (base, width) in aligned_chunks(addr, size) {
        let line = shadow.line_mut(base);
        let lo = (base & (LINE_BYTES as u64 - 1)) as usize;
        apply_run(
            &mut line[lo..lo + width],
            kind,
            clock_read,
            clock_write,
            table,
            cache,
            &mut out,
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hazeline_types::ThrId;
    use hazeline_vts::VectorTimestamp;

    fn setup() -> (ShadowMemory, VtsTable, CmpCache) {
        (ShadowMemory::new(), VtsTable::new(), CmpCache::new())
    }

    fn intern(table: &mut VtsTable, pairs: &[(u32, u64)]) -> VtsId {
        let mut v = VectorTimestamp::empty();
        for &(t, n) in pairs {
            for _ in 0..n {
                v = v.tick(ThrId::new(t).unwrap()).unwrap();
            }
        }
        table.intern_or_reuse(&v).unwrap()
    }

    #[test]
    fn chunking_is_naturally_aligned() {
        let chunks: Vec<_> = aligned_chunks(3, 9).collect();
        assert_eq!(chunks, vec![(3, 1), (4, 4), (8, 4)]);

        let chunks: Vec<_> = aligned_chunks(8, 8).collect();
        assert_eq!(chunks, vec![(8, 8)]);

        let chunks: Vec<_> = aligned_chunks(30, 4).collect();
        assert_eq!(chunks, vec![(30, 2), (32, 2)]);
    }

    #[test]
    fn noaccess_is_inert() {
        let (mut shadow, mut table, mut cache) = setup();
        let c = intern(&mut table, &[(0, 1)]);
        let out = process_access(
            &mut shadow,
            &mut table,
            &mut cache,
            AccessKind::Write,
            c,
            c,
            0x1000,
            8,
        )
        .unwrap();
        assert!(out.race.is_none());
        assert!(!out.tracked, "untracked access leaves no trace");
        assert_eq!(shadow.read_sval(0x1000), SVal::NoAccess);
    }

    #[test]
    fn ordered_read_is_race_free_and_folds_write_clock() {
        let (mut shadow, mut table, mut cache) = setup();
        // Byte owned by thread 0 at clock 1; reader has seen that.
        let owner = intern(&mut table, &[(0, 1)]);
        let sv = SVal::Clean {
            rmin: owner,
            wmin: owner,
        };
        shadow.set_range(&mut table, 0, 1, sv);

        let reader_r = intern(&mut table, &[(0, 1), (1, 2)]);
        let reader_w = intern(&mut table, &[(1, 2)]);
        let out = process_access(
            &mut shadow,
            &mut table,
            &mut cache,
            AccessKind::Read,
            reader_r,
            reader_w,
            0,
            1,
        )
        .unwrap();
        assert!(out.race.is_none());
        assert!(out.tracked);

        // wmin picked up the reader's write clock; rmin unchanged.
        let SVal::Clean { rmin, wmin } = shadow.read_sval(0) else {
            panic!("byte must stay tracked");
        };
        assert_eq!(rmin, owner);
        assert_eq!(table.get(wmin).get(ThrId::new(1).unwrap()), 2);
        assert_eq!(table.get(wmin).get(ThrId::ROOT), 1);
    }

    #[test]
    fn unordered_read_races_with_orienting_clocks() {
        let (mut shadow, mut table, mut cache) = setup();
        let owner = intern(&mut table, &[(0, 3)]);
        let sv = SVal::Clean {
            rmin: owner,
            wmin: owner,
        };
        shadow.set_range(&mut table, 0, 1, sv);

        // Reader has never synchronized with thread 0.
        let reader = intern(&mut table, &[(1, 1)]);
        let race = process_access(
            &mut shadow,
            &mut table,
            &mut cache,
            AccessKind::Read,
            reader,
            reader,
            0,
            1,
        )
        .unwrap()
        .race
        .expect("unordered read must race");
        assert_eq!(race.constraint, owner);
        assert_eq!(race.observed, reader);

        // Detection does not stop tracking.
        assert!(shadow.read_sval(0).is_tracked());
    }

    #[test]
    fn unordered_write_races() {
        let (mut shadow, mut table, mut cache) = setup();
        let owner = intern(&mut table, &[(0, 1)]);
        shadow.set_range(
            &mut table,
            64,
            8,
            SVal::Clean {
                rmin: owner,
                wmin: owner,
            },
        );

        let writer = intern(&mut table, &[(1, 1)]);
        let out = process_access(
            &mut shadow,
            &mut table,
            &mut cache,
            AccessKind::Write,
            writer,
            writer,
            64,
            8,
        )
        .unwrap();
        assert!(out.race.is_some());

        // Result folds the writer's clock into both constraints.
        let SVal::Clean { rmin, wmin } = shadow.read_sval(64) else {
            panic!("byte must stay tracked");
        };
        assert_eq!(wmin, writer);
        assert_eq!(table.get(rmin).get(ThrId::ROOT), 1);
        assert_eq!(table.get(rmin).get(ThrId::new(1).unwrap()), 1);
    }

    #[test]
    fn mixed_runs_split_to_byte_granularity() {
        let (mut shadow, mut table, mut cache) = setup();
        let a = intern(&mut table, &[(0, 1)]);
        let b = intern(&mut table, &[(1, 1)]);
        // Bytes 0..4 owned by thread 0, bytes 4..8 by thread 1.
        shadow.set_range(&mut table, 0, 4, SVal::Clean { rmin: a, wmin: a });
        shadow.set_range(&mut table, 4, 4, SVal::Clean { rmin: b, wmin: b });

        // A writer ordered after both: no race despite the split.
        let w = intern(&mut table, &[(0, 1), (1, 1), (2, 1)]);
        let out = process_access(
            &mut shadow,
            &mut table,
            &mut cache,
            AccessKind::Write,
            w,
            w,
            0,
            8,
        )
        .unwrap();
        assert!(out.race.is_none());

        // Uniform write re-merged the run.
        let first = shadow.read_sval(0);
        for off in 1..8 {
            assert_eq!(shadow.read_sval(off), first, "byte {off} not re-merged");
        }
    }

    #[test]
    fn refcounts_balance_across_transitions() {
        let (mut shadow, mut table, mut cache) = setup();
        let owner = intern(&mut table, &[(0, 1)]);
        let sv = SVal::Clean {
            rmin: owner,
            wmin: owner,
        };
        shadow.set_range(&mut table, 0, 8, sv);

        let w = intern(&mut table, &[(0, 1), (1, 4)]);
        let _ = process_access(
            &mut shadow,
            &mut table,
            &mut cache,
            AccessKind::Write,
            w,
            w,
            0,
            8,
        )
        .unwrap();

        // Every stored occurrence is counted; audit against the walk.
        let mut counts = std::collections::HashMap::new();
        shadow.for_each_id_occurrence(|id| {
            *counts.entry(id).or_insert(0_u32) += 1;
        });
        table.for_each_live(|id, rc| {
            assert_eq!(
                counts.get(&id).copied().unwrap_or(0),
                rc,
                "refcount drift on {id}"
            );
        });
    }
}
