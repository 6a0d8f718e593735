//! Per-thread engine state.

use hazeline_types::{ThrId, VtsId};

use crate::filter::Filter;
use crate::history::StackFingerprint;

/// One sample in the approximate-history local log: the thread's own scalar
/// clock paired with the stack it was running at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// The thread's own scalar clock component.
    pub clock: u64,
    /// Stack at the time of the tick.
    pub stack: StackFingerprint,
}

/// A live or not-yet-fully-retired guest thread.
///
/// Invariant on the clocks: `clock_write ⊑ clock_read` componentwise. Both
/// handles hold one reference each until the thread is retired.
pub struct Thr {
    /// The thread's dense identifier.
    pub id: ThrId,
    /// Everything the thread has observed (reads-from plus program order).
    pub clock_read: VtsId,
    /// The write-ordering clock, advanced by ticks and strong receives.
    pub clock_write: VtsId,
    /// Per-thread access filter.
    pub filter: Filter,
    /// Thread has exited.
    pub exited: bool,
    /// Some thread has joined with this one.
    pub joined: bool,
    /// Fully retired: clock references dropped, registered for pruning.
    pub retired: bool,
    /// Bounded local clock/stack log for approximate history.
    pub local_log: Vec<ClockSample>,
}

impl Thr {
    /// A fresh thread with both clocks at `clock` (one reference each is the
    /// caller's responsibility) and a cleared filter.
    #[must_use]
    pub fn new(id: ThrId, clock_read: VtsId, clock_write: VtsId) -> Self {
        Self {
            id,
            clock_read,
            clock_write,
            filter: Filter::new(),
            exited: false,
            joined: false,
            retired: false,
            local_log: Vec::new(),
        }
    }

    /// Whether both retirement conditions hold and retirement is pending.
    #[must_use]
    pub fn is_retirable(&self) -> bool {
        self.exited && self.joined && !self.retired
    }

    /// Append a local clock sample, keeping the log bounded by dropping the
    /// oldest entries.
    pub fn sample_clock(&mut self, sample: ClockSample, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.local_log.len() == capacity {
            self.local_log.remove(0);
        }
        self.local_log.push(sample);
    }
}

impl std::fmt::Debug for Thr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thr")
            .field("id", &self.id)
            .field("clock_read", &self.clock_read)
            .field("clock_write", &self.clock_write)
            .field("exited", &self.exited)
            .field("joined", &self.joined)
            .field("retired", &self.retired)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retirement_requires_both_flags() {
        let mut t = Thr::new(ThrId::ROOT, VtsId::from_raw(0), VtsId::from_raw(0));
        assert!(!t.is_retirable());
        t.exited = true;
        assert!(!t.is_retirable());
        t.joined = true;
        assert!(t.is_retirable());
        t.retired = true;
        assert!(!t.is_retirable(), "retirement happens once");
    }

    #[test]
    fn local_log_is_bounded() {
        let mut t = Thr::new(ThrId::ROOT, VtsId::from_raw(0), VtsId::from_raw(0));
        for i in 0..10 {
            t.sample_clock(
                ClockSample {
                    clock: i,
                    stack: StackFingerprint::EMPTY,
                },
                4,
            );
        }
        assert_eq!(t.local_log.len(), 4);
        assert_eq!(t.local_log.first().unwrap().clock, 6, "oldest dropped");
        assert_eq!(t.local_log.last().unwrap().clock, 9);
    }
}
