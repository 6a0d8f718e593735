//! Reusable plumbing for driving the engine in tests.
//!
//! Provides a deterministic stack source, an observer that collects every
//! race event for inspection, and a builder that wires both into a fresh
//! engine.

use std::sync::Arc;

use parking_lot::Mutex;

use hazeline_engine::{
    HbEngine, RaceEvent, RaceObserver, StackFingerprint, StackSource, STACK_DEPTH,
};
use hazeline_error::Result;
use hazeline_types::{EngineConfig, LockSetId, ThrId};

/// Deterministic stack source: each capture yields a fingerprint derived
/// from the thread id and a per-source sequence number, so distinct capture
/// sites intern distinct fingerprints while remaining reproducible.
#[derive(Debug, Default)]
pub struct ScriptedStacks {
    sequence: u64,
    /// When set, every capture returns the same fingerprint (exercises
    /// RCEC deduplication).
    pub pin_stacks: bool,
}

impl StackSource for ScriptedStacks {
    fn capture(&mut self, thr: ThrId) -> StackFingerprint {
        if !self.pin_stacks {
            self.sequence += 1;
        }
        let mut frames = [0_u64; STACK_DEPTH];
        frames[0] = 0x4000_0000 + u64::from(thr.get());
        frames[1] = self.sequence;
        StackFingerprint { frames }
    }

    fn current_locks(&mut self, thr: ThrId) -> LockSetId {
        LockSetId(thr.get())
    }
}

/// Observer that retains every reported race.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<RaceEvent>>,
}

impl CollectingObserver {
    /// A fresh collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of races recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no race has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Copies of every recorded event, in report order.
    #[must_use]
    pub fn events(&self) -> Vec<RaceEvent> {
        self.events.lock().clone()
    }
}

impl RaceObserver for CollectingObserver {
    fn on_race(&self, event: &RaceEvent) {
        self.events.lock().push(event.clone());
    }
}

/// A fresh engine wired to a [`ScriptedStacks`] source and a shared
/// [`CollectingObserver`]. Returns the engine, its root thread and the
/// observer handle.
pub fn build_engine(config: EngineConfig) -> Result<(HbEngine, ThrId, Arc<CollectingObserver>)> {
    let observer = Arc::new(CollectingObserver::new());
    let (engine, root) = HbEngine::new(
        config,
        Box::new(ScriptedStacks::default()),
        Box::new(Arc::clone(&observer)),
    )?;
    Ok((engine, root, observer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hazeline_types::AccessKind;

    #[test]
    fn scripted_stacks_are_deterministic_per_site() {
        let mut a = ScriptedStacks::default();
        let mut b = ScriptedStacks::default();
        let t = ThrId::ROOT;
        assert_eq!(a.capture(t), b.capture(t), "same sequence, same fingerprint");
        let second = a.capture(t);
        assert_ne!(second, b.capture(ThrId::new(1).unwrap()), "sites differ");

        let mut pinned = ScriptedStacks {
            pin_stacks: true,
            ..ScriptedStacks::default()
        };
        assert_eq!(pinned.capture(t), pinned.capture(t), "pinned stacks repeat");
    }

    #[test]
    fn collector_records_events() {
        let c = CollectingObserver::new();
        assert!(c.is_empty());
        c.on_race(&RaceEvent {
            thr: ThrId::ROOT,
            addr: 16,
            size: 4,
            kind: AccessKind::Write,
            conflicting_thread: None,
            prior: None,
        });
        assert_eq!(c.len(), 1);
        assert_eq!(c.events()[0].addr, 16);
    }
}
