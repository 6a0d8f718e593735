//! Race reporting hooks.
//!
//! Detection and reporting are decoupled: the engine calls the registered
//! [`RaceObserver`] for every finding and keeps scanning. Observers must not
//! call back into the engine.

use parking_lot::Mutex;

use hazeline_types::{AccessKind, ThrId};

use crate::history::ConflictRecord;

/// A detected race, with whatever diagnostic context was available.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RaceEvent {
    /// The thread whose access completed the race.
    pub thr: ThrId,
    /// Start address of the access.
    pub addr: u64,
    /// Access width in bytes.
    pub size: u8,
    /// Read or write.
    pub kind: AccessKind,
    /// The first thread by which the stored constraint fails to be ordered
    /// before the access; the other side of the race, when resolvable.
    pub conflicting_thread: Option<ThrId>,
    /// The most recent conflicting historical access, when history is on.
    pub prior: Option<ConflictRecord>,
}

/// Observer for race findings.
///
/// Called on the hot path at detection time; implementations should record
/// and return. Shared behind `&self` so harnesses can keep a handle to the
/// same observer they registered.
pub trait RaceObserver {
    /// Called once per detected racing access.
    fn on_race(&self, event: &RaceEvent);
}

impl<T: RaceObserver + ?Sized> RaceObserver for std::sync::Arc<T> {
    fn on_race(&self, event: &RaceEvent) {
        (**self).on_race(event);
    }
}

/// Observer that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl RaceObserver for NoOpObserver {
    #[inline]
    fn on_race(&self, _event: &RaceEvent) {}
}

struct Ring {
    events: Vec<RaceEvent>,
    next: usize,
    total: u64,
}

/// Fixed-capacity ring of the most recent race events.
///
/// Thread-safe via an internal mutex: harnesses inspect it from outside the
/// engine's single-mutator context. When full, the oldest event is
/// overwritten.
pub struct RingBufferObserver {
    capacity: usize,
    inner: Mutex<Ring>,
}

impl RingBufferObserver {
    /// Create a ring holding up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Ring {
                events: Vec::new(),
                next: 0,
                total: 0,
            }),
        }
    }

    /// Events currently retained, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RaceEvent> {
        let ring = self.inner.lock();
        let mut out = Vec::with_capacity(ring.events.len());
        if ring.events.len() == self.capacity {
            out.extend_from_slice(&ring.events[ring.next..]);
        }
        out.extend_from_slice(&ring.events[..ring.next.min(ring.events.len())]);
        out
    }

    /// Total events ever recorded, including overwritten ones.
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.inner.lock().total
    }
}

impl RaceObserver for RingBufferObserver {
    fn on_race(&self, event: &RaceEvent) {
        let mut ring = self.inner.lock();
        ring.total += 1;
        if ring.events.len() < self.capacity {
            ring.events.push(event.clone());
            ring.next = ring.events.len() % self.capacity;
        } else {
            let slot = ring.next;
            ring.events[slot] = event.clone();
            ring.next = (slot + 1) % self.capacity;
        }
    }
}
