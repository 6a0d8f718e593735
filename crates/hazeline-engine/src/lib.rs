//! Happens-before race-detection engine.
//!
//! The core of a dynamic data-race detector: for every monitored memory
//! access, decide whether it is ordered (happens-before) with respect to all
//! prior conflicting accesses to the same bytes, and report a race when it
//! is not. Ordering is carried by interned vector timestamps
//! (`hazeline-vts`), per-byte state lives in compressed shadow memory
//! (`hazeline-shadow`), and synchronization primitives propagate ordering
//! through send/recv on synchronization objects.
//!
//! Everything is owned by [`HbEngine`]; the instrumentation harness drives
//! it from a single logical thread at a time.

pub mod engine;
pub mod filter;
pub mod history;
pub mod machine;
pub mod observe;
pub mod sync;
pub mod thread;

pub use engine::{EngineStats, GcOutcome, HbEngine};
pub use filter::{Filter, FILTER_LINES};
pub use history::{
    ConflictCache, ConflictRecord, RcecTable, StackFingerprint, StackSource, STACK_DEPTH,
};
pub use machine::{AccessOutcome, RaceClocks};
pub use observe::{NoOpObserver, RaceEvent, RaceObserver, RingBufferObserver};
pub use sync::{SoArena, SoClocks, SyncObj};
pub use thread::{ClockSample, Thr};
