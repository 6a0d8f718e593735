//! Vector timestamps for the Hazeline happens-before engine.
//!
//! Three layers, lowest first:
//! - [`VectorTimestamp`]: the immutable sorted-component value type and its
//!   four primitive operations (singleton/tick, join, ordering comparison,
//!   first-divergence lookup), all single linear merge scans.
//! - [`VtsTable`]: structural interning with per-slot reference counts,
//!   batch garbage collection and very-dead-thread pruning with handle
//!   remapping.
//! - [`CmpCache`]: a small set-associative memo for hot comparison and join
//!   handle pairs.

pub mod cmp_cache;
pub mod intern;
pub mod vts;

pub use cmp_cache::CmpCache;
pub use intern::{id_join, id_leq, id_tick, GcSweep, PruneOutcome, VtsRemap, VtsTable, MAX_VTS_IDS};
pub use vts::VectorTimestamp;
