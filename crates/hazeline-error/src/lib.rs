//! Error types for the Hazeline happens-before engine.
//!
//! Races are findings, not failures: they flow through the observer hook and
//! never appear here. This taxonomy covers the engine's genuine failure
//! modes, which are all hard resource limits of the chosen encodings, plus a
//! catch-all for internal invariant breakage surfaced in release builds.

use thiserror::Error;

/// Primary error type for Hazeline operations.
///
/// Structured variants for the conditions the harness can encounter, with
/// a fatality classifier: resource-exhaustion variants indicate the process
/// must stop monitoring, not that an operation can be retried.
#[derive(Error, Debug)]
pub enum HazelineError {
    // === Resource exhaustion (fatal) ===
    /// The dense thread-identifier space is exhausted.
    #[error("thread identifier space exhausted: {limit} threads already created")]
    ThreadIdExhausted {
        /// The hard limit on thread identifiers.
        limit: u32,
    },

    /// A thread's scalar clock would overflow its fixed bit width.
    #[error("logical clock overflow on thread #{thread}: cannot tick past {max}")]
    ClockOverflow {
        /// The thread whose clock overflowed.
        thread: u32,
        /// The largest representable scalar clock.
        max: u64,
    },

    /// The vector-timestamp intern table is full.
    #[error("vector-timestamp table exhausted: {limit} live timestamps")]
    VtsTableExhausted {
        /// The hard limit on live interned timestamps.
        limit: u32,
    },

    // === Misuse ===
    /// An operation named a thread handle the engine never issued, or one
    /// that has been fully retired.
    #[error("unknown or retired thread handle #{thread}")]
    UnknownThread {
        /// The offending raw thread index.
        thread: u32,
    },

    /// An operation named a synchronization object that is not allocated.
    #[error("unknown or freed synchronization object {so}")]
    UnknownSyncObject {
        /// The offending raw object index.
        so: u32,
    },

    // === Internal ===
    /// Internal logic error (engine bug, not a target-program bug).
    #[error("internal error: {0}")]
    Internal(String),
}

impl HazelineError {
    /// Whether the harness must stop monitoring: the engine cannot continue
    /// soundly past this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ThreadIdExhausted { .. }
                | Self::ClockOverflow { .. }
                | Self::VtsTableExhausted { .. }
                | Self::Internal(_)
        )
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using [`HazelineError`].
pub type Result<T> = std::result::Result<T, HazelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = HazelineError::ThreadIdExhausted { limit: 262_144 };
        assert_eq!(
            err.to_string(),
            "thread identifier space exhausted: 262144 threads already created"
        );

        let err = HazelineError::ClockOverflow {
            thread: 3,
            max: 70_368_744_177_663,
        };
        assert_eq!(
            err.to_string(),
            "logical clock overflow on thread #3: cannot tick past 70368744177663"
        );
    }

    #[test]
    fn fatality_classification() {
        assert!(HazelineError::ThreadIdExhausted { limit: 1 }.is_fatal());
        assert!(HazelineError::ClockOverflow { thread: 0, max: 1 }.is_fatal());
        assert!(HazelineError::VtsTableExhausted { limit: 1 }.is_fatal());
        assert!(HazelineError::internal("bug").is_fatal());
        assert!(!HazelineError::UnknownThread { thread: 9 }.is_fatal());
        assert!(!HazelineError::UnknownSyncObject { so: 9 }.is_fatal());
    }

    #[test]
    fn internal_constructor() {
        let err = HazelineError::internal("shadow tree malformed");
        assert!(matches!(err, HazelineError::Internal(msg) if msg == "shadow tree malformed"));
    }
}
