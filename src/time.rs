//! Time-unit conversions and deadline arithmetic (component A).
//!
//! Every timed operation in this crate accepts a [`std::time::Duration`]
//! and internally converts it to a [`Deadline`] once, at the start of the
//! blocking call, so that a loop which re-waits after a spurious wakeup
//! always computes `remaining = deadline - now` rather than re-adding the
//! original duration to a moving "now" (which would let the effective
//! timeout drift longer than requested).

use std::time::{Duration, Instant};

/// A point in time derived from a caller-supplied timeout, against a
/// monotonic clock ([`Instant`]). Safe to pass between threads: two
/// `Deadline`s constructed from the same clock are always comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    /// Time remaining until this deadline, or `Duration::ZERO` if it has
    /// already elapsed. Never panics on an already-elapsed deadline
    /// (unlike naive `deadline - Instant::now()` subtraction on some
    /// duration types).
    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// Whether `Instant::now()` is at or past this deadline.
    pub fn has_elapsed(self) -> bool {
        Instant::now() >= self.0
    }

    /// The lesser of `self` and `other`, used when a wait is bounded both
    /// by a caller deadline and by some other internal deadline (e.g. the
    /// delay queue's "wake up when the new head expires" deadline).
    pub fn earliest(self, other: Deadline) -> Deadline {
        if self.0 <= other.0 { self } else { other }
    }

    pub(crate) fn instant(self) -> Instant {
        self.0
    }
}
