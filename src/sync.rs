//! Reentrant-adjacent mutex + condition-variable plumbing (component C).
//!
//! A `parking_lot::Mutex` guards state, a `parking_lot::Condvar`
//! parks/wakes waiters, and every wait loop re-checks its predicate
//! against a deadline computed once up front (`remaining = deadline -
//! now`), never against the starting duration re-applied after a
//! spurious wakeup.
//!
//! `parking_lot::Mutex` is not reentrant (nothing in this crate needs
//! reentrancy: each monitor guards a single `lock()` for the duration of
//! one operation, never calling back into itself), but every wait here
//! is both interruptible (via [`CancelToken`]) and timed, matching the
//! "reentrant, interruptible, timed" contract for the pieces this crate
//! actually needs.

use std::time::Duration;

use parking_lot::{Condvar, MutexGuard};

use crate::cancel::CancelToken;
use crate::error::{JunctureError, Result};
use crate::time::Deadline;

/// When a [`CancelToken`] is supplied, an indefinite or long-remaining
/// wait is sliced into ticks of at most this long so the next loop
/// iteration notices `cancel.is_set()` promptly. The cancel token has its
/// own condvar, distinct from the one a caller waits on here, so a
/// `set()` cannot directly interrupt an in-progress `wait_for` on *this*
/// condvar — bounding the slice is what keeps cancellation responsive
/// without requiring every condvar in the crate to share the token's
/// condvar.
const CANCEL_POLL_TICK: Duration = Duration::from_millis(25);

/// Outcome of a bounded condvar wait, distinguishing "predicate became
/// false" from the two ways a wait can otherwise end.
pub enum WaitOutcome {
    Ready,
    Cancelled,
    TimedOut,
}

/// Blocks on `condvar` until `predicate(&mut *guard)` is false, or until
/// `deadline` elapses, or until `cancel` is set. Re-evaluates the
/// predicate after every wakeup (guards against spurious wakeups).
///
/// `deadline == None` means wait indefinitely (still interruptible via
/// `cancel`).
pub fn wait_until<'a, T>(
    condvar: &Condvar,
    mut guard: MutexGuard<'a, T>,
    deadline: Option<Deadline>,
    cancel: Option<&CancelToken>,
    mut predicate: impl FnMut(&mut T) -> bool,
) -> (MutexGuard<'a, T>, WaitOutcome) {
    loop {
        if !predicate(&mut guard) {
            return (guard, WaitOutcome::Ready);
        }
        if let Some(cancel) = cancel
            && cancel.is_set()
        {
            return (guard, WaitOutcome::Cancelled);
        }
        let wait_for = match deadline {
            None => None,
            Some(d) => {
                let remaining = d.remaining();
                if remaining.is_zero() && d.has_elapsed() {
                    return (guard, WaitOutcome::TimedOut);
                }
                Some(remaining)
            }
        };
        let slice = match (wait_for, cancel.is_some()) {
            (Some(remaining), true) => shorter(remaining, CANCEL_POLL_TICK),
            (Some(remaining), false) => remaining,
            (None, true) => CANCEL_POLL_TICK,
            (None, false) => {
                condvar.wait(&mut guard);
                continue;
            }
        };
        let timed_out = condvar.wait_for(&mut guard, slice).timed_out();
        if timed_out && wait_for.is_some() && deadline.is_some_and(Deadline::has_elapsed) {
            if !predicate(&mut guard) {
                return (guard, WaitOutcome::Ready);
            }
            return (guard, WaitOutcome::TimedOut);
        }
    }
}

/// Converts a [`WaitOutcome`] that is not `Ready` into the corresponding
/// [`JunctureError`]. Call sites that reach `Ready` proceed to perform
/// their operation instead of calling this.
pub fn outcome_to_error(outcome: WaitOutcome) -> Result<()> {
    match outcome {
        WaitOutcome::Ready => Ok(()),
        WaitOutcome::Cancelled => Err(JunctureError::Cancelled),
        WaitOutcome::TimedOut => Err(JunctureError::Timeout),
    }
}

/// Clamped conversion used by the delay queue's leader/follower wait,
/// where the wait duration is `min(delay-to-head-expiry, remaining
/// caller deadline)` rather than a single deadline.
pub fn shorter(a: Duration, b: Duration) -> Duration {
    if a <= b { a } else { b }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_until_wakes_on_predicate_change() {
        let state = Arc::new(Mutex::new(false));
        let condvar = Arc::new(Condvar::new());

        let s2 = state.clone();
        let c2 = condvar.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            *s2.lock() = true;
            c2.notify_all();
        });

        let guard = state.lock();
        let (_guard, outcome) = wait_until(&condvar, guard, None, None, |ready| !*ready);
        assert!(matches!(outcome, WaitOutcome::Ready));
        handle.join().unwrap();
    }

    #[test]
    fn wait_until_times_out() {
        let state = Mutex::new(false);
        let condvar = Condvar::new();
        let deadline = Deadline::after(Duration::from_millis(20));
        let guard = state.lock();
        let (_guard, outcome) = wait_until(&condvar, guard, Some(deadline), None, |ready| !*ready);
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn wait_until_observes_cancellation() {
        let state = Mutex::new(false);
        let condvar = Condvar::new();
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            cancel2.set();
        });
        let guard = state.lock();
        let (_guard, outcome) = wait_until(&condvar, guard, None, Some(&cancel), |ready| !*ready);
        assert!(matches!(outcome, WaitOutcome::Cancelled));
    }
}
