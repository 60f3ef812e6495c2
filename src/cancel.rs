//! Cooperative cancellation token standing in for JSR-166's thread
//! interruption (REDESIGN FLAGS: "Thread interruption as control signal").
//!
//! Rust has no first-class per-thread interrupt flag, so every blocking
//! operation in this crate that would otherwise be described as
//! "interruptible" instead accepts an optional [`CancelToken`]. Setting
//! the token wakes any waiter parked on it (never a lost wakeup: `set`
//! always notifies after flipping the flag) and causes the next wait
//! check to return [`JunctureError::Cancelled`](crate::error::JunctureError::Cancelled).
//!
//! A token is typically owned by whatever drives a worker thread (the
//! pool, in `cancel(true)`) and shared into the blocking call the worker
//! is parked in.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    gate: Mutex<()>,
    condvar: Condvar,
}

/// A shareable, settable cancellation flag with a condvar to wake
/// parked waiters promptly instead of only on their own poll interval.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks this token cancelled and wakes every thread parked in
    /// [`CancelToken::wait_while_unset`] or [`Condvar`] waits that were
    /// handed this token's gate.
    pub fn set(&self) {
        self.0.flag.store(true, Ordering::Release);
        let _guard = self.0.gate.lock();
        self.0.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.0.flag.load(Ordering::Acquire)
    }

    /// Parks the calling thread until either `set()` is called or
    /// `timeout` elapses, returning `true` iff it woke because of a
    /// cancellation (not a timeout).
    pub fn wait_for(&self, timeout: std::time::Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let mut guard = self.0.gate.lock();
        if self.is_set() {
            return true;
        }
        self.0.condvar.wait_for(&mut guard, timeout);
        self.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_wakes_a_waiter_promptly() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || waiter.wait_for(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        token.set();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_for_times_out_without_set() {
        let token = CancelToken::new();
        assert!(!token.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn already_set_short_circuits() {
        let token = CancelToken::new();
        token.set();
        assert!(token.wait_for(Duration::from_secs(5)));
    }
}
