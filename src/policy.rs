//! Saturation policies: what a pool does with a task it cannot admit
//! right now (queue full, or pool already shut down).
//!
//! Four built-in `RejectedExecutionHandler`-style policies, plus a
//! fifth (`WaitPolicy`): block the submitter until the queue has room
//! instead of failing fast. Kept here since it costs nothing to
//! support and is a common configuration for callers that would rather
//! apply backpressure than drop work.

use std::time::Duration;

use tracing::warn;

use crate::error::{JunctureError, Result};
use crate::queue::Queue;

/// What to do with a task that [`crate::pool::ThreadPool::execute`]
/// could not hand to a worker or enqueue.
///
/// Implementors receive the task back as a boxed closure (not yet run)
/// and the queue it failed to join, so `CallerRunsPolicy` can invoke it
/// synchronously and `WaitPolicy` can retry the enqueue.
pub trait RejectionPolicy<T: Send>: Send + Sync {
    /// `shutdown` tells the policy whether the pool has already called
    /// `shutdown`/`shutdown_now` — `CallerRunsPolicy` needs it to avoid
    /// running a task synchronously once the pool has declared itself
    /// done accepting work; the other policies ignore it.
    fn reject(&self, task: T, queue: &dyn Queue<T>, shutdown: bool) -> Result<()>;
}

/// Fails fast: the task is dropped and the caller sees
/// [`JunctureError::Rejected`]. The pool's default.
pub struct AbortPolicy;

impl<T: Send> RejectionPolicy<T> for AbortPolicy {
    fn reject(&self, _task: T, _queue: &dyn Queue<T>, _shutdown: bool) -> Result<()> {
        warn!("AbortPolicy: rejecting task");
        Err(JunctureError::Rejected)
    }
}

/// Runs the task on the submitting thread itself, as a crude throttle:
/// a saturated pool makes its own callers do the work instead of
/// piling more of it onto the queue. Unless shut down — a
/// `CallerRunsPolicy` on a pool that has already called `shutdown` or
/// `shutdown_now` must not keep running tasks synchronously on behalf
/// of a pool that has declared itself done.
pub struct CallerRunsPolicy<T: Send> {
    run: Box<dyn Fn(T) + Send + Sync>,
}

impl<T: Send> CallerRunsPolicy<T> {
    /// `run` executes the task directly, the same way a worker thread
    /// would. [`crate::pool::ThreadPool::fixed_with_caller_runs`] wires
    /// this up for the pool's own `Job` type so a caller reaching for
    /// that constructor never has to supply it.
    pub fn new(run: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self { run: Box::new(run) }
    }
}

impl<T: Send> RejectionPolicy<T> for CallerRunsPolicy<T> {
    fn reject(&self, task: T, _queue: &dyn Queue<T>, shutdown: bool) -> Result<()> {
        if shutdown {
            warn!("CallerRunsPolicy: pool already shut down, rejecting instead of running inline");
            return Err(JunctureError::Rejected);
        }
        (self.run)(task);
        Ok(())
    }
}

/// Silently drops the task; the caller is told it succeeded ("no
/// exception, no side effect" — convenient, but itself a hazard callers
/// should watch for since a saturated pool can quietly lose work).
pub struct DiscardPolicy;

impl<T: Send> RejectionPolicy<T> for DiscardPolicy {
    fn reject(&self, _task: T, _queue: &dyn Queue<T>, _shutdown: bool) -> Result<()> {
        warn!("DiscardPolicy: silently dropping a rejected task");
        Ok(())
    }
}

/// Evicts the queue's current head to make room, then enqueues the new
/// task; if the queue is still full after that (e.g. a concurrent
/// taker already drained it), falls back to discarding the new task.
pub struct DiscardOldestPolicy;

impl<T: Send> RejectionPolicy<T> for DiscardOldestPolicy {
    fn reject(&self, task: T, queue: &dyn Queue<T>, _shutdown: bool) -> Result<()> {
        queue.poll();
        queue.offer(task).map(|_| ())
    }
}

/// Blocks the caller until the queue has room, rather than failing
/// immediately. Supplemented here since a bounded-queue pool with no
/// blocking admission path is a real gap for callers who would rather
/// apply backpressure than drop work.
pub struct WaitPolicy {
    timeout: Option<Duration>,
}

impl WaitPolicy {
    /// Waits indefinitely for room.
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Waits at most `timeout` for room before giving up with
    /// [`JunctureError::Rejected`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> RejectionPolicy<T> for WaitPolicy {
    fn reject(&self, task: T, queue: &dyn Queue<T>, _shutdown: bool) -> Result<()> {
        match self.timeout {
            None => queue.put(task),
            Some(timeout) => {
                if queue.offer_timeout(task, timeout)? {
                    Ok(())
                } else {
                    Err(JunctureError::Rejected)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ArrayBlockingQueue;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn abort_policy_rejects() {
        let queue = ArrayBlockingQueue::<i32>::new(1).unwrap();
        let policy = AbortPolicy;
        assert!(matches!(
            policy.reject(1, &queue, false),
            Err(JunctureError::Rejected)
        ));
    }

    #[test]
    fn caller_runs_policy_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let policy = CallerRunsPolicy::new(move |_: i32| ran2.store(true, Ordering::SeqCst));
        let queue = ArrayBlockingQueue::<i32>::new(1).unwrap();
        policy.reject(1, &queue, false).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn caller_runs_policy_refuses_to_run_once_the_pool_is_shut_down() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let policy = CallerRunsPolicy::new(move |_: i32| ran2.store(true, Ordering::SeqCst));
        let queue = ArrayBlockingQueue::<i32>::new(1).unwrap();
        assert!(matches!(
            policy.reject(1, &queue, true),
            Err(JunctureError::Rejected)
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn discard_policy_drops_silently() {
        let queue = ArrayBlockingQueue::<i32>::new(1).unwrap();
        let policy = DiscardPolicy;
        assert!(policy.reject(1, &queue, false).is_ok());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn discard_oldest_evicts_then_enqueues() {
        let queue = ArrayBlockingQueue::<i32>::new(1).unwrap();
        queue.offer(1).unwrap();
        let policy = DiscardOldestPolicy;
        policy.reject(2, &queue, false).unwrap();
        assert_eq!(queue.poll(), Some(2));
    }

    #[test]
    fn wait_policy_times_out_against_a_still_full_queue() {
        let queue = ArrayBlockingQueue::<i32>::new(1).unwrap();
        queue.offer(1).unwrap();
        let policy = WaitPolicy::with_timeout(Duration::from_millis(20));
        assert!(matches!(
            policy.reject(2, &queue, false),
            Err(JunctureError::Rejected)
        ));
    }
}
