//! Cancellable future with at-most-once completion (component D).
//!
//! State machine, exactly as specified:
//! ```text
//! NEW (0) -> COMPLETING (1) -> NORMAL (2) | EXCEPTIONAL (3)
//! NEW -> CANCELLED (4)
//! NEW -> INTERRUPTING (5) -> INTERRUPTED (6)
//! ```
//! Any value greater than `COMPLETING` is terminal. A single
//! `AtomicU8` guards every transition; once terminal, the outcome is
//! immutable and published to any reader that subsequently observes the
//! terminal state (the `Release` store of `state` happens-before the
//! `Acquire` load any reader performs).
//!
//! Waiters queue on a Treiber stack (lock-free CAS push); the completer
//! detaches the whole stack with one `swap` and unparks every thread.
//! A waiter that times out or is cancelled attempts to splice its own
//! node out of the stack; if a concurrent completion already detached
//! the stack, the splice harmlessly finds nothing (the detacher now owns
//! — and will unpark and drop — that node instead).
//!
//! Rust has no first-class per-thread interrupt flag (REDESIGN FLAGS),
//! so `cancel(true)` delivers a cooperative [`CancelToken`] alongside an
//! `unpark()` of the runner thread: a running task only observes the
//! cancellation if it polls the token (e.g. by handing it to a blocking
//! queue operation), matching "tasks that do not check the interrupt
//! flag continue to completion".

use std::cell::UnsafeCell;
use std::panic::AssertUnwindSafe;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::{JunctureError, Result, TaskFailure};
use crate::time::Deadline;

const NEW: u8 = 0;
const COMPLETING: u8 = 1;
const NORMAL: u8 = 2;
const EXCEPTIONAL: u8 = 3;
const CANCELLED: u8 = 4;
const INTERRUPTING: u8 = 5;
const INTERRUPTED: u8 = 6;

enum Outcome<T> {
    Value(Arc<T>),
    Failure(Arc<TaskFailure>),
}

struct WaiterNode {
    thread: Thread,
    next: AtomicPtr<WaiterNode>,
}

fn push_waiter(head: &AtomicPtr<WaiterNode>, thread: Thread) -> *mut WaiterNode {
    let node = Box::into_raw(Box::new(WaiterNode {
        thread,
        next: AtomicPtr::new(ptr::null_mut()),
    }));
    loop {
        let cur = head.load(Ordering::Acquire);
        unsafe { (*node).next.store(cur, Ordering::Relaxed) };
        if head
            .compare_exchange_weak(cur, node, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return node;
        }
    }
}

/// Detaches the entire waiter stack with a single swap and unparks every
/// thread on it, dropping each node as it goes.
fn wake_all(head: &AtomicPtr<WaiterNode>) {
    let mut node = head.swap(ptr::null_mut(), Ordering::AcqRel);
    while !node.is_null() {
        // Safety: nodes on this stack are uniquely owned by the stack
        // itself until detached here or spliced out by `try_remove`;
        // this swap just took unique ownership of the whole chain.
        let boxed = unsafe { Box::from_raw(node) };
        let next = boxed.next.load(Ordering::Acquire);
        boxed.thread.unpark();
        node = next;
    }
}

/// Attempts to unlink `target` from the stack headed at `head`. If a
/// concurrent [`wake_all`] has already detached the stack (or detaches
/// it mid-walk), the walk simply finds nothing to unlink — the detacher
/// now owns `target` and will unpark and drop it on our behalf.
fn try_remove(head: &AtomicPtr<WaiterNode>, target: *mut WaiterNode) {
    loop {
        let first = head.load(Ordering::Acquire);
        if first.is_null() {
            return;
        }
        if first == target {
            let next = unsafe { (*target).next.load(Ordering::Acquire) };
            if head
                .compare_exchange_weak(first, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe { drop(Box::from_raw(target)) };
                return;
            }
            continue;
        }
        let mut prev = first;
        loop {
            let cur = unsafe { (*prev).next.load(Ordering::Acquire) };
            if cur.is_null() {
                return;
            }
            if cur == target {
                let next = unsafe { (*target).next.load(Ordering::Acquire) };
                let prev_next = unsafe { &(*prev).next };
                if prev_next
                    .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    unsafe { drop(Box::from_raw(target)) };
                    return;
                }
                break; // structure changed under us, restart from head
            }
            prev = cur;
        }
    }
}

struct Shared<T> {
    state: AtomicU8,
    outcome: UnsafeCell<Option<Outcome<T>>>,
    waiters: AtomicPtr<WaiterNode>,
    runner: Mutex<Option<Thread>>,
    cancel_token: CancelToken,
    #[cfg(feature = "async")]
    waker: futures::task::AtomicWaker,
}

// Safety: `outcome` is only written once, by whichever thread wins the
// NEW -> COMPLETING CAS, strictly before the Release store that takes
// the state terminal; every reader only touches it after observing a
// terminal state via an Acquire load, which happens-after that Release.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(NEW),
            outcome: UnsafeCell::new(None),
            waiters: AtomicPtr::new(ptr::null_mut()),
            runner: Mutex::new(None),
            cancel_token: CancelToken::new(),
            #[cfg(feature = "async")]
            waker: futures::task::AtomicWaker::new(),
        }
    }

    fn complete(&self, outcome: Outcome<T>, terminal: u8) {
        if self
            .state
            .compare_exchange(NEW, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Already cancelled/interrupting: per the single-completion
            // property, the task's result is simply discarded.
            return;
        }
        unsafe { *self.outcome.get() = Some(outcome) };
        self.state.store(terminal, Ordering::Release);
        trace!(terminal_state = terminal, "future reached a terminal state");
        wake_all(&self.waiters);
        #[cfg(feature = "async")]
        self.waker.wake();
    }

    fn read_outcome(&self, state: u8) -> Result<Arc<T>> {
        match state {
            NORMAL => match unsafe { &*self.outcome.get() } {
                Some(Outcome::Value(v)) => Ok(v.clone()),
                _ => unreachable!("NORMAL state without a published value"),
            },
            EXCEPTIONAL => match unsafe { &*self.outcome.get() } {
                Some(Outcome::Failure(f)) => Err(JunctureError::from(f.clone())),
                _ => unreachable!("EXCEPTIONAL state without a published failure"),
            },
            CANCELLED | INTERRUPTED => Err(JunctureError::Cancelled),
            other => unreachable!("read_outcome called on non-terminal state {other}"),
        }
    }
}

/// The query handle returned to callers: cancel, poll status, retrieve
/// the result (untimed or timed), same contract across clones (all
/// clones observe the same terminal outcome).
#[derive(Clone)]
pub struct JoinHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> JoinHandle<T> {
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let target = if may_interrupt { INTERRUPTING } else { CANCELLED };
        if self
            .shared
            .state
            .compare_exchange(NEW, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if may_interrupt {
            if let Some(thread) = self.shared.runner.lock().clone() {
                thread.unpark();
            }
            self.shared.cancel_token.set();
            self.shared.state.store(INTERRUPTED, Ordering::Release);
        }
        trace!(may_interrupt, "future cancelled");
        wake_all(&self.shared.waiters);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.state.load(Ordering::Acquire), CANCELLED | INTERRUPTING | INTERRUPTED)
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) > COMPLETING
    }

    /// The cooperative cancellation token delivered to a running task
    /// when `cancel(true)` is called; a task body that wants to be
    /// responsive to cancellation should hand this to any blocking
    /// queue operation it performs.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel_token.clone()
    }

    pub fn get(&self) -> Result<Arc<T>> {
        self.get_internal(None, None)
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<Arc<T>> {
        self.get_internal(Some(Deadline::after(timeout)), None)
    }

    /// As [`JoinHandle::get_timeout`], but also returns
    /// [`JunctureError::Cancelled`] promptly if `cancel` is set while
    /// waiting (rather than only at the next timeout tick).
    pub fn get_cancellable(&self, timeout: Option<Duration>, cancel: &CancelToken) -> Result<Arc<T>> {
        self.get_internal(timeout.map(Deadline::after), Some(cancel))
    }

    fn get_internal(&self, deadline: Option<Deadline>, cancel: Option<&CancelToken>) -> Result<Arc<T>> {
        let shared = &self.shared;
        loop {
            let state = shared.state.load(Ordering::Acquire);
            if state > COMPLETING {
                return shared.read_outcome(state);
            }

            let node = push_waiter(&shared.waiters, std::thread::current());

            let state = shared.state.load(Ordering::Acquire);
            if state > COMPLETING {
                try_remove(&shared.waiters, node);
                return shared.read_outcome(state);
            }

            let park_slice = match deadline {
                None => None,
                Some(d) => {
                    let remaining = d.remaining();
                    if remaining.is_zero() {
                        try_remove(&shared.waiters, node);
                        let state = shared.state.load(Ordering::Acquire);
                        return if state > COMPLETING {
                            shared.read_outcome(state)
                        } else {
                            Err(JunctureError::Timeout)
                        };
                    }
                    Some(crate::sync::shorter(remaining, Duration::from_millis(25)))
                }
            };

            match park_slice {
                None => std::thread::park(),
                Some(slice) => std::thread::park_timeout(slice),
            }

            try_remove(&shared.waiters, node);

            if let Some(cancel) = cancel {
                let state = shared.state.load(Ordering::Acquire);
                if state > COMPLETING {
                    return shared.read_outcome(state);
                }
                if cancel.is_set() {
                    return Err(JunctureError::Cancelled);
                }
            }
        }
    }
}

/// The producer side: owns the deferred computation and drives the
/// state machine. Implements the pool's internal `Runnable` contract
/// (`run()`), not exposed to callers directly — callers only ever see
/// the [`JoinHandle`].
pub struct Task<T> {
    shared: Arc<Shared<T>>,
    callable: Mutex<Option<Box<dyn FnOnce() -> std::result::Result<T, TaskFailure> + Send>>>,
}

impl<T> Task<T> {
    pub fn new(
        callable: impl FnOnce() -> std::result::Result<T, TaskFailure> + Send + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            callable: Mutex::new(Some(Box::new(callable))),
        }
    }

    pub fn handle(&self) -> JoinHandle<T> {
        JoinHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel_token.clone()
    }

    /// Executes the task at most once. A no-op if the task was already
    /// claimed by another runner, or already terminal (cancelled before
    /// it ever ran).
    pub fn run(&self) {
        {
            let mut runner = self.shared.runner.lock();
            if runner.is_some() || self.shared.state.load(Ordering::Acquire) != NEW {
                return;
            }
            *runner = Some(std::thread::current());
        }

        let callable = self.callable.lock().take();
        let Some(callable) = callable else { return };

        match std::panic::catch_unwind(AssertUnwindSafe(callable)) {
            Ok(Ok(value)) => self.shared.complete(Outcome::Value(Arc::new(value)), NORMAL),
            Ok(Err(failure)) => self
                .shared
                .complete(Outcome::Failure(Arc::new(failure)), EXCEPTIONAL),
            Err(panic) => self.shared.complete(
                Outcome::Failure(Arc::new(TaskFailure::Panic(panic))),
                EXCEPTIONAL,
            ),
        }

        // If a concurrent cancel(true) is mid-delivery, wait for it to
        // finish landing INTERRUPTED before this thread moves on (and
        // potentially gets reused and receives a stray wakeup).
        while self.shared.state.load(Ordering::Acquire) == INTERRUPTING {
            std::thread::yield_now();
        }
    }
}

#[cfg(feature = "async")]
mod r#async {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::Ordering;
    use std::task::{Context, Poll};

    use super::{JoinHandle, Result, COMPLETING};

    impl<T> Future for JoinHandle<T> {
        type Output = Result<std::sync::Arc<T>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let shared = &self.shared;

            let state = shared.state.load(Ordering::Acquire);
            if state > COMPLETING {
                return Poll::Ready(shared.read_outcome(state));
            }

            // Register before the recheck: a completion landing between
            // the first load above and this registration would otherwise
            // be missed, since `complete` only wakes wakers registered
            // before its `wake_all`/`waker.wake()` call.
            shared.waker.register(cx.waker());

            let state = shared.state.load(Ordering::Acquire);
            if state > COMPLETING {
                // Completed in the gap between the two loads: self-wake
                // so the executor polls again rather than parking a task
                // that will never be woken again.
                cx.waker().wake_by_ref();
                return Poll::Ready(shared.read_outcome(state));
            }

            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn completes_normally_and_is_readable_by_many_waiters() {
        let task = Task::new(|| Ok::<_, TaskFailure>(42));
        let h1 = task.handle();
        let h2 = task.handle();
        task.run();
        assert!(h1.is_done());
        assert_eq!(*h1.get().unwrap(), 42);
        assert_eq!(*h2.get().unwrap(), 42);
    }

    #[test]
    fn cancel_before_run_prevents_execution() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let task = Task::new(move || {
            ran2.store(true, Ordering::SeqCst);
            Ok::<_, TaskFailure>(())
        });
        let handle = task.handle();
        assert!(handle.cancel(true));
        task.run();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
        assert!(handle.is_done());
        assert!(matches!(handle.get(), Err(JunctureError::Cancelled)));
    }

    #[test]
    fn second_cancel_after_completion_fails() {
        let task = Task::new(|| Ok::<_, TaskFailure>(1));
        let handle = task.handle();
        task.run();
        assert!(!handle.cancel(true));
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn get_timeout_elapses_while_task_is_slow() {
        let task = Arc::new(Task::new(|| {
            std::thread::sleep(Duration::from_millis(200));
            Ok::<_, TaskFailure>(7)
        }));
        let handle = task.handle();
        let runner = task.clone();
        std::thread::spawn(move || runner.run());
        let result = handle.get_timeout(Duration::from_millis(20));
        assert!(matches!(result, Err(JunctureError::Timeout)));
        assert_eq!(*handle.get().unwrap(), 7);
    }

    #[test]
    fn many_waiters_all_observe_completion() {
        let task = Arc::new(Task::new(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok::<_, TaskFailure>(99)
        }));
        let handle = task.handle();
        let runner = task.clone();
        std::thread::spawn(move || runner.run());

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let h = handle.clone();
                std::thread::spawn(move || *h.get().unwrap())
            })
            .collect();
        for w in waiters {
            assert_eq!(w.join().unwrap(), 99);
        }
    }

    #[test]
    fn propagates_task_error() {
        let task = Task::new(|| {
            Err::<(), _>(TaskFailure::Error(Box::new(std::io::Error::other("boom"))))
        });
        let handle = task.handle();
        task.run();
        match handle.get() {
            Err(JunctureError::ExecutionFailure(_)) => {}
            other => panic!("expected ExecutionFailure, got {other:?}"),
        }
    }

    #[test]
    fn propagates_task_panic() {
        let task = Task::new(|| -> std::result::Result<(), TaskFailure> {
            panic!("kaboom");
        });
        let handle = task.handle();
        task.run();
        match handle.get() {
            Err(JunctureError::ExecutionFailure(_)) => {}
            other => panic!("expected ExecutionFailure, got {other:?}"),
        }
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn join_handle_resolves_as_a_future_once_the_task_completes() {
        let task = Arc::new(Task::new(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok::<_, TaskFailure>(7)
        }));
        let handle = task.handle();
        let runner = task.clone();
        std::thread::spawn(move || runner.run());
        assert_eq!(*handle.await.unwrap(), 7);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn join_handle_future_resolves_immediately_if_already_done() {
        let task = Task::new(|| Ok::<_, TaskFailure>(5));
        let handle = task.handle();
        task.run();
        assert_eq!(*handle.await.unwrap(), 5);
    }
}
