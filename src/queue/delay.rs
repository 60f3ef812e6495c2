//! Delay-expiry queue (component H): a min-heap ordered by each
//! element's expiry instant, where `take`/`poll` only ever return an
//! element whose delay has already elapsed.
//!
//! Uses a leader/follower wake pattern: at most one waiter (the
//! "leader") sleeps for exactly the head's remaining delay; every other
//! waiter parks indefinitely until signalled. When the leader wakes (by
//! timeout or by a fresher, earlier-expiring head arriving) it hands
//! leadership to whoever is parked, which avoids every waiter waking on
//! every insert.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::{JunctureError, Result};
use crate::time::Deadline;

use super::Queue;

/// Implemented by elements of a [`DelayQueue`]: reports how long until
/// the element becomes eligible for removal.
pub trait Delayed {
    /// Remaining delay; `Duration::ZERO` (or less, saturated to zero)
    /// means the element is already eligible.
    fn delay(&self) -> Duration;

    /// Absolute expiry instant, used to order entries in the heap.
    /// Implementors with a stored `Instant` should derive this from it
    /// rather than from `Instant::now() + self.delay()`, so ordering
    /// stays stable across repeated calls.
    fn expiry(&self) -> Instant {
        Instant::now() + self.delay()
    }
}

struct Entry<T> {
    expiry: Instant,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry
    }
}
impl<T> Eq for Entry<T> {}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expiry.cmp(&other.expiry)
    }
}

struct Inner<T: Delayed> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    /// Whether a leader thread is currently sleeping for the head's
    /// remaining delay. `None` means anyone waking up should try to
    /// become leader.
    has_leader: bool,
}

pub struct DelayQueue<T: Delayed> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T: Delayed> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                has_leader: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn add(&self, value: T) {
        let expiry = value.expiry();
        let mut inner = self.inner.lock();
        let became_new_head = inner
            .heap
            .peek()
            .is_none_or(|Reverse(head)| expiry < head.expiry);
        inner.heap.push(Reverse(Entry { expiry, value }));
        if became_new_head {
            // The leader (if any) is sleeping for a now-stale delay;
            // wake everyone so leadership can be re-elected against the
            // new, earlier head.
            inner.has_leader = false;
            drop(inner);
            self.available.notify_all();
        }
    }

    pub fn take_cancellable(&self, cancel: Option<&CancelToken>) -> Result<T> {
        let mut inner = self.inner.lock();
        loop {
            match inner.heap.peek() {
                None => {
                    if let Some(cancel) = cancel
                        && cancel.is_set()
                    {
                        return Err(JunctureError::Cancelled);
                    }
                    self.park(&mut inner, None, cancel)?;
                }
                Some(Reverse(head)) => {
                    let now = Instant::now();
                    if head.expiry <= now {
                        let Reverse(entry) = inner.heap.pop().expect("peeked head is present");
                        if !inner.heap.is_empty() {
                            // There may be a new, earlier head; make sure
                            // someone re-evaluates leadership for it.
                            inner.has_leader = false;
                            drop(inner);
                            self.available.notify_all();
                        }
                        return Ok(entry.value);
                    }
                    if let Some(cancel) = cancel
                        && cancel.is_set()
                    {
                        return Err(JunctureError::Cancelled);
                    }
                    if inner.has_leader {
                        // Someone else owns the wake-up for the current
                        // head; park indefinitely and re-check when
                        // nudged.
                        self.park(&mut inner, None, cancel)?;
                    } else {
                        inner.has_leader = true;
                        let nap = head.expiry - now;
                        let became_leader_wait = self.park(&mut inner, Some(nap), cancel);
                        if inner.has_leader {
                            inner.has_leader = false;
                        }
                        became_leader_wait?;
                    }
                }
            }
        }
    }

    fn park(
        &self,
        inner: &mut parking_lot::MutexGuard<'_, Inner<T>>,
        nap: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        const CANCEL_POLL_TICK: Duration = Duration::from_millis(25);
        let slice = match (nap, cancel.is_some()) {
            (Some(d), true) => d.min(CANCEL_POLL_TICK),
            (Some(d), false) => d,
            (None, true) => CANCEL_POLL_TICK,
            (None, false) => {
                self.available.wait(inner);
                return Ok(());
            }
        };
        self.available.wait_for(inner, slice);
        if let Some(cancel) = cancel
            && cancel.is_set()
        {
            return Err(JunctureError::Cancelled);
        }
        Ok(())
    }

    pub fn poll_now(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        match inner.heap.peek() {
            Some(Reverse(head)) if head.expiry <= Instant::now() => {
                let Reverse(entry) = inner.heap.pop().expect("peeked head is present");
                Some(entry.value)
            }
            _ => None,
        }
    }

    pub fn peek_expiry(&self) -> Option<Instant> {
        self.inner.lock().heap.peek().map(|Reverse(e)| e.expiry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Delayed> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Delayed + Send> Queue<T> for DelayQueue<T> {
    fn offer(&self, value: T) -> Result<bool> {
        self.add(value);
        Ok(true)
    }

    fn offer_timeout(&self, value: T, _timeout: Duration) -> Result<bool> {
        // Unbounded: never blocks on insert regardless of the timeout.
        self.add(value);
        Ok(true)
    }

    fn put(&self, value: T) -> Result<()> {
        self.add(value);
        Ok(())
    }

    fn take(&self) -> Result<T> {
        self.take_cancellable(None)
    }

    fn poll(&self) -> Option<T> {
        self.poll_now()
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(value) = self.poll_now() {
                return Some(value);
            }
            if deadline.has_elapsed() {
                return None;
            }
            let mut inner = self.inner.lock();
            let remaining = deadline.remaining();
            let nap = match inner.heap.peek() {
                Some(Reverse(head)) => {
                    let head_delay = head.expiry.saturating_duration_since(Instant::now());
                    head_delay.min(remaining)
                }
                None => remaining,
            };
            self.available.wait_for(&mut inner, nap);
        }
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().heap.peek().map(|Reverse(e)| e.value.clone())
    }

    fn len(&self) -> usize {
        DelayQueue::len(self)
    }

    fn remaining_capacity(&self) -> usize {
        usize::MAX
    }
}

unsafe impl<T: Delayed + Send> Send for DelayQueue<T> {}
unsafe impl<T: Delayed + Send> Sync for DelayQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Clone, Debug, PartialEq)]
    struct Job {
        id: u32,
        at: Instant,
    }

    impl Delayed for Job {
        fn delay(&self) -> Duration {
            self.at.saturating_duration_since(Instant::now())
        }
        fn expiry(&self) -> Instant {
            self.at
        }
    }

    #[test]
    fn returns_nothing_before_any_expiry() {
        let q: DelayQueue<Job> = DelayQueue::new();
        q.add(Job {
            id: 1,
            at: Instant::now() + Duration::from_millis(50),
        });
        assert_eq!(q.poll_now(), None);
    }

    #[test]
    fn orders_by_expiry_not_insertion() {
        let q: DelayQueue<Job> = DelayQueue::new();
        let now = Instant::now();
        q.add(Job {
            id: 2,
            at: now + Duration::from_millis(5),
        });
        q.add(Job {
            id: 1,
            at: now - Duration::from_millis(5),
        });
        assert_eq!(q.take().unwrap().id, 1);
    }

    #[test]
    fn take_blocks_until_expiry() {
        let q = Arc::new(DelayQueue::new());
        q.add(Job {
            id: 7,
            at: Instant::now() + Duration::from_millis(30),
        });
        let started = Instant::now();
        let job = q.take().unwrap();
        assert_eq!(job.id, 7);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn a_fresher_earlier_head_preempts_the_sleeping_leader() {
        let q = Arc::new(DelayQueue::new());
        q.add(Job {
            id: 1,
            at: Instant::now() + Duration::from_millis(200),
        });
        let leader_q = q.clone();
        let leader = thread::spawn(move || leader_q.take().unwrap());
        thread::sleep(Duration::from_millis(10));
        q.add(Job {
            id: 2,
            at: Instant::now() + Duration::from_millis(10),
        });
        let won = leader.join().unwrap();
        assert_eq!(won.id, 2);
    }

    #[test]
    fn poll_timeout_gives_up_when_nothing_expires_in_time() {
        let q: DelayQueue<Job> = DelayQueue::new();
        q.add(Job {
            id: 1,
            at: Instant::now() + Duration::from_secs(10),
        });
        assert_eq!(q.poll_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn take_cancellable_observes_cancellation_while_sleeping_as_leader() {
        let q = Arc::new(DelayQueue::new());
        q.add(Job {
            id: 1,
            at: Instant::now() + Duration::from_secs(10),
        });
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            cancel2.set();
        });
        let result = q.take_cancellable(Some(&cancel));
        assert!(matches!(result, Err(JunctureError::Cancelled)));
    }
}
