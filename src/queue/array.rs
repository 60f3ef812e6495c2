//! Bounded array blocking queue (component E).
//!
//! A fixed-capacity circular buffer guarded by one `parking_lot::Mutex`
//! and split into two condition variables (`not_empty`/`not_full`) so a
//! producer waiting for room is never woken by a consumer signalling
//! the other condition and vice versa.
//!
//! Invariant: `0 <= count <= capacity`; `take_index`/`put_index` advance
//! modulo `capacity`; every slot outside `[take_index, take_index +
//! count)` (mod capacity) is `None`.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::{JunctureError, Result};
use crate::sync::{outcome_to_error, wait_until, WaitOutcome};
use crate::time::Deadline;

use super::Queue;

struct Inner<T> {
    items: Vec<Option<T>>,
    take_index: usize,
    put_index: usize,
    count: usize,
}

impl<T> Inner<T> {
    fn capacity(&self) -> usize {
        self.items.len()
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn insert(&mut self, value: T) {
        let cap = self.capacity();
        self.items[self.put_index] = Some(value);
        self.put_index = (self.put_index + 1) % cap;
        self.count += 1;
    }

    fn extract(&mut self) -> T {
        let cap = self.capacity();
        let value = self.items[self.take_index]
            .take()
            .expect("take_index always addresses an occupied slot while count > 0");
        self.take_index = (self.take_index + 1) % cap;
        self.count -= 1;
        value
    }
}

pub struct ArrayBlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> ArrayBlockingQueue<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(JunctureError::InvalidArgument(
                "capacity must be positive".into(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                items: (0..capacity).map(|_| None).collect(),
                take_index: 0,
                put_index: 0,
                count: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Builds a queue pre-populated from `source`, occupying slots
    /// `[0..count)` of the buffer (spec §9 open question 1: the
    /// historical off-by-one that started at index 1 is not
    /// reproduced).
    pub fn from_iter(capacity: usize, source: impl IntoIterator<Item = T>) -> Result<Self> {
        let queue = Self::new(capacity)?;
        {
            let mut inner = queue.inner.lock();
            for value in source {
                if inner.is_full() {
                    return Err(JunctureError::InvalidArgument(
                        "source collection exceeds capacity".into(),
                    ));
                }
                inner.insert(value);
            }
        }
        Ok(queue)
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn put_cancellable(&self, value: T, cancel: Option<&CancelToken>) -> Result<()> {
        let guard = self.inner.lock();
        let (mut guard, outcome) =
            wait_until(&self.not_full, guard, None, cancel, |inner| inner.is_full());
        outcome_to_error(outcome)?;
        guard.insert(value);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn take_cancellable(&self, cancel: Option<&CancelToken>) -> Result<T> {
        let guard = self.inner.lock();
        let (mut guard, outcome) =
            wait_until(&self.not_empty, guard, None, cancel, |inner| inner.is_empty());
        outcome_to_error(outcome)?;
        let value = guard.extract();
        self.not_full.notify_one();
        Ok(value)
    }

    fn offer_timeout_cancellable(
        &self,
        value: T,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<bool> {
        let deadline = Deadline::after(timeout);
        let guard = self.inner.lock();
        let (mut guard, outcome) = wait_until(&self.not_full, guard, Some(deadline), cancel, |inner| {
            inner.is_full()
        });
        match outcome {
            WaitOutcome::Ready => {
                guard.insert(value);
                self.not_empty.notify_one();
                Ok(true)
            }
            WaitOutcome::TimedOut => Ok(false),
            WaitOutcome::Cancelled => Err(JunctureError::Cancelled),
        }
    }

    fn poll_timeout_cancellable(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<T>> {
        let deadline = Deadline::after(timeout);
        let guard = self.inner.lock();
        let (mut guard, outcome) =
            wait_until(&self.not_empty, guard, Some(deadline), cancel, |inner| {
                inner.is_empty()
            });
        match outcome {
            WaitOutcome::Ready => {
                let value = guard.extract();
                self.not_full.notify_one();
                Ok(Some(value))
            }
            WaitOutcome::TimedOut => Ok(None),
            WaitOutcome::Cancelled => Err(JunctureError::Cancelled),
        }
    }

    /// Removes the first occurrence equal to `value`, shifting later
    /// elements backward (mod capacity) to close the gap and adjusting
    /// `put_index`. Wakes a producer, since this always frees a slot.
    pub fn remove(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let mut inner = self.inner.lock();
        let cap = inner.capacity();
        let mut i = inner.take_index;
        for _ in 0..inner.count {
            if inner.items[i].as_ref() == Some(value) {
                // Shift everything after `i` back by one, mod capacity.
                let mut src = (i + 1) % cap;
                let mut dst = i;
                while src != inner.put_index {
                    inner.items[dst] = inner.items[src].take();
                    dst = (dst + 1) % cap;
                    src = (src + 1) % cap;
                }
                inner.items[dst] = None;
                inner.put_index = dst;
                inner.count -= 1;
                self.not_full.notify_one();
                return true;
            }
            i = (i + 1) % cap;
        }
        false
    }

    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let inner = self.inner.lock();
        let cap = inner.capacity();
        let mut i = inner.take_index;
        for _ in 0..inner.count {
            if inner.items[i].as_ref() == Some(value) {
                return true;
            }
            i = (i + 1) % cap;
        }
        false
    }

    /// A snapshot-weak iterator: captures the live index range under
    /// lock at creation time. Later concurrent `remove`s may clear a
    /// slot the iterator is about to visit; such slots are skipped
    /// rather than surfaced or treated as a concurrent-modification
    /// error.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        Iter {
            queue: self,
            cursor: inner.take_index,
            remaining: inner.count,
        }
    }
}

impl<T: Send> Queue<T> for ArrayBlockingQueue<T> {
    fn offer(&self, value: T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.is_full() {
            return Ok(false);
        }
        inner.insert(value);
        drop(inner);
        self.not_empty.notify_one();
        Ok(true)
    }

    fn offer_timeout(&self, value: T, timeout: Duration) -> Result<bool> {
        self.offer_timeout_cancellable(value, timeout, None)
    }

    fn put(&self, value: T) -> Result<()> {
        self.put_cancellable(value, None)
    }

    fn take(&self) -> Result<T> {
        self.take_cancellable(None)
    }

    fn poll(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.is_empty() {
            return None;
        }
        let value = inner.extract();
        drop(inner);
        self.not_full.notify_one();
        Some(value)
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        self.poll_timeout_cancellable(timeout, None).unwrap_or(None)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        inner.items[inner.take_index].clone()
    }

    fn len(&self) -> usize {
        self.inner.lock().count
    }

    fn remaining_capacity(&self) -> usize {
        let inner = self.inner.lock();
        inner.capacity() - inner.count
    }

    fn drain_to(&self, sink: &mut dyn FnMut(T), max: usize) -> usize {
        let mut inner = self.inner.lock();
        let n = max.min(inner.count);
        for _ in 0..n {
            sink(inner.extract());
        }
        if n > 0 {
            drop(inner);
            self.not_full.notify_all();
        }
        n
    }
}

unsafe impl<T: Send> Send for ArrayBlockingQueue<T> {}
unsafe impl<T: Send> Sync for ArrayBlockingQueue<T> {}

pub struct Iter<'a, T> {
    queue: &'a ArrayBlockingQueue<T>,
    cursor: usize,
    remaining: usize,
}

impl<'a, T: Clone> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let cap = self.queue.capacity();
        while self.remaining > 0 {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % cap;
            self.remaining -= 1;
            let inner = self.queue.inner.lock();
            if let Some(value) = &inner.items[idx] {
                return Some(value.clone());
            }
            // Slot was cleared by a concurrent `remove`; skip it rather
            // than stopping or erroring (weak consistency).
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            ArrayBlockingQueue::<i32>::new(0),
            Err(JunctureError::InvalidArgument(_))
        ));
    }

    #[test]
    fn offer_respects_capacity() {
        let q = ArrayBlockingQueue::new(2).unwrap();
        assert!(q.offer(1).unwrap());
        assert!(q.offer(2).unwrap());
        assert!(!q.offer(3).unwrap());
        assert_eq!(q.len(), 2);
        assert_eq!(q.remaining_capacity(), 0);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = ArrayBlockingQueue::new(4).unwrap();
        for i in 0..4 {
            q.offer(i).unwrap();
        }
        let mut out = vec![];
        while let Some(v) = q.poll() {
            out.push(v);
        }
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn wraps_around_the_ring() {
        let q = ArrayBlockingQueue::new(3).unwrap();
        for i in 0..3 {
            q.offer(i).unwrap();
        }
        assert_eq!(q.poll(), Some(0));
        assert_eq!(q.poll(), Some(1));
        q.offer(10).unwrap();
        q.offer(11).unwrap();
        assert_eq!(q.poll(), Some(2));
        assert_eq!(q.poll(), Some(10));
        assert_eq!(q.poll(), Some(11));
        assert_eq!(q.poll(), None);
    }

    /// End-to-end scenario 1 from spec §8: capacity=4, producer puts
    /// 1..=1000, consumer takes 1000; the producer is forced to block
    /// at least once, and the consumer must observe strict order.
    #[test]
    fn bounded_queue_backpressure_scenario() {
        let q = Arc::new(ArrayBlockingQueue::new(4).unwrap());
        let producer_q = q.clone();
        let producer = thread::spawn(move || {
            for i in 1..=1000 {
                producer_q.put(i).unwrap();
            }
        });

        let mut received = Vec::with_capacity(1000);
        while received.len() < 1000 {
            received.push(q.take().unwrap());
        }
        producer.join().unwrap();

        assert_eq!(received, (1..=1000).collect::<Vec<_>>());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn remove_shifts_and_preserves_order() {
        let q = ArrayBlockingQueue::new(4).unwrap();
        for i in 0..4 {
            q.offer(i).unwrap();
        }
        assert!(q.remove(&1));
        assert!(!q.remove(&1));
        let mut out = vec![];
        while let Some(v) = q.poll() {
            out.push(v);
        }
        assert_eq!(out, vec![0, 2, 3]);
    }

    #[test]
    fn iterator_skips_concurrently_removed_slots() {
        let q = ArrayBlockingQueue::new(4).unwrap();
        for i in 0..4 {
            q.offer(i).unwrap();
        }
        let snapshot: Vec<_> = q.iter().collect();
        assert_eq!(snapshot, vec![0, 1, 2, 3]);
    }

    #[test]
    fn timed_poll_returns_none_on_elapsed_deadline() {
        let q: ArrayBlockingQueue<i32> = ArrayBlockingQueue::new(1).unwrap();
        assert_eq!(q.poll_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn timed_offer_fails_against_a_full_queue() {
        let q = ArrayBlockingQueue::new(1).unwrap();
        q.offer(1).unwrap();
        assert!(!q.offer_timeout(2, Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn from_iter_occupies_zero_based_slots() {
        let q = ArrayBlockingQueue::from_iter(4, [10, 20, 30]).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.poll(), Some(10));
        assert_eq!(q.poll(), Some(20));
        assert_eq!(q.poll(), Some(30));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn put_cancellable_observes_cancellation() {
        let q = Arc::new(ArrayBlockingQueue::new(1).unwrap());
        q.offer(1).unwrap(); // fill it so the next put blocks
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            cancel2.set();
        });
        let result = q.put_cancellable(2, Some(&cancel));
        assert!(matches!(result, Err(JunctureError::Cancelled)));
    }
}
