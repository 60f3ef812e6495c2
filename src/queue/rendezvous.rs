//! Rendezvous queue (component G): a zero-capacity handoff where a
//! `put` only returns once some `take` has accepted its value, and vice
//! versa. Nothing is ever resident — `len()` is always zero.
//!
//! One mutex guards two FIFO lists of waiting slots (pending puts,
//! pending takes). Matching a waiter out of the opposite list is a CAS
//! on that slot's own tri-state (`WAITING` / `MATCHED` / `CANCELLED`),
//! so a slot that a timed-out waiter is concurrently retiring can never
//! be matched twice and a match can never land on a slot whose owner
//! already gave up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::error::{JunctureError, Result};
use crate::sync::{wait_until, WaitOutcome};
use crate::time::Deadline;

use super::Queue;

const WAITING: u8 = 0;
const MATCHED: u8 = 1;
const CANCELLED: u8 = 2;

struct Slot<T> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    gate: Mutex<()>,
    condvar: Condvar,
}

impl<T> Slot<T> {
    fn new(value: Option<T>) -> Self {
        Self {
            state: AtomicU8::new(WAITING),
            value: Mutex::new(value),
            gate: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(WAITING, MATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_retire(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn wait(&self, deadline: Option<Deadline>, cancel: Option<&CancelToken>) -> WaitOutcome {
        let guard = self.gate.lock();
        let (_guard, outcome) = wait_until(&self.condvar, guard, deadline, cancel, |_| {
            self.state.load(Ordering::Acquire) == WAITING
        });
        outcome
    }

    fn wake(&self) {
        self.condvar.notify_one();
    }

    fn take_value(&self) -> T {
        self.value
            .lock()
            .take()
            .expect("a matched slot always carries exactly one value")
    }
}

#[derive(Default)]
struct Queues<T> {
    puts: VecDeque<Arc<Slot<T>>>,
    takes: VecDeque<Arc<Slot<T>>>,
}

pub struct RendezvousQueue<T> {
    queues: Mutex<Queues<T>>,
}

impl<T> RendezvousQueue<T> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                puts: VecDeque::new(),
                takes: VecDeque::new(),
            }),
        }
    }

    pub fn offer(&self, value: T) -> bool {
        let mut value = Some(value);
        let mut queues = self.queues.lock();
        while let Some(taker) = queues.takes.pop_front() {
            if taker.try_claim() {
                *taker.value.lock() = value.take();
                drop(queues);
                taker.wake();
                return true;
            }
        }
        false
    }

    pub fn poll_now(&self) -> Option<T> {
        let mut queues = self.queues.lock();
        while let Some(putter) = queues.puts.pop_front() {
            if putter.try_claim() {
                drop(queues);
                let value = putter.take_value();
                putter.wake();
                return Some(value);
            }
        }
        None
    }

    pub fn put_cancellable(
        &self,
        value: T,
        deadline: Option<Deadline>,
        cancel: Option<&CancelToken>,
    ) -> Result<bool> {
        let mut value = Some(value);
        loop {
            let mut queues = self.queues.lock();
            if let Some(taker) = queues.takes.pop_front() {
                drop(queues);
                if taker.try_claim() {
                    *taker.value.lock() = value.take();
                    taker.wake();
                    return Ok(true);
                }
                continue;
            }
            let slot = Arc::new(Slot::new(value.take()));
            queues.puts.push_back(slot.clone());
            drop(queues);

            return match slot.wait(deadline, cancel) {
                WaitOutcome::Ready => Ok(true),
                WaitOutcome::TimedOut => {
                    if slot.try_retire() {
                        Ok(false)
                    } else {
                        Ok(true)
                    }
                }
                WaitOutcome::Cancelled => {
                    if slot.try_retire() {
                        Err(JunctureError::Cancelled)
                    } else {
                        Ok(true)
                    }
                }
            };
        }
    }

    pub fn take_cancellable(
        &self,
        deadline: Option<Deadline>,
        cancel: Option<&CancelToken>,
    ) -> Result<T> {
        loop {
            let mut queues = self.queues.lock();
            if let Some(putter) = queues.puts.pop_front() {
                drop(queues);
                if putter.try_claim() {
                    let value = putter.take_value();
                    putter.wake();
                    return Ok(value);
                }
                continue;
            }
            let slot = Arc::new(Slot::new(None));
            queues.takes.push_back(slot.clone());
            drop(queues);

            return match slot.wait(deadline, cancel) {
                WaitOutcome::Ready => Ok(slot.take_value()),
                WaitOutcome::TimedOut => {
                    if slot.try_retire() {
                        Err(JunctureError::Timeout)
                    } else {
                        Ok(slot.take_value())
                    }
                }
                WaitOutcome::Cancelled => {
                    if slot.try_retire() {
                        Err(JunctureError::Cancelled)
                    } else {
                        Ok(slot.take_value())
                    }
                }
            };
        }
    }
}

impl<T> Default for RendezvousQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for RendezvousQueue<T> {
    fn offer(&self, value: T) -> Result<bool> {
        Ok(RendezvousQueue::offer(self, value))
    }

    fn offer_timeout(&self, value: T, timeout: Duration) -> Result<bool> {
        self.put_cancellable(value, Some(Deadline::after(timeout)), None)
    }

    fn put(&self, value: T) -> Result<()> {
        self.put_cancellable(value, None, None).map(|_| ())
    }

    fn take(&self) -> Result<T> {
        self.take_cancellable(None, None)
    }

    fn poll(&self) -> Option<T> {
        RendezvousQueue::poll_now(self)
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        match self.take_cancellable(Some(Deadline::after(timeout)), None) {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        None
    }

    fn len(&self) -> usize {
        0
    }

    fn remaining_capacity(&self) -> usize {
        0
    }

    /// Nothing is ever resident in a rendezvous queue to drain; draining
    /// it must not reach into a blocked putter's slot the way `poll`
    /// does, so this always reports zero moved rather than inheriting
    /// the default `poll`-loop.
    fn drain_to(&self, _sink: &mut dyn FnMut(T), _max: usize) -> usize {
        0
    }
}

unsafe impl<T: Send> Send for RendezvousQueue<T> {}
unsafe impl<T: Send> Sync for RendezvousQueue<T> {}
