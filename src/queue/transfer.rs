//! Unbounded transfer queue (component F): a FIFO queue that never
//! blocks a plain `put`/`offer` (it just buffers), but also offers a
//! `transfer` operation that blocks its caller until some consumer has
//! actually taken the value, in four modes:
//!
//! - **NOW** — [`try_transfer_now`](TransferQueue::try_transfer_now):
//!   hand off only if a consumer is already waiting; never buffers.
//! - **ASYNC** — [`put`](Queue::put)/[`offer`](Queue::offer): always
//!   buffers, the common case for this queue.
//! - **SYNC** — [`transfer`](TransferQueue::transfer) with no deadline:
//!   blocks until some consumer takes the value.
//! - **TIMED** — [`transfer`](TransferQueue::transfer) with a deadline:
//!   as SYNC, but gives up and reclaims the value if nobody takes it in
//!   time.
//!
//! This is a slack-bounded dual queue (Scherer & Scott): a single
//! singly-linked list that only ever holds nodes of one kind at a time
//! at its live front — all-data or all-request — because an arriving
//! op of the opposite kind matches the head directly via CAS instead
//! of enqueuing next to it. `head`/`tail` are plain `Atomic` pointers;
//! there is no mutex anywhere in this file. A matched or cancelled
//! node is unlinked by swinging `head` past it and self-linking its
//! `next` pointer back to itself, so a thread still holding a stale
//! reference to it notices the node is off-list rather than walking
//! into freed memory; interior cancelled nodes that the head-swing
//! can't reach directly are instead swept out once `sweep_votes`
//! crosses [`SWEEP_THRESHOLD`], mirroring the vote-gated sweep used by
//! the JDK's own `LinkedTransferQueue`. Waiting is plain spin-then-park
//! on the node's own thread handle, woken by the matching thread's
//! `unpark` — no condvar, matching the rest of this module's stated
//! invariant that the transfer queue relies on CAS and park/unpark
//! alone.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::cancel::CancelToken;
use crate::error::{JunctureError, Result};
use crate::time::Deadline;

use super::Queue;

const CANCELLED_TAG: usize = 1;
const SELF_LINK_TAG: usize = 2;
const SWEEP_THRESHOLD: u32 = 32;
const SPIN_LIMIT: u32 = 200;
const PARK_SLICE: Duration = Duration::from_millis(20);

struct Node<T> {
    /// The list always starts with one sentinel carrying no item; it
    /// is never a candidate for matching, only for "is the list empty"
    /// checks.
    sentinel: bool,
    is_data: bool,
    item: Atomic<ManuallyDrop<T>>,
    next: Atomic<Node<T>>,
    /// Fixed at construction, before the node is ever published via a
    /// CAS onto the list — never touched again, so reading it later
    /// needs no synchronization of its own.
    waiter: Option<Thread>,
}

impl<T> Node<T> {
    fn sentinel_node() -> Owned<Node<T>> {
        Owned::new(Node {
            sentinel: true,
            is_data: false,
            item: Atomic::null(),
            next: Atomic::null(),
            waiter: None,
        })
    }

    fn data(value: T, waiter: Option<Thread>) -> Owned<Node<T>> {
        Owned::new(Node {
            sentinel: false,
            is_data: true,
            item: Atomic::new(ManuallyDrop::new(value)),
            next: Atomic::null(),
            waiter,
        })
    }

    fn request(waiter: Option<Thread>) -> Owned<Node<T>> {
        Owned::new(Node {
            sentinel: false,
            is_data: false,
            item: Atomic::null(),
            next: Atomic::null(),
            waiter,
        })
    }

    /// A data node is settled once its item has been claimed (item
    /// null); a request node is settled once it has been fulfilled
    /// (item non-null). Either kind is also settled once cancelled,
    /// independent of the pointer itself.
    fn is_settled(&self, item: Shared<'_, ManuallyDrop<T>>) -> bool {
        if self.sentinel {
            return true;
        }
        if item.tag() == CANCELLED_TAG {
            return true;
        }
        if self.is_data {
            item.is_null()
        } else {
            !item.is_null()
        }
    }
}

/// Reclaims the boxed item at `ptr`: reads the value out (running
/// nothing, since it is wrapped in `ManuallyDrop`) and defers freeing
/// the backing allocation until the epoch makes that safe.
///
/// Safety: the caller must hold exclusive rights to consume `ptr`
/// exactly once — established either by winning the CAS that produced
/// it, or by protocol (only the node's own owning thread ever reads a
/// fulfilled request node's item).
unsafe fn extract<T: Send + 'static>(ptr: Shared<'_, ManuallyDrop<T>>, guard: &Guard) -> T {
    unsafe {
        let value = ptr::read(ptr.deref());
        guard.defer_destroy(ptr);
        ManuallyDrop::into_inner(value)
    }
}

/// Tries to mark a still-waiting node `CANCELLED`. Returns `true` if
/// this call won the race (and, for a data node, reclaims its
/// undelivered value); `false` means a match landed first.
fn try_cancel_node<T: Send + 'static>(node: &Node<T>, is_data: bool, guard: &Guard) -> bool {
    if is_data {
        let cur = node.item.load(Ordering::Acquire, guard);
        if cur.is_null() || cur.tag() != 0 {
            return false;
        }
        let tagged = cur.with_tag(CANCELLED_TAG);
        if node
            .item
            .compare_exchange(cur, tagged, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            let value = unsafe { extract(cur, guard) };
            drop(value);
            true
        } else {
            false
        }
    } else {
        let null_tagged = Shared::null().with_tag(CANCELLED_TAG);
        node.item
            .compare_exchange(
                Shared::null(),
                null_tagged,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }
}

enum TryMatch<T> {
    /// No opposite-mode waiter was available; the value (if this was
    /// a producer-side attempt) is handed back unchanged.
    NoMatch(Option<T>),
    MatchedData(T),
    MatchedRequest,
}

pub struct TransferQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
    sweep_votes: AtomicU32,
}

impl<T: Send + 'static> TransferQueue<T> {
    pub fn new() -> Self {
        let guard = &epoch::pin();
        let sentinel = Node::sentinel_node().into_shared(guard);
        Self {
            head: Atomic::from(sentinel),
            tail: Atomic::from(sentinel),
            sweep_votes: AtomicU32::new(0),
        }
    }

    /// Swings `head` from `old` to `new` and self-links `old`'s `next`
    /// so a thread still holding a reference to it can tell it is
    /// off-list. A losing CAS here just means another thread already
    /// advanced head; that is fine, the caller will see the new head
    /// on its next load.
    fn swing_head<'g>(&self, old: Shared<'g, Node<T>>, new: Shared<'g, Node<T>>, guard: &'g Guard) {
        if self
            .head
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            unsafe {
                let old_ref = old.deref();
                old_ref.next.store(old.with_tag(SELF_LINK_TAG), Ordering::Release);
                guard.defer_destroy(old);
            }
        }
    }

    /// Advances head past an already-settled node. Returns `false` if
    /// the node is also the tail (nothing to advance to yet) — in
    /// which case the caller should treat the queue as having nothing
    /// left to match rather than spin forever.
    fn help_unlink_settled<'g>(&self, h: Shared<'g, Node<T>>, h_ref: &Node<T>, guard: &'g Guard) -> bool {
        let next = h_ref.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            self.sweep_votes.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            self.swing_head(h, next, guard);
            self.sweep_votes.store(0, Ordering::Relaxed);
            true
        }
    }

    fn wake_and_advance<'g>(&self, h: Shared<'g, Node<T>>, h_ref: &Node<T>, guard: &'g Guard) {
        if let Some(thread) = &h_ref.waiter {
            thread.unpark();
        }
        let next = h_ref.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            self.sweep_votes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.swing_head(h, next, guard);
        }
    }

    /// A single pass: skip past any already-settled head nodes, then
    /// either match an opposite-mode head node (append phase is
    /// skipped) or report there is nothing to match (the caller then
    /// enters the append phase itself).
    fn try_match_now(&self, is_data: bool, mut value: Option<T>) -> TryMatch<T> {
        loop {
            let guard = &epoch::pin();
            let h = self.head.load(Ordering::Acquire, guard);
            let h_ref = unsafe { h.deref() };

            if h_ref.sentinel {
                let next = h_ref.next.load(Ordering::Acquire, guard);
                if next.is_null() {
                    return TryMatch::NoMatch(value);
                }
                self.swing_head(h, next, guard);
                continue;
            }

            let item = h_ref.item.load(Ordering::Acquire, guard);
            if h_ref.is_settled(item) {
                if !self.help_unlink_settled(h, h_ref, guard) {
                    return TryMatch::NoMatch(value);
                }
                continue;
            }

            if h_ref.is_data == is_data {
                return TryMatch::NoMatch(value);
            }

            if h_ref.is_data {
                match h_ref.item.compare_exchange(
                    item,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        let taken = unsafe { extract(item, guard) };
                        self.wake_and_advance(h, h_ref, guard);
                        return TryMatch::MatchedData(taken);
                    }
                    Err(_) => continue,
                }
            } else {
                let payload = value.take().expect("producer side always carries a value");
                let boxed = Owned::new(ManuallyDrop::new(payload));
                match h_ref.item.compare_exchange(
                    Shared::null(),
                    boxed,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        self.wake_and_advance(h, h_ref, guard);
                        return TryMatch::MatchedRequest;
                    }
                    Err(e) => {
                        value = Some(ManuallyDrop::into_inner(*e.new.into_box()));
                        continue;
                    }
                }
            }
        }
    }

    /// Walks from `head`, splicing out interior settled nodes so a
    /// long run of cancellations doesn't leave the list unbounded.
    /// Never unlinks the current tail.
    fn sweep(&self, guard: &Guard) {
        let mut prev = self.head.load(Ordering::Acquire, guard);
        loop {
            let prev_ref = unsafe { prev.deref() };
            let cur = prev_ref.next.load(Ordering::Acquire, guard);
            if cur.is_null() {
                break;
            }
            let cur_ref = unsafe { cur.deref() };
            let cur_item = cur_ref.item.load(Ordering::Acquire, guard);
            if cur_ref.is_settled(cur_item) {
                let cur_next = cur_ref.next.load(Ordering::Acquire, guard);
                if !cur_next.is_null()
                    && prev_ref
                        .next
                        .compare_exchange(cur, cur_next, Ordering::AcqRel, Ordering::Acquire, guard)
                        .is_ok()
                {
                    unsafe {
                        cur_ref.next.store(cur.with_tag(SELF_LINK_TAG), Ordering::Release);
                        guard.defer_destroy(cur);
                    }
                    continue;
                }
            }
            prev = cur;
        }
        self.sweep_votes.store(0, Ordering::Relaxed);
    }

    fn maybe_sweep(&self) {
        if self.sweep_votes.load(Ordering::Relaxed) >= SWEEP_THRESHOLD {
            let guard = &epoch::pin();
            self.sweep(guard);
        }
    }

    /// Lagging-tail-tolerant Michael-Scott append: publishes `node` at
    /// the end of the list, helping swing `tail` forward if another
    /// thread already linked its own node but hasn't swung `tail` yet.
    fn enqueue<'g>(&self, node: Owned<Node<T>>, guard: &'g Guard) -> Shared<'g, Node<T>> {
        let node = node.into_shared(guard);
        loop {
            let t = self.tail.load(Ordering::Acquire, guard);
            let t_ref = unsafe { t.deref() };
            let next = t_ref.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                if t_ref
                    .next
                    .compare_exchange(Shared::null(), node, Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
                {
                    let _ = self
                        .tail
                        .compare_exchange(t, node, Ordering::AcqRel, Ordering::Acquire, guard);
                    return node;
                }
            } else {
                let _ = self
                    .tail
                    .compare_exchange(t, next, Ordering::AcqRel, Ordering::Acquire, guard);
            }
        }
    }

    fn publish_data<'g>(&self, value: T, waiter: Option<Thread>, guard: &'g Guard) -> Shared<'g, Node<T>> {
        self.enqueue(Node::data(value, waiter), guard)
    }

    fn publish_request<'g>(&self, waiter: Option<Thread>, guard: &'g Guard) -> Shared<'g, Node<T>> {
        self.enqueue(Node::request(waiter), guard)
    }

    /// Await phase shared by `transfer` (`is_data = true`) and
    /// `take_cancellable` (`is_data = false`): spins briefly, then
    /// parks in short slices so a cancellation or deadline is noticed
    /// promptly, until the published node is matched, cancelled by us,
    /// or cancelled/timed out and that retirement wins the race.
    fn await_settled<'g>(
        &self,
        guard: &'g Guard,
        node: Shared<'g, Node<T>>,
        is_data: bool,
        deadline: Option<Deadline>,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<T>> {
        let node_ref = unsafe { node.deref() };
        let mut spins = 0u32;
        loop {
            let item = node_ref.item.load(Ordering::Acquire, guard);
            if is_data {
                if item.is_null() {
                    return Ok(None);
                }
            } else if !item.is_null() && item.tag() == 0 {
                let value = unsafe { extract(item, guard) };
                return Ok(Some(value));
            }
            if item.tag() == CANCELLED_TAG {
                return Err(JunctureError::Cancelled);
            }

            if cancel.is_some_and(|c| c.is_set()) {
                if try_cancel_node(node_ref, is_data, guard) {
                    return Err(JunctureError::Cancelled);
                }
                continue;
            }
            if deadline.is_some_and(|d| d.has_elapsed()) {
                if try_cancel_node(node_ref, is_data, guard) {
                    return Err(JunctureError::Timeout);
                }
                continue;
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                let park_for = deadline.map(|d| d.remaining().min(PARK_SLICE)).unwrap_or(PARK_SLICE);
                thread::park_timeout(park_for);
            }
        }
    }

    /// NOW mode: hands `value` to an already-waiting consumer, or
    /// returns it back to the caller untouched if nobody is waiting.
    /// Never buffers.
    pub fn try_transfer_now(&self, value: T) -> Option<T> {
        self.maybe_sweep();
        match self.try_match_now(true, Some(value)) {
            TryMatch::NoMatch(v) => v,
            TryMatch::MatchedRequest => None,
            TryMatch::MatchedData(_) => unreachable!("a producer attempt never claims a data node"),
        }
    }

    pub fn has_waiting_consumer(&self) -> bool {
        let guard = &epoch::pin();
        let mut cur = self.head.load(Ordering::Acquire, guard);
        loop {
            let cur_ref = unsafe { cur.deref() };
            if !cur_ref.sentinel {
                let item = cur_ref.item.load(Ordering::Acquire, guard);
                if !cur_ref.is_data && !cur_ref.is_settled(item) {
                    return true;
                }
            }
            let next = cur_ref.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return false;
            }
            cur = next;
        }
    }

    /// SYNC/TIMED mode: buffers `value` as a visible node and blocks
    /// until a consumer claims it, `deadline` elapses, or `cancel` is
    /// set. On timeout or cancellation the node is retired via a CAS
    /// on its own item slot, so a concurrent matcher and a concurrent
    /// retirement can never both win.
    pub fn transfer(&self, value: T, deadline: Option<Deadline>, cancel: Option<&CancelToken>) -> Result<bool> {
        self.maybe_sweep();
        match self.try_match_now(true, Some(value)) {
            TryMatch::MatchedRequest => Ok(true),
            TryMatch::MatchedData(_) => unreachable!("a producer attempt never claims a data node"),
            TryMatch::NoMatch(v) => {
                let value = v.expect("producer side always carries a value");
                let guard = epoch::pin();
                let node = self.publish_data(value, Some(thread::current()), &guard);
                match self.await_settled(&guard, node, true, deadline, cancel) {
                    Ok(None) => Ok(true),
                    Ok(Some(_)) => unreachable!("a producer's own await never extracts a value back out"),
                    Err(JunctureError::Timeout) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub fn take_cancellable(&self, deadline: Option<Deadline>, cancel: Option<&CancelToken>) -> Result<T> {
        self.maybe_sweep();
        match self.try_match_now(false, None) {
            TryMatch::MatchedData(value) => Ok(value),
            TryMatch::MatchedRequest => unreachable!("a consumer attempt never fulfills a request node"),
            TryMatch::NoMatch(_) => {
                let guard = epoch::pin();
                let node = self.publish_request(Some(thread::current()), &guard);
                self.await_settled(&guard, node, false, deadline, cancel)
                    .map(|v| v.expect("a fulfilled request node always carries a value"))
            }
        }
    }

    /// Approximate count of still-buffered, unmatched data nodes.
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        let mut cur = self.head.load(Ordering::Acquire, guard);
        let mut count = 0usize;
        loop {
            let cur_ref = unsafe { cur.deref() };
            if !cur_ref.sentinel {
                let item = cur_ref.item.load(Ordering::Acquire, guard);
                if cur_ref.is_data && !cur_ref.is_settled(item) {
                    count += 1;
                }
            }
            let next = cur_ref.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                break;
            }
            cur = next;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Default for TransferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TransferQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: no other thread can be pinned against this
        // queue's nodes any more, so reclaim directly instead of
        // deferring through the epoch.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                let next = cur.deref().next.load(Ordering::Relaxed, guard);
                let owned = cur.into_owned();
                let item = owned.item.load(Ordering::Relaxed, guard);
                if !item.is_null() && item.tag() == 0 {
                    let value = ManuallyDrop::into_inner(ptr::read(item.deref()));
                    drop(value);
                    drop(item.into_owned());
                }
                drop(owned);
                cur = next;
            }
        }
    }
}

impl<T: Send + 'static> Queue<T> for TransferQueue<T> {
    fn offer(&self, value: T) -> Result<bool> {
        self.maybe_sweep();
        match self.try_match_now(true, Some(value)) {
            TryMatch::MatchedRequest => Ok(true),
            TryMatch::MatchedData(_) => unreachable!("a producer attempt never claims a data node"),
            TryMatch::NoMatch(v) => {
                let value = v.expect("producer side always carries a value");
                let guard = epoch::pin();
                self.publish_data(value, None, &guard);
                Ok(true)
            }
        }
    }

    fn offer_timeout(&self, value: T, _timeout: Duration) -> Result<bool> {
        // Unbounded: an ASYNC-mode insert never needs to wait out a
        // timeout. Use `transfer` for a mode that actually waits.
        self.offer(value)
    }

    fn put(&self, value: T) -> Result<()> {
        self.offer(value).map(|_| ())
    }

    fn take(&self) -> Result<T> {
        self.take_cancellable(None, None)
    }

    fn poll(&self) -> Option<T> {
        self.maybe_sweep();
        match self.try_match_now(false, None) {
            TryMatch::MatchedData(value) => Some(value),
            TryMatch::MatchedRequest => unreachable!("a consumer attempt never fulfills a request node"),
            TryMatch::NoMatch(_) => None,
        }
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        self.take_cancellable(Some(Deadline::after(timeout)), None).ok()
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let guard = &epoch::pin();
        let mut cur = self.head.load(Ordering::Acquire, guard);
        loop {
            let cur_ref = unsafe { cur.deref() };
            if !cur_ref.sentinel {
                let item = cur_ref.item.load(Ordering::Acquire, guard);
                if cur_ref.is_data && !cur_ref.is_settled(item) {
                    let item_ref: &ManuallyDrop<T> = unsafe { item.deref() };
                    return Some(ManuallyDrop::into_inner(item_ref.clone()));
                }
            }
            let next = cur_ref.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return None;
            }
            cur = next;
        }
    }

    fn len(&self) -> usize {
        TransferQueue::len(self)
    }

    fn remaining_capacity(&self) -> usize {
        usize::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_never_blocks_and_take_drains_fifo() {
        let q = TransferQueue::new();
        for i in 0..5 {
            q.put(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.take().unwrap(), i);
        }
    }

    #[test]
    fn try_transfer_now_fails_without_a_waiting_consumer() {
        let q: TransferQueue<i32> = TransferQueue::new();
        assert_eq!(q.try_transfer_now(5), Some(5));
        // The value must not have been silently buffered.
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn try_transfer_now_succeeds_against_a_waiting_consumer() {
        let q = Arc::new(TransferQueue::new());
        let taker_q = q.clone();
        let taker = thread::spawn(move || taker_q.take());
        // Give the consumer time to register as a waiter.
        while !q.has_waiting_consumer() {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(q.try_transfer_now(9), None);
        assert_eq!(taker.join().unwrap().unwrap(), 9);
    }

    #[test]
    fn sync_transfer_blocks_until_a_consumer_arrives() {
        let q = Arc::new(TransferQueue::new());
        let sender_q = q.clone();
        let sender = thread::spawn(move || sender_q.transfer(11, None, None));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.take().unwrap(), 11);
        assert_eq!(sender.join().unwrap().unwrap(), true);
    }

    #[test]
    fn timed_transfer_reclaims_the_value_on_elapsed_deadline() {
        let q: TransferQueue<i32> = TransferQueue::new();
        let deadline = Deadline::after(Duration::from_millis(20));
        let delivered = q.transfer(1, Some(deadline), None).unwrap();
        assert!(!delivered);
        // The retired node must not still be sitting in the data queue.
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn a_buffered_item_is_visible_to_peek_before_being_taken() {
        let q = TransferQueue::new();
        q.put(3).unwrap();
        assert_eq!(q.peek(), Some(3));
        assert_eq!(q.take().unwrap(), 3);
    }

    #[test]
    fn cancellation_of_a_pending_transfer_surfaces_as_an_error() {
        let q: TransferQueue<i32> = TransferQueue::new();
        let cancel = CancelToken::new();
        cancel.set();
        let result = q.transfer(1, None, Some(&cancel));
        assert!(matches!(result, Err(JunctureError::Cancelled)));
    }

    #[test]
    fn remaining_capacity_is_unbounded() {
        let q: TransferQueue<i32> = TransferQueue::new();
        assert_eq!(q.remaining_capacity(), usize::MAX);
    }

    #[test]
    fn many_producers_and_consumers_pair_off_without_loss_or_duplication() {
        let q = Arc::new(TransferQueue::new());
        let producers = 6;
        let consumers = 6;
        let producer_handles: Vec<_> = (0..producers)
            .map(|i| {
                let q = q.clone();
                thread::spawn(move || q.transfer(i, None, None).unwrap())
            })
            .collect();
        let consumer_handles: Vec<_> = (0..consumers)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.take().unwrap())
            })
            .collect();
        for h in producer_handles {
            assert!(h.join().unwrap());
        }
        let mut got: Vec<_> = consumer_handles.into_iter().map(|h| h.join().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..producers).collect::<Vec<_>>());
        assert!(q.is_empty());
    }
}
