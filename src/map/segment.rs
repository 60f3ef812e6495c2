//! A single segment of a [`super::ConcurrentHashMap`]: its own bin
//! array and its own resize threshold, independent of every other
//! segment.
//!
//! Writes serialize on this segment's own `parking_lot::Mutex`, same as
//! every other segment-local operation in this crate. Reads take no
//! lock at all: a reader first loads `count` (an acquire load paired
//! with the release store every successful write performs) and bails
//! out immediately if it is zero, then walks the bin array and the bin
//! chain entirely through `crossbeam_epoch` atomics, the same
//! published-pointer idiom the transfer queue uses for its node list.
//! A reader that grabbed a bin head or a whole bin array a moment
//! before a writer replaced it still walks a perfectly valid, if
//! stale, snapshot — the replaced generation stays alive until the
//! epoch confirms no pinned reader can still be looking at it.

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::debug;

struct Node<K, V> {
    hash: u64,
    key: Arc<K>,
    value: Arc<V>,
    next: Option<Arc<Node<K, V>>>,
}

impl<K, V> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        Node {
            hash: self.hash,
            key: self.key.clone(),
            value: self.value.clone(),
            next: self.next.clone(),
        }
    }
}

/// One generation of a segment's bin array: a fixed-size table of
/// published bin heads. A resize builds a whole new `BinArray` and
/// swaps it in; it never mutates an existing one in place, so a
/// reader holding a reference to a generation never sees it change
/// size out from under its own index arithmetic.
struct BinArray<K, V> {
    bins: Vec<Atomic<ManuallyDrop<Arc<Node<K, V>>>>>,
}

impl<K, V> BinArray<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            bins: (0..capacity).map(|_| Atomic::null()).collect(),
        }
    }

    fn bin_index(&self, hash: u64) -> usize {
        (hash as usize) & (self.bins.len() - 1)
    }

    /// Clones the bin's current head out from behind the epoch-managed
    /// slot. The clone is an ordinary refcounted `Arc`, independent of
    /// `guard` the moment this returns.
    fn load_head<'g>(&self, idx: usize, guard: &'g Guard) -> Option<Arc<Node<K, V>>> {
        let shared = self.bins[idx].load(Ordering::Acquire, guard);
        if shared.is_null() {
            return None;
        }
        let boxed: &ManuallyDrop<Arc<Node<K, V>>> = unsafe { shared.deref() };
        let arc_ref: &Arc<Node<K, V>> = boxed;
        Some(Arc::clone(arc_ref))
    }

    /// Publishes `new_head` as the bin's new head, releasing the slot's
    /// previous reference once the epoch makes that safe. Caller must
    /// already hold the segment's write lock.
    fn store_head(&self, idx: usize, new_head: Option<Arc<Node<K, V>>>, guard: &Guard) {
        let new_shared = match new_head {
            Some(arc) => Owned::new(ManuallyDrop::new(arc)).into_shared(guard),
            None => Shared::null(),
        };
        let old = self.bins[idx].swap(new_shared, Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe {
                let boxed = ptr::read(old.deref());
                guard.defer_destroy(old);
                drop(ManuallyDrop::into_inner(boxed));
            }
        }
    }
}

impl<K, V> Drop for BinArray<K, V> {
    fn drop(&mut self) {
        // Reached only once no reader can still be pinned against this
        // generation (either the segment itself is being dropped, or
        // the epoch already confirmed it safe before calling us), so
        // an unprotected guard and an immediate, non-deferred reclaim
        // of every remaining slot are both sound here.
        let guard = unsafe { epoch::unprotected() };
        for slot in &self.bins {
            let shared = slot.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                unsafe {
                    let boxed = ptr::read(shared.deref());
                    drop(ManuallyDrop::into_inner(boxed));
                    drop(shared.into_owned());
                }
            }
        }
    }
}

struct WriteState {
    threshold: usize,
    load_factor: f32,
}

pub(super) struct Segment<K, V> {
    /// The current bin-array generation. Swapped wholesale on resize;
    /// readers load it once per call and never need the write lock.
    array: Atomic<BinArray<K, V>>,
    /// Serializes writers against each other and against a resize; a
    /// reader never takes this.
    write: Mutex<WriteState>,
    /// Cache-padded so that adjacent segments in the map's boxed slice
    /// never share a cache line on this, the one field every reader
    /// touches regardless of which bin it wants.
    count: CachePadded<AtomicUsize>,
}

fn splice_insert<K: Eq, V>(
    head: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: Arc<K>,
    value: Arc<V>,
) -> (Arc<Node<K, V>>, Option<Arc<V>>) {
    match head {
        None => (
            Arc::new(Node {
                hash,
                key,
                value,
                next: None,
            }),
            None,
        ),
        Some(n) => {
            if n.hash == hash && *n.key == *key {
                (
                    Arc::new(Node {
                        hash,
                        key,
                        value,
                        next: n.next.clone(),
                    }),
                    Some(n.value.clone()),
                )
            } else {
                let (rest, old) = splice_insert(&n.next, hash, key, value);
                (
                    Arc::new(Node {
                        hash: n.hash,
                        key: n.key.clone(),
                        value: n.value.clone(),
                        next: Some(rest),
                    }),
                    old,
                )
            }
        }
    }
}

fn splice_put_if_absent<K: Eq, V>(
    head: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: Arc<K>,
    value: Arc<V>,
) -> (Option<Arc<Node<K, V>>>, Option<Arc<V>>, bool) {
    match head {
        None => (
            Some(Arc::new(Node {
                hash,
                key,
                value,
                next: None,
            })),
            None,
            true,
        ),
        Some(n) => {
            if n.hash == hash && *n.key == *key {
                (Some(n.clone()), Some(n.value.clone()), false)
            } else {
                let (rest, existing, inserted) = splice_put_if_absent(&n.next, hash, key, value);
                if !inserted {
                    return (Some(n.clone()), existing, false);
                }
                (
                    Some(Arc::new(Node {
                        hash: n.hash,
                        key: n.key.clone(),
                        value: n.value.clone(),
                        next: rest,
                    })),
                    existing,
                    true,
                )
            }
        }
    }
}

fn splice_remove<K: Eq, V>(
    head: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: &K,
) -> (Option<Arc<Node<K, V>>>, Option<Arc<V>>) {
    match head {
        None => (None, None),
        Some(n) => {
            if n.hash == hash && &*n.key == key {
                (n.next.clone(), Some(n.value.clone()))
            } else {
                let (rest, old) = splice_remove(&n.next, hash, key);
                if old.is_none() {
                    return (Some(n.clone()), None);
                }
                (
                    Some(Arc::new(Node {
                        hash: n.hash,
                        key: n.key.clone(),
                        value: n.value.clone(),
                        next: rest,
                    })),
                    old,
                )
            }
        }
    }
}

fn splice_remove_if<K: Eq, V: PartialEq>(
    head: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: &K,
    expected: &V,
) -> (Option<Arc<Node<K, V>>>, bool) {
    match head {
        None => (None, false),
        Some(n) => {
            if n.hash == hash && &*n.key == key {
                if &*n.value == expected {
                    (n.next.clone(), true)
                } else {
                    (Some(n.clone()), false)
                }
            } else {
                let (rest, removed) = splice_remove_if(&n.next, hash, key, expected);
                if !removed {
                    return (Some(n.clone()), false);
                }
                (
                    Some(Arc::new(Node {
                        hash: n.hash,
                        key: n.key.clone(),
                        value: n.value.clone(),
                        next: rest,
                    })),
                    true,
                )
            }
        }
    }
}

fn splice_replace_if<K: Eq, V: PartialEq>(
    head: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: &K,
    old: &V,
    new: Arc<V>,
) -> (Option<Arc<Node<K, V>>>, bool) {
    match head {
        None => (None, false),
        Some(n) => {
            if n.hash == hash && &*n.key == key {
                if &*n.value == old {
                    (
                        Some(Arc::new(Node {
                            hash: n.hash,
                            key: n.key.clone(),
                            value: new,
                            next: n.next.clone(),
                        })),
                        true,
                    )
                } else {
                    (Some(n.clone()), false)
                }
            } else {
                let (rest, changed) = splice_replace_if(&n.next, hash, key, old, new);
                if !changed {
                    return (Some(n.clone()), false);
                }
                (
                    Some(Arc::new(Node {
                        hash: n.hash,
                        key: n.key.clone(),
                        value: n.value.clone(),
                        next: rest,
                    })),
                    true,
                )
            }
        }
    }
}

fn splice_replace<K: Eq, V>(
    head: &Option<Arc<Node<K, V>>>,
    hash: u64,
    key: &K,
    new: Arc<V>,
) -> (Option<Arc<Node<K, V>>>, Option<Arc<V>>) {
    match head {
        None => (None, None),
        Some(n) => {
            if n.hash == hash && &*n.key == key {
                (
                    Some(Arc::new(Node {
                        hash: n.hash,
                        key: n.key.clone(),
                        value: new,
                        next: n.next.clone(),
                    })),
                    Some(n.value.clone()),
                )
            } else {
                let (rest, old) = splice_replace(&n.next, hash, key, new);
                if old.is_none() {
                    return (Some(n.clone()), None);
                }
                (
                    Some(Arc::new(Node {
                        hash: n.hash,
                        key: n.key.clone(),
                        value: n.value.clone(),
                        next: rest,
                    })),
                    old,
                )
            }
        }
    }
}

impl<K: Eq, V> Segment<K, V> {
    pub(super) fn new(capacity: usize, load_factor: f32) -> Self {
        let threshold = ((capacity as f32) * load_factor) as usize;
        let guard = &epoch::pin();
        let array = Owned::new(BinArray::new(capacity)).into_shared(guard);
        Self {
            array: Atomic::from(array),
            write: Mutex::new(WriteState {
                threshold,
                load_factor,
            }),
            count: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Lock-free: reads `count` first and bails on an empty segment,
    /// otherwise pins the epoch just long enough to load the current
    /// bin array and walk one bin's chain. Never contends with a
    /// concurrent writer on this segment.
    pub(super) fn get(&self, hash: u64, key: &K) -> Option<Arc<V>> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let idx = array.bin_index(hash);
        let mut node = array.load_head(idx, guard);
        while let Some(n) = node {
            if n.hash == hash && &*n.key == key {
                return Some(n.value.clone());
            }
            node = n.next.clone();
        }
        None
    }

    pub(super) fn insert(&self, hash: u64, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let mut state = self.write.lock();
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let idx = array.bin_index(hash);
        let head = array.load_head(idx, guard);
        let (new_head, old) = splice_insert(&head, hash, Arc::new(key), value);
        array.store_head(idx, Some(new_head), guard);
        if old.is_none() {
            self.count.fetch_add(1, Ordering::Release);
            self.maybe_resize(&mut state, array, guard);
        }
        old
    }

    pub(super) fn put_if_absent(&self, hash: u64, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let mut state = self.write.lock();
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let idx = array.bin_index(hash);
        let head = array.load_head(idx, guard);
        let (new_head, existing, inserted) =
            splice_put_if_absent(&head, hash, Arc::new(key), value);
        array.store_head(idx, new_head, guard);
        if inserted {
            self.count.fetch_add(1, Ordering::Release);
            self.maybe_resize(&mut state, array, guard);
        }
        existing
    }

    pub(super) fn remove(&self, hash: u64, key: &K) -> Option<Arc<V>> {
        let _state = self.write.lock();
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let idx = array.bin_index(hash);
        let head = array.load_head(idx, guard);
        let (new_head, old) = splice_remove(&head, hash, key);
        if old.is_none() {
            return None;
        }
        array.store_head(idx, new_head, guard);
        self.count.fetch_sub(1, Ordering::Release);
        old
    }

    pub(super) fn remove_if(&self, hash: u64, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let _state = self.write.lock();
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let idx = array.bin_index(hash);
        let head = array.load_head(idx, guard);
        let (new_head, removed) = splice_remove_if(&head, hash, key, expected);
        if !removed {
            return false;
        }
        array.store_head(idx, new_head, guard);
        self.count.fetch_sub(1, Ordering::Release);
        true
    }

    pub(super) fn replace_if(&self, hash: u64, key: &K, old: &V, new: Arc<V>) -> bool
    where
        V: PartialEq,
    {
        let _state = self.write.lock();
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let idx = array.bin_index(hash);
        let head = array.load_head(idx, guard);
        let (new_head, changed) = splice_replace_if(&head, hash, key, old, new);
        if !changed {
            return false;
        }
        array.store_head(idx, new_head, guard);
        true
    }

    pub(super) fn replace(&self, hash: u64, key: &K, new: Arc<V>) -> Option<Arc<V>> {
        let _state = self.write.lock();
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let idx = array.bin_index(hash);
        let head = array.load_head(idx, guard);
        let (new_head, old) = splice_replace(&head, hash, key, new);
        if old.is_none() {
            return None;
        }
        array.store_head(idx, new_head, guard);
        old
    }

    /// Best-effort, lock-free: walks every bin's chain in the current
    /// generation and returns as soon as a value `eq`-matches. Like
    /// `get`, never contends with a concurrent writer; unlike `get`, a
    /// miss costs a full scan since there is no hash to narrow the bin.
    pub(super) fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        if self.count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        for idx in 0..array.bins.len() {
            let mut node = array.load_head(idx, guard);
            while let Some(n) = node {
                if &*n.value == value {
                    return true;
                }
                node = n.next.clone();
            }
        }
        false
    }

    /// Empties the segment: swaps in a fresh, same-sized bin array and
    /// resets `count`, under the write lock like any other mutation.
    pub(super) fn clear(&self) {
        let _state = self.write.lock();
        let guard = &epoch::pin();
        let array = unsafe { self.array.load(Ordering::Acquire, guard).deref() };
        let len = array.bins.len();
        let old_shared = self
            .array
            .swap(Owned::new(BinArray::new(len)), Ordering::AcqRel, guard);
        unsafe {
            guard.defer_destroy(old_shared);
        }
        self.count.store(0, Ordering::Release);
    }

    /// Doubles the bin array and redistributes every node once `count`
    /// has crossed `threshold`. No longest-trailing-run optimization
    /// (reusing the tail of a bin when none of its entries' low bits
    /// change across a resize): this rebuilds every bin from scratch,
    /// simpler, and a resize is already an amortized, infrequent `O(n)`
    /// event. The old generation is handed to the epoch for deferred
    /// reclamation rather than freed here, since a reader may still be
    /// mid-walk over it.
    fn maybe_resize<'g>(&self, state: &mut WriteState, array: &BinArray<K, V>, guard: &'g Guard) {
        if self.count.load(Ordering::Relaxed) <= state.threshold {
            return;
        }
        let old_len = array.bins.len();
        let new_len = old_len * 2;
        debug!(
            old_capacity = old_len,
            new_capacity = new_len,
            "rehashing segment"
        );
        let new_array = BinArray::new(new_len);
        for idx in 0..old_len {
            let mut node = array.load_head(idx, guard);
            while let Some(n) = node {
                let new_idx = (n.hash as usize) & (new_len - 1);
                let existing = new_array.load_head(new_idx, guard);
                let relinked = Arc::new(Node {
                    hash: n.hash,
                    key: n.key.clone(),
                    value: n.value.clone(),
                    next: existing,
                });
                new_array.store_head(new_idx, Some(relinked), guard);
                node = n.next.clone();
            }
        }
        let old_shared = self
            .array
            .swap(Owned::new(new_array), Ordering::AcqRel, guard);
        unsafe {
            guard.defer_destroy(old_shared);
        }
        state.threshold = ((new_len as f32) * state.load_factor) as usize;
    }
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        // Exclusive access by construction (`&mut self`), so an
        // unprotected guard is sound here.
        let guard = unsafe { epoch::unprotected() };
        let array = self.array.load(Ordering::Relaxed, guard);
        if !array.is_null() {
            unsafe {
                drop(array.into_owned());
            }
        }
    }
}

unsafe impl<K: Send, V: Send> Send for Segment<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Segment<K, V> {}

pub struct Iter<'a, K, V> {
    bin_heads: std::vec::IntoIter<Option<Arc<Node<K, V>>>>,
    current: Option<Arc<Node<K, V>>>,
    _marker: PhantomData<&'a ()>,
}

impl<'a, K, V> Iter<'a, K, V> {
    pub(super) fn new(segments: &'a [Segment<K, V>]) -> Self {
        let guard = &epoch::pin();
        let mut bin_heads = Vec::new();
        for segment in segments {
            let array = unsafe { segment.array.load(Ordering::Acquire, guard).deref() };
            for idx in 0..array.bins.len() {
                bin_heads.push(array.load_head(idx, guard));
            }
        }
        Iter {
            bin_heads: bin_heads.into_iter(),
            current: None,
            _marker: PhantomData,
        }
    }
}

impl<'a, K: Clone, V> Iterator for Iter<'a, K, V> {
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.current.take() {
                self.current = node.next.clone();
                return Some(((*node.key).clone(), node.value.clone()));
            }
            match self.bin_heads.next() {
                Some(head) => self.current = head,
                None => return None,
            }
        }
    }
}
