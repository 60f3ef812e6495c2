//! Segmented concurrent hashmap (component I).
//!
//! Concurrency is achieved by splitting the table into `segment_count`
//! (a power of two, fixed at construction) independent segments, each
//! guarded by its own `parking_lot::Mutex`. A lookup or a write first
//! spreads the key's hash to pick a segment, then only ever touches
//! that segment's lock — readers of *other* segments are never blocked.
//!
//! Within a segment, bins are immutable, singly-linked, `Arc`-shared
//! chains: a write that changes a bin clones the chain's mutated
//! prefix and splices in the shared, untouched tail, rather than
//! mutating nodes in place. A concurrent reader that grabbed the old
//! head just before the swap still walks a perfectly valid, if stale,
//! chain. Each segment also keeps a plain `usize` count that every
//! write bumps *after* publishing the new bin array (a release store)
//! and every size-sensitive reader loads first (an acquire load) purely
//! as a read barrier: it does not itself need to be exact, since
//! `len()` is only ever a snapshot estimate on a live map.

mod segment;

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use crate::error::{JunctureError, Result};

pub use segment::Iter;
use segment::Segment;

const DEFAULT_SEGMENT_COUNT: usize = 16;
const DEFAULT_INITIAL_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// The default hasher is `std`'s `RandomState`-backed SipHash, the same
/// choice `std::collections::HashMap` makes, rather than a faster
/// non-cryptographic hash: this crate has no grounds to assume its
/// callers trust their key distribution against hash-flooding attacks
/// any less than the standard collections do.
pub struct ConcurrentHashMap<K, V, S = std::collections::hash_map::RandomState> {
    segments: Box<[Segment<K, V>]>,
    hash_builder: S,
    /// `segments.len() - 1`; segment count is a power of two so this
    /// masks a spread hash down to a segment index without a modulo.
    segment_mask: usize,
}

/// Tunable construction parameters: initial capacity, load factor, and
/// desired concurrency level, mirroring a three-argument hash-map
/// constructor.
#[derive(Debug, Clone, Copy)]
pub struct MapConfig {
    pub initial_capacity: usize,
    pub load_factor: f32,
    pub concurrency_level: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: DEFAULT_SEGMENT_COUNT,
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_capacity == 0 {
            return Err(JunctureError::InvalidArgument(
                "initial_capacity must be positive".into(),
            ));
        }
        if !(self.load_factor.is_finite() && self.load_factor > 0.0) {
            return Err(JunctureError::InvalidArgument(
                "load_factor must be a positive finite number".into(),
            ));
        }
        if self.concurrency_level == 0 {
            return Err(JunctureError::InvalidArgument(
                "concurrency_level must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn next_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

/// Spreads a raw hash so that keys differing only in high bits (which a
/// small segment-mask would otherwise ignore entirely) still land in
/// different segments: XORs the hash with its own upper half before
/// masking. Mirrors the "supplemental hash function" every segmented
/// hash table in this family applies before indexing.
fn spread(hash: u64) -> u64 {
    hash ^ (hash >> 16)
}

impl<K, V> ConcurrentHashMap<K, V, std::collections::hash_map::RandomState>
where
    K: Hash + Eq,
{
    pub fn new() -> Self {
        Self::with_config(MapConfig::default()).expect("default config is always valid")
    }
}

impl<K, V> Default for ConcurrentHashMap<K, V, std::collections::hash_map::RandomState>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    pub fn with_config(config: MapConfig) -> Result<Self> {
        config.validate()?;
        Self::with_config_and_hasher(config, S::default())
    }
}

impl<K, V, S> ConcurrentHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub fn with_config_and_hasher(config: MapConfig, hash_builder: S) -> Result<Self> {
        config.validate()?;
        let segment_count = next_power_of_two(config.concurrency_level);
        let per_segment_capacity =
            next_power_of_two((config.initial_capacity / segment_count).max(1));
        let segments = (0..segment_count)
            .map(|_| Segment::new(per_segment_capacity, config.load_factor))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            segments,
            hash_builder,
            segment_mask: segment_count - 1,
        })
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        spread(hasher.finish())
    }

    fn segment_for(&self, hash: u64) -> &Segment<K, V> {
        &self.segments[(hash as usize) & self.segment_mask]
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.hash_of(key);
        self.segment_for(hash).get(hash, key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Best-effort, `O(n)`: unlike `get`, there is no hash to pick a
    /// single segment or bin, so this walks every segment's chains in
    /// turn and returns as soon as a value `eq`-matches. Like every
    /// other read here, it never blocks a concurrent writer and may
    /// miss a value inserted mid-scan or see one already removed.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.segments.iter().any(|s| s.contains_value(value))
    }

    pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
        let hash = self.hash_of(&key);
        self.segment_for(hash).insert(hash, key, Arc::new(value))
    }

    /// Inserts only if `key` is currently absent; returns the existing
    /// value on failure rather than overwriting it. Atomic with respect
    /// to every other write on the same segment (single segment-lock
    /// hold covers the whole check-then-act).
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let hash = self.hash_of(&key);
        self.segment_for(hash)
            .put_if_absent(hash, key, Arc::new(value))
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.hash_of(key);
        self.segment_for(hash).remove(hash, key)
    }

    /// Removes `key` only if it currently maps to a value `eq`-equal to
    /// `value`.
    pub fn remove_if(&self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        let hash = self.hash_of(key);
        self.segment_for(hash).remove_if(hash, key, value)
    }

    /// Replaces `key`'s mapping only if it currently maps to a value
    /// `eq`-equal to `old`.
    pub fn replace_if(&self, key: &K, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let hash = self.hash_of(key);
        self.segment_for(hash)
            .replace_if(hash, key, old, Arc::new(new))
    }

    /// Replaces `key`'s mapping unconditionally, only if it is already
    /// present; returns the previous value.
    pub fn replace(&self, key: &K, new: V) -> Option<Arc<V>> {
        let hash = self.hash_of(key);
        self.segment_for(hash).replace(hash, key, Arc::new(new))
    }

    /// Approximate size: the sum of each segment's read-barrier count,
    /// taken one segment at a time without a global lock. Concurrent
    /// writers mean this can be stale the instant it returns; this is
    /// a documented, accepted weakness of segmented counting, not a
    /// bug.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties every segment in turn, each under its own write lock.
    /// Not atomic across the map as a whole: a reader or writer
    /// touching a segment this call hasn't reached yet still sees its
    /// old contents, the same per-segment independence every other
    /// mutating operation here has.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// A weakly consistent snapshot iterator: it reflects whatever
    /// state each segment happened to be in when the iterator walked
    /// past it, never blocks a concurrent writer, and never panics on
    /// concurrent modification, but may reflect insertions/removals
    /// made after the iterator was created and is not guaranteed to
    /// reflect every one made before it.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.segments)
    }

    /// Key-only view over the same weakly consistent snapshot `iter`
    /// would produce.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_
    where
        K: Clone,
    {
        self.iter().map(|(k, _)| k)
    }

    /// Value-only view over the same weakly consistent snapshot `iter`
    /// would produce.
    pub fn values(&self) -> impl Iterator<Item = Arc<V>> + '_
    where
        K: Clone,
    {
        self.iter().map(|(_, v)| v)
    }

    /// Alias for [`ConcurrentHashMap::iter`], named to match the
    /// key/value/entry view triad most hash-table APIs expose.
    pub fn entries(&self) -> Iter<'_, K, V> {
        self.iter()
    }
}

unsafe impl<K: Send, V: Send, S: Send> Send for ConcurrentHashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for ConcurrentHashMap<K, V, S> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn insert_then_get_roundtrips() {
        let map = ConcurrentHashMap::new();
        map.insert("a", 1);
        assert_eq!(*map.get(&"a").unwrap(), 1);
        assert_eq!(map.get(&"missing"), None);
    }

    #[test]
    fn insert_returns_previous_value() {
        let map = ConcurrentHashMap::new();
        assert_eq!(map.insert("a", 1), None);
        assert_eq!(*map.insert("a", 2).unwrap(), 1);
        assert_eq!(*map.get(&"a").unwrap(), 2);
    }

    #[test]
    fn put_if_absent_does_not_overwrite() {
        let map = ConcurrentHashMap::new();
        assert_eq!(map.put_if_absent("a", 1), None);
        assert_eq!(*map.put_if_absent("a", 2).unwrap(), 1);
        assert_eq!(*map.get(&"a").unwrap(), 1);
    }

    #[test]
    fn remove_if_checks_the_current_value() {
        let map = ConcurrentHashMap::new();
        map.insert("a", 1);
        assert!(!map.remove_if(&"a", &2));
        assert!(map.remove_if(&"a", &1));
        assert_eq!(map.get(&"a"), None);
    }

    #[test]
    fn replace_if_is_compare_and_swap() {
        let map = ConcurrentHashMap::new();
        map.insert("a", 1);
        assert!(!map.replace_if(&"a", &99, 2));
        assert!(map.replace_if(&"a", &1, 2));
        assert_eq!(*map.get(&"a").unwrap(), 2);
    }

    #[test]
    fn len_reflects_insertions_and_removals() {
        let map = ConcurrentHashMap::new();
        assert_eq!(map.len(), 0);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.len(), 2);
        map.remove(&"a");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn contains_value_finds_a_match_and_misses_a_removed_one() {
        let map = ConcurrentHashMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        assert!(map.contains_value(&2));
        assert!(!map.contains_value(&99));
        map.remove(&"b");
        assert!(!map.contains_value(&2));
    }

    #[test]
    fn clear_empties_every_segment() {
        let map = ConcurrentHashMap::new();
        for i in 0..50 {
            map.insert(i, i);
        }
        assert_eq!(map.len(), 50);
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        assert_eq!(map.get(&0), None);
        map.insert(0, 7);
        assert_eq!(*map.get(&0).unwrap(), 7);
    }

    #[test]
    fn iterator_sees_every_key_inserted_before_it_was_built() {
        let map = ConcurrentHashMap::new();
        for i in 0..50 {
            map.insert(i, i * 10);
        }
        let mut seen: Vec<_> = map.iter().map(|(k, _)| k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    /// End-to-end scenario 4 from spec §8: 8 writer threads each insert
    /// a disjoint key range concurrently; afterward every key must be
    /// present with the value its writer stored, and `len()` must match
    /// the total exactly once all writers have joined.
    #[test]
    fn concurrent_writers_each_own_a_disjoint_key_range() {
        let map = Arc::new(ConcurrentHashMap::new());
        let writers = 8;
        let per_writer = 500;
        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let map = map.clone();
                thread::spawn(move || {
                    for i in 0..per_writer {
                        let key = w * per_writer + i;
                        map.insert(key, key * 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), writers * per_writer);
        for w in 0..writers {
            for i in 0..per_writer {
                let key = w * per_writer + i;
                assert_eq!(*map.get(&key).unwrap(), key * 2);
            }
        }
    }

    #[test]
    fn replace_if_races_resolve_to_exactly_one_winner() {
        let map = Arc::new(ConcurrentHashMap::new());
        map.insert("counter", 0);
        let wins = StdArc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let map = map.clone();
                let wins = wins.clone();
                thread::spawn(move || {
                    loop {
                        let current = *map.get(&"counter").unwrap();
                        if current >= 1 {
                            break;
                        }
                        if map.replace_if(&"counter", &0, 1) {
                            wins.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(*map.get(&"counter").unwrap(), 1);
    }

    #[test]
    fn keys_values_and_entries_agree_with_iter() {
        let map = ConcurrentHashMap::new();
        for i in 0..20 {
            map.insert(i, i * 10);
        }
        let mut keys: Vec<_> = map.keys().collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..20).collect::<Vec<_>>());

        let mut values: Vec<_> = map.values().map(|v| *v).collect();
        values.sort_unstable();
        assert_eq!(values, (0..20).map(|i| i * 10).collect::<Vec<_>>());

        let mut entries: Vec<_> = map.entries().map(|(k, v)| (k, *v)).collect();
        entries.sort_unstable();
        assert_eq!(
            entries,
            (0..20).map(|i| (i, i * 10)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn rejects_invalid_config() {
        let err = ConcurrentHashMap::<i32, i32>::with_config(MapConfig {
            initial_capacity: 0,
            ..Default::default()
        });
        assert!(matches!(err, Err(JunctureError::InvalidArgument(_))));
    }
}
