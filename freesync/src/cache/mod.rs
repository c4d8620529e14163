//! Key/value cache that evicts least recently used keys a chunk at a time.

mod config;
mod stats;

use std::{
  borrow::Borrow,
  fmt,
  hash::{BuildHasher, Hash},
  sync::{
    atomic::{fence, AtomicBool, AtomicU64, Ordering},
    Arc,
  },
};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use fxhash::FxBuildHasher;
use parking_lot::Mutex;

use crate::{ConfigError, RingBuffer, Segment};

pub use self::config::CacheConfig;
pub use self::stats::CacheStats;

use self::stats::Counters;

/// Chunk id of an entry that has not been recorded in any chunk yet.
const NO_CHUNK: u64 = 0;

struct Entry<K, V> {
  key: K,
  value: V,
  /// Id of the chunk that most recently accepted this entry.
  chunk: AtomicU64,
}

/// A batch of entry records that gets evicted as a unit.
struct Chunk<K, V> {
  id: u64,
  records: Segment<Entry<K, V>>,
  /// Set before the chunk's records are scanned for eviction.
  evicted: AtomicBool,
}

impl<K, V> Chunk<K, V> {
  fn new(id: u64, capacity: usize) -> Self {
    Self {
      id,
      records: Segment::with_capacity(capacity),
      evicted: AtomicBool::new(false),
    }
  }
}

/// A concurrent cache which only keeps recently used keys.
///
/// Keys are tracked in fixed-size chunks. Every store or load records the
/// entry into the newest chunk, unless it is already there. When the newest
/// chunk is full a new one is created, and once there are more than
/// `chunk_count` chunks the oldest one is dropped along with every key
/// whose most recent record was in it.
///
/// This trades exact LRU ordering for cheap access: reading a key that was
/// recently used is a map lookup plus one atomic load, and eviction happens
/// in batches of up to `chunk_capacity` keys.
///
/// # Example
/// ```
/// # use freesync::ChunkedCache;
/// let cache = ChunkedCache::new(2, 2);
///
/// cache.store("a", 1);
/// cache.store("b", 2);
/// cache.store("c", 3);
/// cache.store("d", 4);
///
/// // Filling a third chunk evicts the first one.
/// cache.store("e", 5);
/// assert_eq!(cache.load("a"), None);
/// assert_eq!(cache.load("b"), None);
/// assert_eq!(cache.load("e"), Some(5));
/// ```
pub struct ChunkedCache<K, V, S = FxBuildHasher> {
  map: DashMap<K, Arc<Entry<K, V>>, S>,
  chunks: RingBuffer<Chunk<K, V>>,
  /// The chunk most recently pushed onto `chunks`. Only written while
  /// holding `grow`, before the push that may evict an older chunk.
  newest: ArcSwapOption<Chunk<K, V>>,
  chunk_capacity: usize,
  next_chunk: AtomicU64,
  /// Held while creating a new chunk.
  grow: Mutex<()>,
  counters: Counters,
}

impl<K, V> ChunkedCache<K, V, FxBuildHasher>
where
  K: Eq + Hash + Clone,
{
  /// Create a cache holding roughly `chunk_capacity * chunk_count` keys.
  ///
  /// # Panics
  /// Panics if either argument is zero or if their product overflows.
  pub fn new(chunk_capacity: usize, chunk_count: usize) -> Self {
    match Self::with_config(CacheConfig::new(chunk_capacity, chunk_count)) {
      Ok(cache) => cache,
      Err(e) => panic!("invalid cache configuration: {}", e),
    }
  }

  pub fn with_config(config: CacheConfig) -> Result<Self, ConfigError> {
    Self::with_config_and_hasher(config, FxBuildHasher::default())
  }
}

impl<K, V, S> ChunkedCache<K, V, S>
where
  K: Eq + Hash + Clone,
  S: BuildHasher + Clone,
{
  pub fn with_config_and_hasher(config: CacheConfig, hasher: S) -> Result<Self, ConfigError> {
    config.validate()?;

    Ok(Self {
      map: DashMap::with_hasher(hasher),
      chunks: RingBuffer::new(config.chunk_count),
      newest: ArcSwapOption::empty(),
      chunk_capacity: config.chunk_capacity,
      next_chunk: AtomicU64::new(NO_CHUNK + 1),
      grow: Mutex::new(()),
      counters: Counters::default(),
    })
  }

  /// The number of keys currently in the cache.
  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  /// The approximate number of keys this cache retains.
  pub fn capacity(&self) -> usize {
    self.chunk_capacity * self.chunks.capacity()
  }

  pub fn stats(&self) -> CacheStats {
    self.counters.snapshot()
  }

  /// Store a value, replacing any previous value for the same key, and
  /// mark it as recently used.
  pub fn store(&self, key: K, value: V) {
    let entry = Arc::new(Entry {
      key: key.clone(),
      value,
      chunk: AtomicU64::new(NO_CHUNK),
    });

    self.map.insert(key, Arc::clone(&entry));
    self.counters.stores.increment();
    self.promote(&entry);
  }

  /// Look up a value and mark it as recently used.
  pub fn load<Q>(&self, key: &Q) -> Option<V>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    V: Clone,
  {
    let entry = match self.lookup(key) {
      Some(entry) => entry,
      None => {
        self.counters.misses.increment();
        return None;
      }
    };

    self.counters.hits.increment();
    self.promote(&entry);
    Some(entry.value.clone())
  }

  /// Look up a value without affecting its recency.
  pub fn peek<Q>(&self, key: &Q) -> Option<V>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    V: Clone,
  {
    self.lookup(key).map(|entry| entry.value.clone())
  }

  /// Look up a value without affecting its recency, returning a handle
  /// that can mark it as recently used later on.
  pub fn silent_load<Q>(&self, key: &Q) -> Option<(V, Promotion<'_, K, V, S>)>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    V: Clone,
  {
    let entry = self.lookup(key)?;
    let value = entry.value.clone();

    Some((value, Promotion { cache: self, entry }))
  }

  pub fn contains_key<Q>(&self, key: &Q) -> bool
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    self.map.contains_key(key)
  }

  /// Remove a key from the cache, returning its value.
  ///
  /// Any records of the key left in chunks are ignored when those chunks
  /// are evicted.
  pub fn remove<Q>(&self, key: &Q) -> Option<V>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    V: Clone,
  {
    self
      .map
      .remove(key)
      .map(|(_, entry)| entry.value.clone())
  }

  fn lookup<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
  where
    K: Borrow<Q>,
    Q: Hash + Eq + ?Sized,
  {
    // The map guard must be released before promoting, since evicting
    // may need to lock the same shard.
    self.map.get(key).map(|entry| Arc::clone(entry.value()))
  }

  /// Record `entry` in the newest chunk if it isn't already there.
  fn promote(&self, entry: &Arc<Entry<K, V>>) {
    while let Some(chunk) = self.record(entry) {
      // Pairs with the fence in `evict_chunk`. Either the eviction scan sees
      // our record or we see the chunk marked as evicted.
      fence(Ordering::SeqCst);
      if !chunk.evicted.load(Ordering::Relaxed) {
        return;
      }

      trace!("chunk {} was evicted while recording into it", chunk.id);
    }
  }

  /// Append `entry` to the newest chunk, returning that chunk. Returns
  /// `None` if the entry is already recorded there or another thread is
  /// recording it.
  fn record(&self, entry: &Arc<Entry<K, V>>) -> Option<Arc<Chunk<K, V>>> {
    let top = match self.newest.load_full() {
      Some(top) => top,
      None => return self.record_slow(entry, None),
    };

    let current = entry.chunk.load(Ordering::Acquire);
    if current == top.id {
      return None;
    }

    // Losing this race means another thread is promoting the same entry.
    if entry
      .chunk
      .compare_exchange(current, top.id, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return None;
    }

    match top.records.append(Arc::clone(entry)) {
      Ok(_) => {
        self.counters.promotions.increment();
        Some(top)
      }
      Err(_) => self.record_slow(entry, Some(&top)),
    }
  }

  /// Record `entry` into a fresh chunk unless another thread has already
  /// replaced `seen` as the newest chunk.
  #[cold]
  fn record_slow(
    &self,
    entry: &Arc<Entry<K, V>>,
    seen: Option<&Arc<Chunk<K, V>>>,
  ) -> Option<Arc<Chunk<K, V>>> {
    let (chunk, evicted) = {
      let _guard = self.grow.lock();

      // Another thread may have created a new chunk while we waited.
      if let Some(top) = self.newest.load_full() {
        let is_new = match seen {
          Some(seen) => !Arc::ptr_eq(seen, &top),
          None => true,
        };

        if is_new {
          if entry.chunk.load(Ordering::Acquire) == top.id {
            return None;
          }

          entry.chunk.store(top.id, Ordering::Release);
          if top.records.append(Arc::clone(entry)).is_ok() {
            self.counters.promotions.increment();
            return Some(top);
          }
        }
      }

      let chunk = Arc::new(Chunk::new(
        self.next_chunk.fetch_add(1, Ordering::Relaxed),
        self.chunk_capacity,
      ));

      entry.chunk.store(chunk.id, Ordering::Release);
      if chunk.records.append(Arc::clone(entry)).is_err() {
        panic!("a freshly created chunk rejected an entry");
      }

      trace!("created chunk {}", chunk.id);
      self.counters.promotions.increment();
      self.counters.chunks_created.increment();

      self.newest.store(Some(Arc::clone(&chunk)));
      let (_, evicted) = self.chunks.append_shared(Arc::clone(&chunk));
      (chunk, evicted)
    };

    if let Some(evicted) = evicted {
      self.evict_chunk(&evicted);
    }

    Some(chunk)
  }

  /// Drop every key whose most recent record is in `chunk`.
  fn evict_chunk(&self, chunk: &Chunk<K, V>) {
    chunk.evicted.store(true, Ordering::Relaxed);
    fence(Ordering::SeqCst);

    let mut removed = 0;

    // A slot may be reserved with its record not stored yet, so skip it
    // rather than stopping. Its promoter sees the flag and records again.
    for index in 0..chunk.records.capacity() {
      let record = match chunk.records.load(index) {
        Some(record) => record,
        None => continue,
      };

      // Keys promoted into a newer chunk, or stored again, are no longer
      // owned by this one and must survive.
      let owned = self.map.remove_if(&record.key, |_, current| {
        current.chunk.load(Ordering::Acquire) == chunk.id
      });

      if owned.is_some() {
        removed += 1;
      }
    }

    self.counters.chunks_evicted.increment();
    self.counters.keys_evicted.add(removed);

    debug!(
      "evicted chunk {}: removed {} of {} recorded keys",
      chunk.id,
      removed,
      chunk.records.len()
    );
  }
}

impl<K, V, S> fmt::Debug for ChunkedCache<K, V, S>
where
  K: Eq + Hash,
  S: BuildHasher + Clone,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChunkedCache")
      .field("len", &self.map.len())
      .field("chunk_capacity", &self.chunk_capacity)
      .field("chunk_count", &self.chunks.capacity())
      .finish()
  }
}

/// A deferred promotion handed out by [`ChunkedCache::silent_load`].
pub struct Promotion<'c, K, V, S> {
  cache: &'c ChunkedCache<K, V, S>,
  entry: Arc<Entry<K, V>>,
}

impl<K, V, S> Promotion<'_, K, V, S>
where
  K: Eq + Hash + Clone,
  S: BuildHasher + Clone,
{
  /// Mark the loaded entry as recently used.
  ///
  /// If the key has been stored again or removed in the meantime this only
  /// refreshes the stale entry, which has no effect on the cache contents.
  pub fn promote(self) {
    self.cache.promote(&self.entry);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_rejects_bad_config() {
    let cache = ChunkedCache::<u32, u32>::with_config(CacheConfig::new(0, 4));
    assert_eq!(cache.err(), Some(ConfigError::ZeroChunkCapacity));
  }

  #[test]
  #[should_panic(expected = "invalid cache configuration")]
  fn new_panics_on_bad_config() {
    ChunkedCache::<u32, u32>::new(4, 0);
  }

  #[test]
  fn repeated_access_stays_in_newest_chunk() {
    let cache = ChunkedCache::new(4, 2);
    cache.store(1, "one");

    for _ in 0..100 {
      assert_eq!(cache.load(&1), Some("one"));
    }

    let stats = cache.stats();
    assert_eq!(stats.promotions, 1);
    assert_eq!(stats.chunks_created, 1);
    assert_eq!(stats.hits, 100);
  }

  #[test]
  fn entry_tracks_owning_chunk() {
    let cache = ChunkedCache::new(2, 4);
    cache.store('a', 0);
    cache.store('b', 0);
    cache.store('c', 0);

    let chunk_of = |key: char| cache.lookup(&key).unwrap().chunk.load(Ordering::Relaxed);
    assert_eq!(chunk_of('a'), 1);
    assert_eq!(chunk_of('c'), 2);

    cache.load(&'a');
    assert_eq!(chunk_of('a'), 2);
  }

  #[test]
  fn eviction_skips_unstored_records() {
    let cache = ChunkedCache::new(4, 2);
    cache.store('a', 0);

    // Like a promotion that has reserved a slot but not filled it yet.
    let first = cache.newest.load_full().unwrap();
    assert_eq!(first.records.reserve(), Some(1));

    cache.store('b', 0);
    cache.store('c', 0);
    for key in "defg".chars() {
      cache.store(key, 0);
    }
    assert_eq!(cache.stats().chunks_evicted, 0);

    cache.store('h', 0);
    assert!(first.evicted.load(Ordering::Relaxed));
    for key in "abc".chars() {
      assert_eq!(cache.peek(&key), None, "key {}", key);
    }
    assert_eq!(cache.stats().keys_evicted, 3);
  }

  #[test]
  fn newest_chunk_tracks_latest_created() {
    let cache = ChunkedCache::new(3, 2);

    for key in 0..20 {
      cache.store(key, key);

      let newest = cache.newest.load_full().unwrap();
      assert_eq!(newest.id, cache.stats().chunks_created);
      assert!(Arc::ptr_eq(&newest, &cache.chunks.newbie().unwrap()));
      assert!(!newest.evicted.load(Ordering::Relaxed));
    }
  }

  #[test]
  fn single_chunk_cache() {
    let cache = ChunkedCache::new(3, 1);
    for i in 0..3 {
      cache.store(i, i);
    }

    cache.store(3, 3);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.peek(&3), Some(3));
  }
}
