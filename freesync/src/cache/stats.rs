use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Debug)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
  #[inline]
  pub fn increment(&self) {
    self.add(1);
  }

  #[inline]
  pub fn add(&self, value: u64) {
    self.0.fetch_add(value, Ordering::Relaxed);
  }

  #[inline]
  pub fn value(&self) -> u64 {
    self.0.load(Ordering::Relaxed)
  }
}

/// Live counters owned by a cache.
#[derive(Default, Debug)]
pub(crate) struct Counters {
  pub hits: Counter,
  pub misses: Counter,
  pub stores: Counter,
  pub promotions: Counter,
  pub chunks_created: Counter,
  pub chunks_evicted: Counter,
  pub keys_evicted: Counter,
}

impl Counters {
  pub fn snapshot(&self) -> CacheStats {
    CacheStats {
      hits: self.hits.value(),
      misses: self.misses.value(),
      stores: self.stores.value(),
      promotions: self.promotions.value(),
      chunks_created: self.chunks_created.value(),
      chunks_evicted: self.chunks_evicted.value(),
      keys_evicted: self.keys_evicted.value(),
    }
  }
}

/// A point-in-time copy of a cache's counters.
///
/// Counters are updated with relaxed atomics so a snapshot taken while
/// other threads are using the cache may be slightly inconsistent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Lookups through `load` that found their key.
  pub hits: u64,
  /// Lookups through `load` that did not.
  pub misses: u64,
  pub stores: u64,
  /// Entries recorded into a newer chunk, including the first recording
  /// made by `store`.
  pub promotions: u64,
  pub chunks_created: u64,
  pub chunks_evicted: u64,
  /// Keys removed from the map because their chunk was evicted.
  pub keys_evicted: u64,
}

impl CacheStats {
  /// Fraction of `load` calls that were hits, or 0 if there were none.
  pub fn hit_ratio(&self) -> f64 {
    match self.hits + self.misses {
      0 => 0.0,
      total => self.hits as f64 / total as f64,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_copies_counters() {
    let counters = Counters::default();
    counters.hits.add(3);
    counters.misses.increment();
    counters.keys_evicted.add(10);

    let stats = counters.snapshot();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.keys_evicted, 10);
    assert_eq!(stats.hit_ratio(), 0.75);
  }

  #[test]
  fn hit_ratio_without_lookups() {
    assert_eq!(CacheStats::default().hit_ratio(), 0.0);
  }
}
