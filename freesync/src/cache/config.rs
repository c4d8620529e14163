use crate::ConfigError;

/// Sizing for a [`ChunkedCache`](crate::ChunkedCache).
///
/// The cache holds roughly `chunk_capacity * chunk_count` keys and evicts
/// up to `chunk_capacity` of them at a time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
  /// Number of entry records each chunk can hold.
  pub chunk_capacity: usize,
  /// Number of chunks retained before the oldest one gets evicted.
  pub chunk_count: usize,
}

impl CacheConfig {
  pub const fn new(chunk_capacity: usize, chunk_count: usize) -> Self {
    Self {
      chunk_capacity,
      chunk_count,
    }
  }

  pub fn with_chunk_capacity(mut self, chunk_capacity: usize) -> Self {
    self.chunk_capacity = chunk_capacity;
    self
  }

  pub fn with_chunk_count(mut self, chunk_count: usize) -> Self {
    self.chunk_count = chunk_count;
    self
  }

  /// The approximate number of keys a cache with this configuration holds.
  pub fn capacity(&self) -> Option<usize> {
    self.chunk_capacity.checked_mul(self.chunk_count)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.chunk_capacity == 0 {
      return Err(ConfigError::ZeroChunkCapacity);
    }

    if self.chunk_count == 0 {
      return Err(ConfigError::ZeroChunkCount);
    }

    match self.capacity() {
      Some(_) => Ok(()),
      None => Err(ConfigError::CapacityOverflow),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self::new(1024, 64)
  }
}
