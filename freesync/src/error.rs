use std::{error::Error, fmt};

/// The reasons a cache configuration can be rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
  /// Each chunk must be able to hold at least one entry.
  ZeroChunkCapacity,
  /// The cache must keep at least one chunk.
  ZeroChunkCount,
  /// `chunk_capacity * chunk_count` does not fit in a `usize`.
  CapacityOverflow,
}

impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let msg = match self {
      Self::ZeroChunkCapacity => "chunk capacity must be non-zero",
      Self::ZeroChunkCount => "chunk count must be non-zero",
      Self::CapacityOverflow => "total cache capacity overflows usize",
    };

    f.write_str(msg)
  }
}

impl Error for ConfigError {}
