//! Containers that many threads can read and mutate at once without a
//! global lock on the hot path.
//!
//! The building block is the [`Segment`], a fixed-capacity array of
//! atomically swappable slots. On top of it sit
//! - [`ExpandingArray`], which grows by publishing new generations of
//!   segments while keeping every handed-out index valid,
//! - [`RingBuffer`], which overwrites its oldest slot once full,
//! - [`FreeList`], a lock-free FIFO used to recycle indices,
//! - [`Bag`], an unordered collection with O(1) add and delete, and
//! - [`ChunkedCache`], a key/value cache that evicts old keys a chunk at a
//!   time.

#[macro_use]
extern crate log;

mod bag;
mod cache;
mod error;
mod expanding;
mod freelist;
mod ring;
mod segment;

pub use crate::bag::{Bag, BagHandle, BagItem};
pub use crate::cache::{CacheConfig, CacheStats, ChunkedCache, Promotion};
pub use crate::error::ConfigError;
pub use crate::expanding::ExpandingArray;
pub use crate::freelist::FreeList;
pub use crate::ring::RingBuffer;
pub use crate::segment::Segment;

pub mod iter {
  //! Iterator types returned by the containers in this crate.

  pub use crate::bag::Iter as BagIter;
  pub use crate::expanding::Iter as ExpandingIter;
  pub use crate::segment::Iter as SegmentIter;
}
