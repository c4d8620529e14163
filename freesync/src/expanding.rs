//! Append-only array that grows by publishing new generations of segments.

use std::{fmt, sync::Arc};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;

use crate::{segment::empty_slots, Segment};

/// Capacity of the first segment.
const FIRST_SEGMENT: usize = 8;
/// Segments stop doubling once they reach this size.
const MAX_SEGMENT: usize = 1024;
/// Number of segments with doubling capacities (8 through 512).
const DOUBLING_SEGMENTS: usize = 7;
/// Combined capacity of all the doubling segments.
const DOUBLING_CAPACITY: usize = FIRST_SEGMENT * ((1 << DOUBLING_SEGMENTS) - 1);

const fn log2(x: usize) -> usize {
  (usize::BITS - 1 - x.leading_zeros()) as usize
}

/// Capacity of the segment at position `segment`.
pub(crate) const fn segment_capacity(segment: usize) -> usize {
  if segment < DOUBLING_SEGMENTS {
    FIRST_SEGMENT << segment
  } else {
    MAX_SEGMENT
  }
}

/// Global index of the first slot within the segment at position `segment`.
pub(crate) const fn segment_start(segment: usize) -> usize {
  if segment <= DOUBLING_SEGMENTS {
    FIRST_SEGMENT * ((1 << segment) - 1)
  } else {
    DOUBLING_CAPACITY + (segment - DOUBLING_SEGMENTS) * MAX_SEGMENT
  }
}

/// Map a global index to `(segment, offset within segment)`.
pub(crate) const fn position(index: usize) -> (usize, usize) {
  if index < DOUBLING_CAPACITY {
    let segment = log2(index / FIRST_SEGMENT + 1);
    (segment, index - segment_start(segment))
  } else {
    let rest = index - DOUBLING_CAPACITY;
    (DOUBLING_SEGMENTS + rest / MAX_SEGMENT, rest % MAX_SEGMENT)
  }
}

/// Number of segment slots in the first directory allocated.
const FIRST_DIRECTORY: usize = 4;

/// Shared table of segments. Each slot is written once, while holding the
/// grow lock, before any generation covering it is published.
type Directory<T> = Arc<[ArcSwapOption<Segment<T>>]>;

/// One immutable snapshot of the array's segment list.
///
/// A generation sees the first `len` slots of its directory. Growing
/// publishes a new generation which usually shares the same directory and
/// just covers one more slot. Only when the directory is full is a new one
/// allocated, twice as large, so the cost of copying segment pointers is
/// amortized over the grows that follow.
struct Generation<T> {
  directory: Directory<T>,
  len: usize,
}

impl<T> Generation<T> {
  fn empty() -> Self {
    Self {
      directory: empty_slots(0).into(),
      len: 0,
    }
  }

  fn capacity(&self) -> usize {
    segment_start(self.len)
  }

  fn len(&self) -> usize {
    match self.len.checked_sub(1) {
      // Every segment but the tail is full.
      Some(last) => segment_start(last) + self.with_segment(last, |tail| tail.len()),
      None => 0,
    }
  }

  fn segment(&self, segment: usize) -> Option<Arc<Segment<T>>> {
    if segment < self.len {
      self.directory[segment].load_full()
    } else {
      None
    }
  }

  fn with_segment<R>(&self, segment: usize, f: impl FnOnce(&Segment<T>) -> R) -> R {
    match &*self.directory[segment].load() {
      Some(segment) => f(segment),
      None => panic!("segment {} of a published generation is missing", segment),
    }
  }

  fn append(&self, value: Arc<T>) -> Result<usize, Arc<T>> {
    let last = match self.len.checked_sub(1) {
      Some(last) => last,
      None => return Err(value),
    };

    self
      .with_segment(last, |tail| tail.append(value))
      .map(|offset| segment_start(last) + offset)
  }

  fn grow(&self) -> Self {
    let directory = if self.len < self.directory.len() {
      Arc::clone(&self.directory)
    } else {
      let directory: Directory<T> = empty_slots(FIRST_DIRECTORY.max(self.len * 2)).into();
      for (old, new) in self.directory.iter().zip(directory.iter()) {
        new.store(old.load_full());
      }

      trace!("moved array to a directory of {} segments", directory.len());
      directory
    };

    let segment = Segment::with_capacity(segment_capacity(self.len));
    directory[self.len].store(Some(Arc::new(segment)));

    Self {
      directory,
      len: self.len + 1,
    }
  }

  fn locate<R>(&self, index: usize, f: impl FnOnce(&Segment<T>, usize) -> R) -> R {
    if self.len == 0 {
      panic!("attempted to access index {} of an empty array", index);
    }

    let (segment, offset) = position(index);
    if segment >= self.len {
      panic!(
        "index {} out of bounds for array with capacity {}",
        index,
        self.capacity()
      );
    }

    self.with_segment(segment, |segment| f(segment, offset))
  }
}

/// A growable array supporting concurrent appends, reads and updates.
///
/// Appends are lock-free as long as the current tail segment has room.
/// When it fills up, one appender takes a short lock, builds a new
/// generation with an extra tail segment and publishes it. Segments are
/// never copied or moved so an index remains valid, and refers to the same
/// slot, across every generation that follows the one it was handed out in.
///
/// Segment capacities are 8, 16, 32, ..., 512 and then 1024 for every
/// segment after that.
///
/// # Example
/// ```
/// # use freesync::ExpandingArray;
/// let array = ExpandingArray::new();
///
/// let index = array.append("hello");
/// assert_eq!(array.load(index).as_deref(), Some(&"hello"));
///
/// let old = array.update_at(index, "world");
/// assert_eq!(old.as_deref(), Some(&"hello"));
/// ```
pub struct ExpandingArray<T> {
  current: ArcSwap<Generation<T>>,
  grow: Mutex<()>,
}

impl<T> ExpandingArray<T> {
  pub fn new() -> Self {
    Self {
      current: ArcSwap::from_pointee(Generation::empty()),
      grow: Mutex::new(()),
    }
  }

  /// The number of slots that have been handed out so far.
  pub fn len(&self) -> usize {
    self.current.load().len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The number of slots allocated in the current generation.
  pub fn capacity(&self) -> usize {
    self.current.load().capacity()
  }

  /// Append a value, returning the index it was stored at.
  pub fn append(&self, value: T) -> usize {
    self.append_shared(Arc::new(value))
  }

  /// Append an already shared value, returning the index it was stored at.
  pub fn append_shared(&self, value: Arc<T>) -> usize {
    let value = match self.current.load().append(value) {
      Ok(index) => return index,
      Err(value) => value,
    };

    self.append_slow(value)
  }

  #[cold]
  fn append_slow(&self, value: Arc<T>) -> usize {
    let _guard = self.grow.lock();

    // Somebody else may have grown the array while we were waiting.
    let current = self.current.load_full();
    let value = match current.append(value) {
      Ok(index) => return index,
      Err(value) => value,
    };

    let next = current.grow();
    let index = match next.append(value) {
      Ok(index) => index,
      Err(_) => panic!("a freshly grown array rejected an append"),
    };

    trace!(
      "grew array to {} segments with capacity {}",
      next.len,
      next.capacity()
    );

    self.current.store(Arc::new(next));
    index
  }

  /// Read the value at `index`.
  ///
  /// Returns `None` if no value has been stored at `index` yet.
  ///
  /// # Panics
  /// Panics if the array is empty or if `index` is beyond its capacity.
  pub fn load(&self, index: usize) -> Option<Arc<T>> {
    self
      .current
      .load()
      .locate(index, |segment, offset| segment.load(offset))
  }

  /// Replace the value at `index`, returning the previous one.
  ///
  /// # Panics
  /// Panics if `index` has not been handed out by an append yet, since a
  /// later append would silently overwrite the value.
  pub fn update_at(&self, index: usize, value: T) -> Option<Arc<T>> {
    self.update_at_shared(index, Arc::new(value))
  }

  pub fn update_at_shared(&self, index: usize, value: Arc<T>) -> Option<Arc<T>> {
    self.current.load().locate(index, |segment, offset| {
      if offset >= segment.len() {
        panic!("attempted to update index {} before it was appended", index);
      }

      segment.update_at(offset, value)
    })
  }

  /// Iterate over `(index, value)` pairs of the current generation.
  ///
  /// Segments added after iteration starts are not visited. Within a
  /// segment, iteration moves on to the next segment as soon as it hits a
  /// slot whose append has not yet finished.
  pub fn iter(&self) -> Iter<T> {
    let generation = self.current.load_full();

    Iter {
      current: generation.segment(0),
      generation,
      segment: 0,
      offset: 0,
    }
  }
}

impl<T> Default for ExpandingArray<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> fmt::Debug for ExpandingArray<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let current = self.current.load();

    f.debug_struct("ExpandingArray")
      .field("len", &current.len())
      .field("capacity", &current.capacity())
      .field("segments", &current.len)
      .finish()
  }
}

pub struct Iter<T> {
  generation: Arc<Generation<T>>,
  /// The segment at position `segment`.
  current: Option<Arc<Segment<T>>>,
  segment: usize,
  offset: usize,
}

impl<T> Iterator for Iter<T> {
  type Item = (usize, Arc<T>);

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let segment = self.current.as_ref()?;

      if self.offset < segment.len() {
        if let Some(value) = segment.load(self.offset) {
          let index = segment_start(self.segment) + self.offset;
          self.offset += 1;
          return Some((index, value));
        }
      }

      self.segment += 1;
      self.offset = 0;
      self.current = self.generation.segment(self.segment);
    }
  }
}
