use std::{
  fmt,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
};

use arc_swap::ArcSwapOption;

use crate::segment::empty_slots;

/// A fixed-capacity circular buffer that never rejects an append.
///
/// Once every slot has been written, each further append overwrites the
/// oldest slot and hands back the value it displaced.
///
/// # Example
/// ```
/// # use freesync::RingBuffer;
/// let ring = RingBuffer::new(2);
///
/// assert_eq!(ring.append(1), (0, None));
/// assert_eq!(ring.append(2), (1, None));
///
/// let (index, covered) = ring.append(3);
/// assert_eq!(index, 0);
/// assert_eq!(covered.as_deref(), Some(&1));
/// assert_eq!(ring.newbie().as_deref(), Some(&3));
/// ```
pub struct RingBuffer<T> {
  slots: Box<[ArcSwapOption<T>]>,
  /// Slot the next append will write to. Always `appends % capacity`.
  cursor: AtomicUsize,
}

impl<T> RingBuffer<T> {
  /// Create a ring buffer with room for `capacity` values.
  ///
  /// # Panics
  /// Panics if `capacity` is 0.
  pub fn new(capacity: usize) -> Self {
    assert_ne!(capacity, 0, "a ring buffer needs at least one slot");

    Self {
      slots: empty_slots(capacity),
      cursor: AtomicUsize::new(0),
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  pub fn append(&self, value: T) -> (usize, Option<Arc<T>>) {
    self.append_shared(Arc::new(value))
  }

  /// Write `value` into the next slot, returning the index written to and
  /// the value that was overwritten, if any.
  pub fn append_shared(&self, value: Arc<T>) -> (usize, Option<Arc<T>>) {
    let capacity = self.capacity();
    let mut index = self.cursor.load(Ordering::Relaxed);

    loop {
      let next = match index + 1 {
        next if next == capacity => 0,
        next => next,
      };

      match self
        .cursor
        .compare_exchange_weak(index, next, Ordering::AcqRel, Ordering::Relaxed)
      {
        Ok(_) => break,
        Err(actual) => index = actual,
      }
    }

    let covered = self.slots[index].swap(Some(value));
    (index, covered)
  }

  /// # Panics
  /// Panics if `index >= capacity()`.
  #[inline]
  pub fn load(&self, index: usize) -> Option<Arc<T>> {
    self.slots[index].load_full()
  }

  /// The most recently appended value, or `None` if nothing has been
  /// appended yet.
  ///
  /// The cursor moves before the value is written, so while an append is
  /// in flight this may return the value that append is about to cover.
  pub fn newbie(&self) -> Option<Arc<T>> {
    let index = match self.cursor.load(Ordering::Acquire) {
      0 => self.capacity() - 1,
      next => next - 1,
    };

    self.slots[index].load_full()
  }

  /// Iterate over the occupied slots in slot order.
  pub fn iter(&self) -> impl Iterator<Item = (usize, Arc<T>)> + '_ {
    self
      .slots
      .iter()
      .enumerate()
      .filter_map(|(index, slot)| slot.load_full().map(|value| (index, value)))
  }
}

impl<T> fmt::Debug for RingBuffer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RingBuffer")
      .field("cursor", &self.cursor.load(Ordering::Relaxed))
      .field("capacity", &self.capacity())
      .finish()
  }
}
