use std::{
  fmt,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
};

use arc_swap::ArcSwapOption;

/// Allocate `capacity` unset slots.
pub(crate) fn empty_slots<T>(capacity: usize) -> Box<[ArcSwapOption<T>]> {
  (0..capacity)
    .map(|_| ArcSwapOption::empty())
    .collect::<Vec<_>>()
    .into_boxed_slice()
}

/// A fixed-capacity array of slots that can be appended to, read and
/// updated concurrently without locking.
///
/// Appending reserves the next slot by advancing a write cursor and then
/// stores the value into it. The capacity of a segment never changes, once
/// the cursor reaches the end every further append is rejected and the
/// value is handed back to the caller.
///
/// Values are stored behind an [`Arc`] so that presence of the `Arc` is
/// what marks a slot as occupied. This means that any `T`, including
/// "empty" values like `None` or `()`, can be stored.
pub struct Segment<T> {
  slots: Box<[ArcSwapOption<T>]>,
  /// Index of the next slot to be reserved. Never exceeds the capacity.
  cursor: AtomicUsize,
}

impl<T> Segment<T> {
  /// Create a new, empty segment with room for `capacity` values.
  ///
  /// # Example
  /// ```
  /// # use freesync::Segment;
  /// let segment = Segment::<u32>::with_capacity(8);
  ///
  /// assert_eq!(segment.len(), 0);
  /// assert_eq!(segment.capacity(), 8);
  /// ```
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      slots: empty_slots(capacity),
      cursor: AtomicUsize::new(0),
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// The number of slots that have been reserved so far.
  ///
  /// Under concurrent appends some of these slots may not have had their
  /// value stored yet.
  #[inline]
  pub fn len(&self) -> usize {
    self.cursor.load(Ordering::Acquire)
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[inline]
  pub fn is_full(&self) -> bool {
    self.len() == self.capacity()
  }

  /// Reserve the next free slot, returning its index.
  pub(crate) fn reserve(&self) -> Option<usize> {
    let capacity = self.capacity();
    let mut index = self.cursor.load(Ordering::Relaxed);

    loop {
      if index >= capacity {
        return None;
      }

      match self.cursor.compare_exchange_weak(
        index,
        index + 1,
        Ordering::AcqRel,
        Ordering::Relaxed,
      ) {
        Ok(_) => return Some(index),
        Err(actual) => index = actual,
      }
    }
  }

  /// Append a value to the end of the segment.
  ///
  /// If the segment is full then the value is returned as an error.
  ///
  /// # Example
  /// ```
  /// # use freesync::Segment;
  /// # use std::sync::Arc;
  /// let segment = Segment::with_capacity(1);
  ///
  /// assert_eq!(segment.append(Arc::new(5)), Ok(0));
  /// assert_eq!(segment.append(Arc::new(6)), Err(Arc::new(6)));
  /// ```
  pub fn append(&self, value: Arc<T>) -> Result<usize, Arc<T>> {
    match self.reserve() {
      Some(index) => {
        self.slots[index].store(Some(value));
        Ok(index)
      }
      None => Err(value),
    }
  }

  /// Read the value stored at `index`.
  ///
  /// Returns `None` if nothing has been stored there yet, either because
  /// the slot was never reserved or because the append that reserved it
  /// hasn't finished storing its value.
  ///
  /// # Panics
  /// Panics if `index >= capacity()`.
  #[inline]
  pub fn load(&self, index: usize) -> Option<Arc<T>> {
    self.slots[index].load_full()
  }

  /// Replace the value at `index`, returning the one previously stored.
  ///
  /// The previous value stays alive for as long as any reader still holds
  /// on to it.
  ///
  /// # Panics
  /// Panics if `index >= capacity()`.
  #[inline]
  pub fn update_at(&self, index: usize, value: Arc<T>) -> Option<Arc<T>> {
    self.slots[index].swap(Some(value))
  }

  /// Iterate over the stored values in index order.
  ///
  /// Iteration stops at the first slot that has been reserved but does not
  /// yet hold a value.
  pub fn iter(&self) -> Iter<'_, T> {
    Iter {
      segment: self,
      index: 0,
      end: self.len(),
    }
  }
}

impl<T> fmt::Debug for Segment<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Segment")
      .field("len", &self.len())
      .field("capacity", &self.capacity())
      .finish()
  }
}

pub struct Iter<'s, T> {
  segment: &'s Segment<T>,
  index: usize,
  end: usize,
}

impl<T> Iterator for Iter<'_, T> {
  type Item = (usize, Arc<T>);

  fn next(&mut self) -> Option<Self::Item> {
    if self.index >= self.end {
      return None;
    }

    match self.segment.load(self.index) {
      Some(value) => {
        let index = self.index;
        self.index += 1;
        Some((index, value))
      }
      None => {
        self.index = self.end;
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn append_until_full() {
    let segment = Segment::with_capacity(4);

    for i in 0..4 {
      assert_eq!(segment.append(Arc::new(i)), Ok(i));
    }

    assert!(segment.is_full());
    assert_eq!(segment.append(Arc::new(10)), Err(Arc::new(10)));
    assert_eq!(segment.len(), 4);
  }

  #[test]
  fn stores_empty_values() {
    let segment = Segment::with_capacity(2);
    segment.append(Arc::new(None::<u32>)).unwrap();

    assert_eq!(segment.load(0).as_deref(), Some(&None));
    assert_eq!(segment.load(1), None);
  }

  #[test]
  fn update_returns_previous() {
    let segment = Segment::with_capacity(2);
    segment.append(Arc::new("a")).unwrap();

    assert_eq!(segment.update_at(0, Arc::new("b")).as_deref(), Some(&"a"));
    assert_eq!(segment.update_at(1, Arc::new("c")), None);
    assert_eq!(segment.load(0).as_deref(), Some(&"b"));
  }

  #[test]
  fn iter_stops_at_unstored_slot() {
    let segment = Segment::with_capacity(4);
    segment.append(Arc::new(0)).unwrap();
    segment.append(Arc::new(1)).unwrap();
    // Reserved but never stored, like an append that is still in flight.
    assert_eq!(segment.reserve(), Some(2));
    segment.append(Arc::new(3)).unwrap();

    let seen: Vec<_> = segment.iter().map(|(i, v)| (i, *v)).collect();
    assert_eq!(seen, [(0, 0), (1, 1)]);
  }

  #[test]
  #[should_panic]
  fn load_out_of_bounds() {
    let segment = Segment::<u8>::with_capacity(2);
    segment.load(2);
  }

  #[test]
  fn concurrent_appends_get_unique_indices() {
    let segment = Segment::with_capacity(1000);

    let indices = crossbeam::scope(|s| {
      let handles: Vec<_> = (0..8)
        .map(|t| {
          let segment = &segment;
          s.spawn(move |_| {
            (0..200)
              .filter_map(|i| segment.append(Arc::new(t * 1000 + i)).ok())
              .collect::<Vec<_>>()
          })
        })
        .collect();

      handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect::<Vec<_>>()
    })
    .unwrap();

    assert_eq!(indices.len(), 1000);
    assert_eq!(indices.iter().collect::<HashSet<_>>().len(), 1000);
    assert!(segment.is_full());
  }

  #[test]
  fn no_lost_updates() {
    const THREADS: usize = 8;
    const WRITES: usize = 500;

    let segment = Segment::with_capacity(1);
    segment.append(Arc::new((usize::MAX, 0))).unwrap();

    let displaced = crossbeam::scope(|s| {
      let handles: Vec<_> = (0..THREADS)
        .map(|t| {
          let segment = &segment;
          s.spawn(move |_| {
            (0..WRITES)
              .map(|i| segment.update_at(0, Arc::new((t, i))).unwrap())
              .map(|old| *old)
              .collect::<Vec<_>>()
          })
        })
        .collect();

      handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect::<Vec<_>>()
    })
    .unwrap();

    let last = *segment.load(0).unwrap();
    // The surviving value has to be the final write of some thread.
    assert_eq!(last.1, WRITES - 1);

    // Every value written is either displaced exactly once or survives.
    let mut all: HashSet<_> = displaced.iter().copied().collect();
    assert_eq!(all.len(), displaced.len());
    assert!(all.insert(last));
    assert!(all.remove(&(usize::MAX, 0)));
    assert_eq!(all.len(), THREADS * WRITES);
  }
}
