use std::{
  fmt,
  ops::Deref,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use crate::expanding::{self, ExpandingArray};
use crate::FreeList;

struct Entry<T> {
  value: T,
  live: AtomicBool,
}

impl<T> Entry<T> {
  fn is_live(&self) -> bool {
    self.live.load(Ordering::Acquire)
  }
}

/// An unordered collection supporting concurrent adds, deletes and
/// iteration.
///
/// Adding a value hands back a [`BagHandle`] which is the only way to
/// delete that value again. Deleted slots are recycled by later adds so
/// churn doesn't grow the underlying storage without bound.
///
/// # Example
/// ```
/// # use freesync::Bag;
/// let bag = Bag::new();
/// let a = bag.add("a");
/// let _b = bag.add("b");
///
/// a.delete();
///
/// let values: Vec<_> = bag.iter().map(|v| *v).collect();
/// assert_eq!(values, ["b"]);
/// ```
pub struct Bag<T> {
  entries: ExpandingArray<Entry<T>>,
  recycled: FreeList<usize>,
}

impl<T> Bag<T> {
  pub fn new() -> Self {
    Self {
      entries: ExpandingArray::new(),
      recycled: FreeList::new(),
    }
  }

  /// Add a value to the bag.
  ///
  /// The returned handle deletes the value when [`BagHandle::delete`] is
  /// called. Dropping the handle without calling it leaves the value in the
  /// bag forever.
  pub fn add(&self, value: T) -> BagHandle<'_, T> {
    let entry = Arc::new(Entry {
      value,
      live: AtomicBool::new(true),
    });

    let index = match self.recycled.pop() {
      Some(index) => {
        // The previous occupant has already been deleted.
        self.entries.update_at_shared(index, Arc::clone(&entry));
        index
      }
      None => self.entries.append_shared(Arc::clone(&entry)),
    };

    BagHandle {
      bag: self,
      index,
      entry,
    }
  }

  /// Iterate over the values currently in the bag.
  ///
  /// No ordering is guaranteed. Values added or deleted while iterating may
  /// or may not be observed.
  pub fn iter(&self) -> Iter<T> {
    Iter {
      entries: self.entries.iter(),
    }
  }
}

impl<T> Default for Bag<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: fmt::Debug> fmt::Debug for Bag<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_set().entries(self.iter()).finish()
  }
}

/// The capability to delete one value from a [`Bag`].
pub struct BagHandle<'b, T> {
  bag: &'b Bag<T>,
  index: usize,
  entry: Arc<Entry<T>>,
}

impl<T> BagHandle<'_, T> {
  /// Delete the value this handle was created for.
  ///
  /// Only the first call has any effect, later calls (including from other
  /// threads) do nothing and return `false`. This holds even after the slot
  /// has been reused by another value.
  pub fn delete(&self) -> bool {
    let deleted = self
      .entry
      .live
      .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();

    if deleted {
      self.bag.recycled.push(self.index);
    }

    deleted
  }

  /// Whether the value has not been deleted yet.
  pub fn is_live(&self) -> bool {
    self.entry.is_live()
  }

  /// The value this handle refers to.
  pub fn value(&self) -> &T {
    &self.entry.value
  }

  /// The slot within the bag's storage this value occupies.
  pub fn index(&self) -> usize {
    self.index
  }
}

impl<T: fmt::Debug> fmt::Debug for BagHandle<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BagHandle")
      .field("index", &self.index)
      .field("value", &self.entry.value)
      .field("live", &self.is_live())
      .finish()
  }
}

/// A value yielded while iterating over a [`Bag`].
pub struct BagItem<T>(Arc<Entry<T>>);

impl<T> Deref for BagItem<T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.0.value
  }
}

impl<T: fmt::Debug> fmt::Debug for BagItem<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.value.fmt(f)
  }
}

pub struct Iter<T> {
  entries: expanding::Iter<Entry<T>>,
}

impl<T> Iterator for Iter<T> {
  type Item = BagItem<T>;

  fn next(&mut self) -> Option<Self::Item> {
    self
      .entries
      .by_ref()
      .map(|(_, entry)| entry)
      .find(|entry| entry.is_live())
      .map(BagItem)
  }
}
