use std::{
  fmt,
  mem::MaybeUninit,
  ptr,
  sync::atomic::Ordering::{Acquire, Relaxed, Release},
};

use crossbeam::epoch::{self, Atomic, Owned, Shared};
use crossbeam::utils::CachePadded;

struct Node<T> {
  /// Uninitialized for the placeholder node, and for a node whose value
  /// has already been popped.
  value: MaybeUninit<T>,
  next: Atomic<Node<T>>,
}

/// A lock-free FIFO list used for recycling values such as free indices.
///
/// The list always starts with a placeholder node. Popping moves the
/// placeholder forward onto the first real node, so a pop can only succeed
/// when there is a node after the one being popped. As a result the final
/// value in the list can never be popped: a list holding one value reports
/// itself as empty to `pop`.
///
/// # Example
/// ```
/// # use freesync::FreeList;
/// let list = FreeList::new();
/// list.push(1);
/// list.push(2);
///
/// assert_eq!(list.pop(), Some(1));
/// // The last remaining value stays put.
/// assert_eq!(list.pop(), None);
/// ```
pub struct FreeList<T> {
  head: CachePadded<Atomic<Node<T>>>,
  /// Hint for where the end of the list is. It may lag behind the real
  /// tail but it only ever moves forward.
  tail: CachePadded<Atomic<Node<T>>>,
}

unsafe impl<T: Send> Send for FreeList<T> {}
unsafe impl<T: Send> Sync for FreeList<T> {}

impl<T> FreeList<T> {
  pub fn new() -> Self {
    let list = Self {
      head: CachePadded::new(Atomic::null()),
      tail: CachePadded::new(Atomic::null()),
    };

    let placeholder = Owned::new(Node {
      value: MaybeUninit::uninit(),
      next: Atomic::null(),
    });

    // SAFETY: Nobody else can see the list yet.
    unsafe {
      let placeholder = placeholder.into_shared(epoch::unprotected());
      list.head.store(placeholder, Relaxed);
      list.tail.store(placeholder, Relaxed);
    }

    list
  }

  /// Whether there is nothing after the placeholder node.
  pub fn is_empty(&self) -> bool {
    let guard = &epoch::pin();
    let head = self.head.load(Acquire, guard);

    // SAFETY: head is never null and is protected by the guard.
    let head = unsafe { head.deref() };
    head.next.load(Acquire, guard).is_null()
  }

  /// Add a value to the end of the list.
  pub fn push(&self, value: T) {
    let guard = &epoch::pin();
    let node = Owned::new(Node {
      value: MaybeUninit::new(value),
      next: Atomic::null(),
    })
    .into_shared(guard);

    loop {
      let tail = self.tail.load(Acquire, guard);
      // SAFETY: tail is never null and is protected by the guard.
      let next = unsafe { tail.deref() }.next.load(Acquire, guard);

      if !next.is_null() {
        let _ = self.tail.compare_exchange(tail, next, Release, Relaxed, guard);
        continue;
      }

      let linked = unsafe { tail.deref() }.next.compare_exchange(
        Shared::null(),
        node,
        Release,
        Relaxed,
        guard,
      );

      if linked.is_ok() {
        let _ = self.tail.compare_exchange(tail, node, Release, Relaxed, guard);
        return;
      }
    }
  }

  /// Remove the value at the front of the list.
  ///
  /// Returns `None` if the list is empty or if it only holds one value.
  pub fn pop(&self) -> Option<T> {
    let guard = &epoch::pin();

    loop {
      let head = self.head.load(Acquire, guard);
      // SAFETY: head is never null and is protected by the guard.
      let first = unsafe { head.deref() }.next.load(Acquire, guard);
      let node = unsafe { first.as_ref() }?;

      if node.next.load(Acquire, guard).is_null() {
        return None;
      }

      // The placeholder must not be freed while the tail still points at it.
      let tail = self.tail.load(Acquire, guard);
      if tail == head {
        let _ = self.tail.compare_exchange(tail, first, Release, Relaxed, guard);
        continue;
      }

      if self
        .head
        .compare_exchange(head, first, Release, Relaxed, guard)
        .is_ok()
      {
        // SAFETY: Winning the exchange makes `first` the new placeholder and
        //         gives us sole ownership of its value. The old placeholder
        //         is unreachable from the list.
        unsafe {
          guard.defer_destroy(head);
          return Some(ptr::read(node.value.as_ptr()));
        }
      }
    }
  }
}

impl<T> Default for FreeList<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for FreeList<T> {
  fn drop(&mut self) {
    // SAFETY: We have exclusive access so no other thread can be reading.
    unsafe {
      let guard = epoch::unprotected();
      let head = self.head.load(Relaxed, guard);
      let mut node = head.deref().next.load(Relaxed, guard);

      // The placeholder's value is either uninitialized or already popped.
      drop(head.into_owned());

      while !node.is_null() {
        let next = node.deref().next.load(Relaxed, guard);
        let mut owned = node.into_owned();
        ptr::drop_in_place(owned.value.as_mut_ptr());
        drop(owned);
        node = next;
      }
    }
  }
}

impl<T> fmt::Debug for FreeList<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FreeList")
      .field("empty", &self.is_empty())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::sync::Arc;

  #[test]
  fn fifo_order() {
    let list = FreeList::new();
    for i in 0..10 {
      list.push(i);
    }

    let popped: Vec<_> = std::iter::from_fn(|| list.pop()).collect();
    assert_eq!(popped, (0..9).collect::<Vec<_>>());
    assert!(!list.is_empty());
  }

  #[test]
  fn cannot_pop_last_value() {
    let list = FreeList::new();
    assert!(list.is_empty());
    assert_eq!(list.pop(), None);

    list.push("only");
    assert_eq!(list.pop(), None);

    list.push("second");
    assert_eq!(list.pop(), Some("only"));
    assert_eq!(list.pop(), None);
  }

  #[test]
  fn drops_remaining_values() {
    let value = Arc::new(());
    {
      let list = FreeList::new();
      for _ in 0..5 {
        list.push(Arc::clone(&value));
      }
      drop(list.pop());
      assert_eq!(Arc::strong_count(&value), 5);
    }

    assert_eq!(Arc::strong_count(&value), 1);
  }

  #[test]
  fn concurrent_push_pop() {
    const THREADS: usize = 4;
    const PUSHES: usize = 2000;
    let list = FreeList::new();

    let popped = crossbeam::scope(|s| {
      for t in 0..THREADS {
        let list = &list;
        s.spawn(move |_| {
          for i in 0..PUSHES {
            list.push(t * PUSHES + i);
          }
        });
      }

      let poppers: Vec<_> = (0..THREADS)
        .map(|_| {
          let list = &list;
          s.spawn(move |_| {
            let mut popped = Vec::new();
            for _ in 0..PUSHES {
              if let Some(value) = list.pop() {
                popped.push(value);
              }
            }
            popped
          })
        })
        .collect();

      poppers
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect::<Vec<_>>()
    })
    .unwrap();

    let mut seen: HashSet<_> = popped.iter().copied().collect();
    assert_eq!(seen.len(), popped.len(), "a value was popped twice");

    while let Some(value) = list.pop() {
      assert!(seen.insert(value), "a value was popped twice");
    }

    // Exactly one value is left behind in the list.
    assert_eq!(seen.len(), THREADS * PUSHES - 1);
  }
}
