use freesync::Bag;

use std::{
  collections::{BTreeSet, HashSet},
  sync::{
    atomic::{AtomicUsize, Ordering},
    Barrier,
  },
};

fn contents(bag: &Bag<usize>) -> Vec<usize> {
  let mut values: Vec<_> = bag.iter().map(|v| *v).collect();
  values.sort_unstable();
  values
}

#[test]
fn add_delete_reuse() {
  let bag = Bag::new();

  let handles: Vec<_> = (0..100).map(|i| bag.add(i)).collect();
  assert_eq!(contents(&bag), (0..100).collect::<Vec<_>>());

  for handle in handles.iter().step_by(10) {
    assert!(handle.delete());
  }

  let remaining: Vec<_> = (0..100).filter(|i| i % 10 != 0).collect();
  assert_eq!(contents(&bag), remaining);

  let deleted: HashSet<_> = handles.iter().step_by(10).map(|h| h.index()).collect();
  let added: Vec<_> = (100..200).map(|i| bag.add(i)).collect();
  let reused = added.iter().filter(|h| deleted.contains(&h.index())).count();

  // The most recently deleted index is the last node in the free list and
  // can't be handed out again until another index is freed after it.
  assert_eq!(reused, deleted.len() - 1);

  let mut expected = remaining;
  expected.extend(100..200);
  assert_eq!(contents(&bag), expected);
}

#[test]
fn values_are_unique_per_slot() {
  let bag = Bag::new();
  let mut handles: Vec<_> = (0..50).map(|i| bag.add(i)).collect();

  for round in 0..10 {
    for handle in handles.drain(..25) {
      handle.delete();
    }
    handles.extend((0..25).map(|i| bag.add(1000 * (round + 1) + i)));

    let values = contents(&bag);
    let live: BTreeSet<_> = handles.iter().map(|h| *h.value()).collect();
    assert_eq!(values, live.into_iter().collect::<Vec<_>>());
  }
}

#[test]
fn concurrent_double_delete() {
  const THREADS: usize = 8;

  let bag = Bag::new();
  let handle = bag.add(7);
  let barrier = Barrier::new(THREADS);
  let deletions = AtomicUsize::new(0);

  crossbeam::scope(|s| {
    for _ in 0..THREADS {
      let handle = &handle;
      let barrier = &barrier;
      let deletions = &deletions;
      s.spawn(move |_| {
        barrier.wait();
        if handle.delete() {
          deletions.fetch_add(1, Ordering::Relaxed);
        }
      });
    }
  })
  .unwrap();

  assert_eq!(deletions.load(Ordering::Relaxed), 1);
  assert_eq!(bag.iter().count(), 0);
}

#[test]
fn concurrent_add_delete() {
  const THREADS: usize = 8;
  const ROUNDS: usize = 2000;

  let bag = Bag::new();

  let kept = crossbeam::scope(|s| {
    let workers: Vec<_> = (0..THREADS)
      .map(|t| {
        let bag = &bag;
        s.spawn(move |_| {
          let mut kept = Vec::new();
          for i in 0..ROUNDS {
            let value = t * ROUNDS + i;
            let handle = bag.add(value);
            if i % 3 == 0 {
              kept.push(value);
            } else {
              assert!(handle.delete());
            }
          }
          kept
        })
      })
      .collect();

    workers
      .into_iter()
      .flat_map(|h| h.join().unwrap())
      .collect::<Vec<_>>()
  })
  .unwrap();

  let mut kept = kept;
  kept.sort_unstable();
  assert_eq!(contents(&bag), kept);
}
