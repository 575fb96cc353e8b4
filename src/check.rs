//! Heap consistency checker.
//!
//! Walks the block chain of every region in both directions and the free list
//! in both directions, and reports what breaks the heap's invariants instead
//! of stopping at the first problem.

use std::collections::HashSet;

use crate::{
  align::ALIGNMENT,
  block::{Block, HEADER_SIZE},
  free_list::FreeList,
  region::Region,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
  #[error("region {region:#x} does not start with a sentinel")]
  MissingSentinel { region: usize },
  #[error("block {block:#x} has forward offset {forward}, not a 16 byte multiple of at least one header")]
  BadForward { block: usize, forward: usize },
  #[error("block {block:#x} has backward offset {found} instead of {expected}")]
  BrokenBackLink { block: usize, expected: usize, found: usize },
  #[error("block {block:#x} is not reached again from its predecessor {previous:#x}")]
  BrokenForwardLink { block: usize, previous: usize },
  #[error("blocks {first:#x} and {second:#x} are adjacent and both free")]
  AdjacentFree { first: usize, second: usize },
  #[error("region {region:#x} chain ends at {found:#x} instead of its terminator {expected:#x}")]
  BadTerminator { region: usize, expected: usize, found: usize },
  #[error("free list entry {block:#x} links back to {found:?} instead of {expected:?}")]
  BrokenFreeLink {
    block: usize,
    expected: Option<usize>,
    found: Option<usize>,
  },
  #[error("free list visits {block:#x} twice")]
  FreeListCycle { block: usize },
  #[error("free list entry {block:#x} is allocated")]
  AllocatedOnFreeList { block: usize },
  #[error("free list entry {block:#x} lies outside every region")]
  ForeignFreeEntry { block: usize },
  #[error("free block {block:#x} is missing from the free list")]
  UnlistedFreeBlock { block: usize },
  #[error("free list has {forward} entries walking forward but {backward} walking backward")]
  FreeListLength { forward: usize, backward: usize },
}

/// Checks every region and the free list, returning all violations found.
///
/// # Safety
///
/// Every region must still be mapped.
pub unsafe fn check_heap(
  regions: &[Region],
  free: &FreeList,
) -> Vec<Violation> {
  let mut violations = Vec::new();
  let mut free_blocks = HashSet::new();

  for region in regions {
    unsafe { check_region(region, &mut free_blocks, &mut violations) };
  }
  unsafe { check_free_list(regions, free, &free_blocks, &mut violations) };

  violations
}

unsafe fn check_region(
  region: &Region,
  free_blocks: &mut HashSet<Block>,
  violations: &mut Vec<Violation>,
) {
  let region_addr = region.base().as_ptr() as usize;
  let sentinel = region.sentinel();
  let terminator = region.terminator();

  unsafe {
    if !sentinel.is_sentinel() {
      violations.push(Violation::MissingSentinel {
        region: region_addr,
      });
      return;
    }

    let mut previous: Option<Block> = None;
    let mut block = sentinel;

    while block != terminator {
      if !region.contains(block) || block.is_terminator() {
        violations.push(Violation::BadTerminator {
          region: region_addr,
          expected: terminator.addr(),
          found: block.addr(),
        });
        return;
      }

      let forward = block.forward();
      if forward % ALIGNMENT != 0 || forward < HEADER_SIZE {
        violations.push(Violation::BadForward {
          block: block.addr(),
          forward,
        });
        return;
      }

      if let Some(previous) = previous {
        check_back_link(previous, block, violations);

        if !previous.is_allocated() && !block.is_allocated() {
          violations.push(Violation::AdjacentFree {
            first: previous.addr(),
            second: block.addr(),
          });
        }
      }

      if !block.is_allocated() {
        free_blocks.insert(block);
      }

      previous = Some(block);
      block = block.next();
    }

    if let Some(previous) = previous {
      check_back_link(previous, terminator, violations);
    }

    // and back again from the terminator
    let mut block = terminator;
    while !block.is_sentinel() {
      let previous = block.previous();
      if !region.contains(previous) || previous.next() != block {
        violations.push(Violation::BrokenForwardLink {
          block: block.addr(),
          previous: previous.addr(),
        });
        return;
      }
      block = previous;
    }

    if block != sentinel {
      violations.push(Violation::MissingSentinel {
        region: region_addr,
      });
    }
  }
}

unsafe fn check_back_link(
  previous: Block,
  block: Block,
  violations: &mut Vec<Violation>,
) {
  let expected = block.addr() - previous.addr();
  let found = unsafe { block.backward() };

  if found != expected {
    violations.push(Violation::BrokenBackLink {
      block: block.addr(),
      expected,
      found,
    });
  }
}

unsafe fn check_free_list(
  regions: &[Region],
  free: &FreeList,
  free_blocks: &HashSet<Block>,
  violations: &mut Vec<Violation>,
) {
  let mut listed = HashSet::new();
  let mut tail: Option<Block> = None;
  let mut current = free.head();

  while let Some(block) = current {
    if !listed.insert(block) {
      violations.push(Violation::FreeListCycle { block: block.addr() });
      return;
    }
    if !regions.iter().any(|region| region.contains(block)) {
      violations.push(Violation::ForeignFreeEntry { block: block.addr() });
      return;
    }
    if unsafe { block.is_allocated() } {
      violations.push(Violation::AllocatedOnFreeList { block: block.addr() });
      return;
    }

    let node = unsafe { block.free_node().as_ref() };
    if node.prev != tail {
      violations.push(Violation::BrokenFreeLink {
        block: block.addr(),
        expected: tail.map(Block::addr),
        found: node.prev.map(Block::addr),
      });
    }

    tail = Some(block);
    current = node.next;
  }

  let mut backward = 0;
  let mut current = tail;
  while let Some(block) = current {
    backward += 1;
    if backward > listed.len() {
      break;
    }
    current = unsafe { block.free_node().as_ref().prev }.filter(|prev| listed.contains(prev));
  }

  if backward != listed.len() {
    violations.push(Violation::FreeListLength {
      forward: listed.len(),
      backward,
    });
  }

  let mut unlisted: Vec<_> = free_blocks.difference(&listed).copied().collect();
  unlisted.sort();
  violations.extend(
    unlisted
      .into_iter()
      .map(|block| Violation::UnlistedFreeBlock { block: block.addr() }),
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    block::BlockState,
    config::{HeapConfig, ReclaimPolicy},
    heap::Heap,
    testing::PageSource,
  };

  const PAGE: usize = 4096;

  fn heap() -> Heap<PageSource> {
    Heap::with_source(
      PageSource::new(PAGE),
      HeapConfig::default().with_reclaim(ReclaimPolicy::Never),
    )
  }

  #[test]
  fn test_clean_heap() {
    let mut heap = heap();
    assert!(heap.check().is_empty());

    let a = heap.allocate(100).unwrap();
    let _b = heap.allocate(5000).unwrap();
    unsafe { heap.release(a) };

    assert!(heap.check().is_empty());
  }

  #[test]
  fn test_adjacent_free_blocks() {
    let mut heap = heap();

    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let _c = heap.allocate(64).unwrap();

    unsafe {
      // a free block that skipped coalescing
      heap.release(a);
      Block::from_payload(b).set_state(BlockState::Free);
    }

    let violations = heap.check();
    assert!(violations.contains(&Violation::AdjacentFree {
      first: unsafe { Block::from_payload(a) }.addr(),
      second: unsafe { Block::from_payload(b) }.addr(),
    }));

    unsafe { Block::from_payload(b).set_state(BlockState::Allocated) };
    assert!(heap.check().is_empty());
  }

  #[test]
  fn test_unlisted_free_block() {
    let mut heap = heap();

    let _a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let _c = heap.allocate(64).unwrap();

    let block = unsafe { Block::from_payload(b) };
    unsafe { block.set_state(BlockState::Free) };

    assert_eq!(
      heap.check(),
      vec![Violation::UnlistedFreeBlock { block: block.addr() }]
    );
    unsafe { block.set_state(BlockState::Allocated) };
  }

  #[test]
  fn test_broken_back_link() {
    let mut heap = heap();

    let _a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();

    let block = unsafe { Block::from_payload(b) };
    let expected = unsafe { block.backward() };
    unsafe { block.set_backward(expected + ALIGNMENT) };

    let violations = heap.check();
    assert!(violations.contains(&Violation::BrokenBackLink {
      block: block.addr(),
      expected,
      found: expected + ALIGNMENT,
    }));
    assert!(
      violations
        .iter()
        .any(|v| matches!(v, Violation::BrokenForwardLink { .. }))
    );

    unsafe { block.set_backward(expected) };
    assert!(heap.check().is_empty());
  }

  #[test]
  fn test_bad_forward() {
    let mut heap = heap();

    let a = heap.allocate(64).unwrap();
    let block = unsafe { Block::from_payload(a) };
    let forward = unsafe { block.forward() };

    unsafe { block.set_forward(forward + 8) };
    assert!(heap.check().contains(&Violation::BadForward {
      block: block.addr(),
      forward: forward + 8,
    }));

    unsafe { block.set_forward(forward) };
    assert!(heap.check().is_empty());
  }

  #[test]
  fn test_allocated_block_on_free_list() {
    let mut heap = heap();

    let a = heap.allocate(64).unwrap();
    let rest = unsafe { Block::from_payload(a).next() };

    unsafe { rest.set_state(BlockState::Allocated) };
    assert!(
      heap
        .check()
        .contains(&Violation::AllocatedOnFreeList { block: rest.addr() })
    );

    unsafe { rest.set_state(BlockState::Free) };
    assert!(heap.check().is_empty());
  }

  #[test]
  fn test_free_list_cycle() {
    let mut heap = heap();

    let _a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let _c = heap.allocate(64).unwrap();

    unsafe {
      heap.release(b);
      heap.release(b);
    }

    let block = unsafe { Block::from_payload(b) }.addr();
    let violations = heap.check();
    assert!(violations.contains(&Violation::FreeListCycle { block }));
    heap.init();
  }

  #[test]
  fn test_violation_messages() {
    let violation = Violation::AdjacentFree {
      first: 0x1000,
      second: 0x1040,
    };
    assert_eq!(
      violation.to_string(),
      "blocks 0x1000 and 0x1040 are adjacent and both free"
    );

    let violation = Violation::FreeListLength {
      forward: 3,
      backward: 2,
    };
    assert_eq!(
      violation.to_string(),
      "free list has 3 entries walking forward but 2 walking backward"
    );
  }
}
