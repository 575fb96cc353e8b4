use crate::block::Block;

/// Explicit doubly-linked list of free blocks, threaded through their payloads.
///
/// The list only stores links; which block to take is decided by the heap.
#[derive(Debug, Default)]
pub struct FreeList {
  head: Option<Block>,
}

impl FreeList {
  pub const fn new() -> Self {
    Self { head: None }
  }

  pub fn head(&self) -> Option<Block> {
    self.head
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  /// Forgets every entry without touching the blocks.
  pub fn clear(&mut self) {
    self.head = None;
  }

  /// Makes `block` the new head.
  ///
  /// # Safety
  ///
  /// `block` must be tagged free and not already be on the list.
  pub unsafe fn push_front(
    &mut self,
    block: Block,
  ) {
    unsafe {
      let mut node = block.free_node();
      node.as_mut().prev = None;
      node.as_mut().next = self.head;

      if let Some(head) = self.head {
        head.free_node().as_mut().prev = Some(block);
      }
    }

    self.head = Some(block);
  }

  /// Unlinks `block` by rewiring its neighbours.
  ///
  /// # Safety
  ///
  /// `block` must be tagged free and currently on this list.
  pub unsafe fn remove(
    &mut self,
    block: Block,
  ) {
    let (prev, next) = unsafe {
      let node = block.free_node();
      (node.as_ref().prev, node.as_ref().next)
    };

    unsafe {
      if let Some(prev) = prev {
        prev.free_node().as_mut().next = next;
      }
      if let Some(next) = next {
        next.free_node().as_mut().prev = prev;
      }
    }

    if self.head == Some(block) {
      self.head = next;
    }
  }

  /// Walks the list from head to tail.
  ///
  /// # Safety
  ///
  /// Every block on the list must stay mapped and free while the iterator is used.
  pub unsafe fn iter(&self) -> Iter<'_> {
    Iter {
      current: self.head,
      _list: self,
    }
  }
}

pub struct Iter<'a> {
  current: Option<Block>,
  _list: &'a FreeList,
}

impl Iterator for Iter<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.current?;
    self.current = unsafe { block.free_node().as_ref().next };
    Some(block)
  }
}
