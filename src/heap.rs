use std::ptr::NonNull;

use crate::{
  align::checked_align,
  block::{Block, BlockState, HEADER_SIZE, MIN_PAYLOAD},
  check::{self, Violation},
  config::{HeapConfig, ReclaimPolicy},
  error::AllocError,
  free_list::FreeList,
  region::{MmapSource, Region, RegionManager, RegionSource, RegionStats},
};

/// A boundary-tag heap over OS regions.
///
/// Allocation is first-fit over an explicit LIFO free list. Releasing a block
/// coalesces it with free neighbours right away and gives a region back to
/// its [`RegionSource`] once it is empty, as the [`ReclaimPolicy`] allows.
///
/// A `Heap` is a plain context value: it is neither `Send` nor `Sync`, and
/// separate instances share nothing. Dropping it unmaps every region, which
/// invalidates all pointers it handed out.
pub struct Heap<S: RegionSource = MmapSource> {
  regions: RegionManager<S>,
  free: FreeList,
  config: HeapConfig,
}

impl Heap<MmapSource> {
  pub fn new() -> Self {
    Self::with_config(HeapConfig::default())
  }

  pub fn with_config(config: HeapConfig) -> Self {
    Self::with_source(MmapSource::new(), config)
  }
}

impl Default for Heap<MmapSource> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S: RegionSource> Heap<S> {
  pub fn with_source(
    source: S,
    config: HeapConfig,
  ) -> Self {
    Self {
      regions: RegionManager::new(source, config.max_region_pages),
      free: FreeList::new(),
      config,
    }
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn stats(&self) -> RegionStats {
    self.regions.stats()
  }

  pub fn regions(&self) -> &[Region] {
    self.regions.regions()
  }

  pub fn source(&self) -> &S {
    self.regions.source()
  }

  pub fn source_mut(&mut self) -> &mut S {
    self.regions.source_mut()
  }

  /// Number of blocks on the free list.
  pub fn free_blocks(&self) -> usize {
    unsafe { self.free.iter() }.count()
  }

  /// Returns every region to the OS and forgets all blocks.
  ///
  /// Pointers handed out before the reset dangle afterwards.
  pub fn init(&mut self) {
    self.regions.release_all();
    self.free.clear();
    log::debug!("heap reset");
  }

  /// Allocates at least `size` bytes aligned to 16 bytes.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let needed = checked_align(size)
      .ok_or(AllocError::SizeOverflow { size })?
      .max(MIN_PAYLOAD);

    if self.free.is_empty() {
      self.regions.grow(needed, &mut self.free)?;
    }

    let block = match self.find_fit(needed) {
      Some(block) => block,
      None => {
        let block = self.regions.grow(needed, &mut self.free)?;
        if unsafe { block.size() } < needed {
          return Err(AllocError::OutOfMemory { size });
        }
        block
      }
    };

    let payload = unsafe { self.place(block, needed) };
    log::trace!("allocate({}) -> {:p}", size, payload);

    self.check_after("allocate");
    Ok(payload)
  }

  /// Returns a block to the heap.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by [`Heap::allocate`] on this heap and not
  /// released since. Double releases and foreign pointers are not detected
  /// and corrupt the heap.
  pub unsafe fn release(
    &mut self,
    ptr: NonNull<u8>,
  ) {
    log::trace!("release({:p})", ptr);

    unsafe {
      let mut block = Block::from_payload(ptr);
      block.mark_free();
      self.free.push_front(block);

      let next = block.next();
      if !next.is_terminator() && !next.is_allocated() {
        self.merge(block, next);
      }

      if !block.is_sentinel() {
        let previous = block.previous();
        if !previous.is_allocated() {
          self.merge(previous, block);
          block = previous;
        }
      }

      if block.is_sentinel() && block.next().is_terminator() && self.should_reclaim(block) {
        self.free.remove(block);
        self.regions.release_region(block);
      }
    }

    self.check_after("release");
  }

  /// Runs the heap checker over every region and the free list.
  pub fn check(&self) -> Vec<Violation> {
    unsafe { check::check_heap(self.regions.regions(), &self.free) }
  }

  fn find_fit(
    &self,
    needed: usize,
  ) -> Option<Block> {
    unsafe { self.free.iter() }.find(|block| unsafe { block.size() } >= needed)
  }

  /// Takes `block` off the free list and hands out its first `needed` bytes,
  /// splitting off the rest when it can hold a block of its own.
  unsafe fn place(
    &mut self,
    block: Block,
    needed: usize,
  ) -> NonNull<u8> {
    unsafe {
      self.free.remove(block);

      let size = block.size();
      if size - needed > HEADER_SIZE {
        let prefix = needed + HEADER_SIZE;
        let rest = size - needed;
        let next = block.next();
        let remainder = Block::at(block.payload().add(needed));

        remainder.pack(rest, prefix, BlockState::Free);
        remainder.mark_free();
        next.set_backward(rest);
        block.set_forward(prefix);
        self.free.push_front(remainder);

        log::debug!(
          "split {:p}: {} byte block, {} byte remainder",
          block.as_ptr(),
          needed,
          rest - HEADER_SIZE
        );
      }

      block.mark_allocated()
    }
  }

  /// Folds `absorbed`, the free block right after `survivor`, into `survivor`.
  unsafe fn merge(
    &mut self,
    survivor: Block,
    absorbed: Block,
  ) {
    unsafe {
      let forward = survivor.forward() + absorbed.forward();
      let after = absorbed.next();

      self.free.remove(absorbed);
      survivor.set_forward(forward);
      after.set_backward(forward);
    }

    log::debug!("coalesced {:p} into {:p}", absorbed.as_ptr(), survivor.as_ptr());
  }

  fn should_reclaim(
    &self,
    block: Block,
  ) -> bool {
    match self.config.reclaim {
      ReclaimPolicy::Always => true,
      ReclaimPolicy::Never => false,
      ReclaimPolicy::KeepLastFree => {
        let sole = self.free.head() == Some(block)
          && unsafe { block.free_node().as_ref().next.is_none() };
        !sole
      }
    }
  }

  fn check_after(
    &self,
    op: &str,
  ) {
    if !self.config.check_each_op {
      return;
    }

    for violation in self.check() {
      log::warn!("heap check after {}: {}", op, violation);
    }
  }
}

impl<S: RegionSource> Drop for Heap<S> {
  fn drop(&mut self) {
    self.regions.release_all();
  }
}
