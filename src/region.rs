use std::{io, ptr, ptr::NonNull};

use crate::{
  align_to,
  block::{Block, BlockState, HEADER_SIZE},
  error::AllocError,
  free_list::FreeList,
};

/// Provider of OS memory regions.
pub trait RegionSource {
  /// Granularity of every region handed out by [`RegionSource::map_region`].
  fn page_size(&self) -> usize;

  /// Maps `size` bytes (a multiple of the page size), aligned to at least 16 bytes.
  fn map_region(
    &mut self,
    size: usize,
  ) -> io::Result<NonNull<u8>>;

  /// # Safety
  ///
  /// `base` and `size` must describe exactly one region returned by
  /// [`RegionSource::map_region`] that has not been unmapped yet.
  unsafe fn unmap_region(
    &mut self,
    base: NonNull<u8>,
    size: usize,
  );
}

/// Anonymous private mappings through `mmap(2)`.
#[derive(Debug, Clone, Copy)]
pub struct MmapSource {
  page_size: usize,
}

impl MmapSource {
  pub fn new() -> Self {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    Self {
      page_size: usize::try_from(page_size)
        .ok()
        .filter(|size| size.is_power_of_two())
        .unwrap_or(4096),
    }
  }
}

impl Default for MmapSource {
  fn default() -> Self {
    Self::new()
  }
}

impl RegionSource for MmapSource {
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn map_region(
    &mut self,
    size: usize,
  ) -> io::Result<NonNull<u8>> {
    let addr = unsafe {
      libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if addr == libc::MAP_FAILED {
      return Err(io::Error::last_os_error());
    }

    NonNull::new(addr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
  }

  unsafe fn unmap_region(
    &mut self,
    base: NonNull<u8>,
    size: usize,
  ) {
    if unsafe { libc::munmap(base.as_ptr().cast(), size) } != 0 {
      log::error!(
        "munmap({:p}, {}) failed: {}",
        base,
        size,
        io::Error::last_os_error()
      );
    }
  }
}

/// One live mapping, laid out as `[sentinel block .. | terminator]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
  base: NonNull<u8>,
  size: usize,
}

impl Region {
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn sentinel(&self) -> Block {
    unsafe { Block::at(self.base) }
  }

  pub fn terminator(&self) -> Block {
    unsafe { Block::at(self.base.add(self.size - HEADER_SIZE)) }
  }

  pub fn contains(
    &self,
    block: Block,
  ) -> bool {
    let start = self.base.as_ptr() as usize;
    (start..start + self.size).contains(&block.addr())
  }
}

/// Counters describing the mappings of a heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
  /// Bytes currently mapped.
  pub heap_size: usize,
  /// Regions currently mapped.
  pub regions: usize,
  /// Successful `map_region` calls so far.
  pub maps: usize,
  /// `unmap_region` calls so far.
  pub unmaps: usize,
}

pub struct RegionManager<S> {
  source: S,
  regions: Vec<Region>,
  heap_size: usize,
  maps: usize,
  unmaps: usize,
  max_region_pages: usize,
}

impl<S: RegionSource> RegionManager<S> {
  pub fn new(
    source: S,
    max_region_pages: usize,
  ) -> Self {
    Self {
      source,
      regions: Vec::new(),
      heap_size: 0,
      maps: 0,
      unmaps: 0,
      max_region_pages,
    }
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn source_mut(&mut self) -> &mut S {
    &mut self.source
  }

  pub fn regions(&self) -> &[Region] {
    &self.regions
  }

  pub fn stats(&self) -> RegionStats {
    RegionStats {
      heap_size: self.heap_size,
      regions: self.regions.len(),
      maps: self.maps,
      unmaps: self.unmaps,
    }
  }

  /// Size of the region the next [`RegionManager::grow`] maps for a payload of
  /// `min_size` bytes, or `None` if it overflows.
  ///
  /// The target heap size doubles (starting at one page) until the increment
  /// fits the payload plus sentinel and terminator headers. The increment is
  /// capped at `max_region_pages` pages unless the cap is too small to fit
  /// the request at all.
  pub fn region_size(
    &self,
    min_size: usize,
  ) -> Option<usize> {
    let page = self.source.page_size();
    let needed = min_size.checked_add(2 * HEADER_SIZE)?;
    let current = self.heap_size;

    let mut desired = if current == 0 {
      page
    } else {
      current.checked_mul(2)?.checked_add(page - 1)? & !(page - 1)
    };
    while desired - current < needed {
      desired = desired.checked_mul(2)?;
    }

    let increment = desired - current;
    let max = self.max_region_pages.checked_mul(page)?;

    if increment < max {
      Some(align_to!(increment, page))
    } else if max >= needed {
      Some(max)
    } else {
      needed.checked_add(page - 1).map(|n| n & !(page - 1))
    }
  }

  /// Maps a new region able to hold `min_size` payload bytes and pushes its
  /// single free block onto `free`.
  pub fn grow(
    &mut self,
    min_size: usize,
    free: &mut FreeList,
  ) -> Result<Block, AllocError> {
    let size = self
      .region_size(min_size)
      .ok_or(AllocError::SizeOverflow { size: min_size })?;

    let base = self.source.map_region(size).map_err(|source| {
      log::error!("failed to map {} byte region: {}", size, source);
      AllocError::MapFailed { size, source }
    })?;
    debug_assert_eq!(base.as_ptr() as usize % crate::align::ALIGNMENT, 0);

    let region = Region { base, size };
    let sentinel = region.sentinel();

    unsafe {
      sentinel.pack(size - HEADER_SIZE, 0, BlockState::Free);
      region
        .terminator()
        .pack(0, size - HEADER_SIZE, BlockState::Allocated);
      sentinel.mark_free();
      free.push_front(sentinel);
    }

    self.regions.push(region);
    self.heap_size += size;
    self.maps += 1;

    log::debug!(
      "mapped region {:p} ({} bytes) for {} byte request, heap is {} bytes",
      base,
      size,
      min_size,
      self.heap_size
    );

    Ok(sentinel)
  }

  /// Unmaps the region starting at `sentinel`.
  ///
  /// # Safety
  ///
  /// `sentinel` must span its whole region and already be off the free list;
  /// nothing inside the region may be used afterwards.
  pub unsafe fn release_region(
    &mut self,
    sentinel: Block,
  ) {
    let Some(index) = self
      .regions
      .iter()
      .position(|region| region.sentinel() == sentinel)
    else {
      log::warn!("release of unknown region {:p}", sentinel.as_ptr());
      return;
    };

    let region = self.regions.swap_remove(index);
    debug_assert_eq!(unsafe { sentinel.forward() } + HEADER_SIZE, region.size);

    unsafe { self.source.unmap_region(region.base, region.size) };
    self.heap_size -= region.size;
    self.unmaps += 1;

    log::debug!(
      "unmapped region {:p} ({} bytes), heap is {} bytes",
      region.base,
      region.size,
      self.heap_size
    );
  }

  /// Unmaps every region. Blocks handed out from them are dangling afterwards.
  pub fn release_all(&mut self) {
    for region in self.regions.drain(..) {
      unsafe { self.source.unmap_region(region.base, region.size) };
      self.unmaps += 1;
    }
    self.heap_size = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::PageSource;

  const PAGE: usize = 4096;

  fn manager() -> RegionManager<PageSource> {
    RegionManager::new(PageSource::new(PAGE), 32)
  }

  #[test]
  fn test_first_region_is_one_page() {
    let manager = manager();

    assert_eq!(manager.region_size(16), Some(PAGE));
    assert_eq!(manager.region_size(PAGE - 2 * HEADER_SIZE), Some(PAGE));
  }

  #[test]
  fn test_first_region_doubles_to_fit() {
    let manager = manager();

    assert_eq!(manager.region_size(PAGE), Some(2 * PAGE));
    assert_eq!(manager.region_size(3 * PAGE), Some(4 * PAGE));
    assert_eq!(manager.region_size(5 * PAGE), Some(8 * PAGE));
  }

  #[test]
  fn test_region_size_is_capped() {
    let manager = manager();

    assert_eq!(manager.region_size(100_000), Some(32 * PAGE));
    assert_eq!(manager.region_size(32 * PAGE - 2 * HEADER_SIZE), Some(32 * PAGE));
  }

  #[test]
  fn test_cap_never_rejects_large_requests() {
    let manager = manager();

    let size = 200_000;
    assert_eq!(
      manager.region_size(size),
      Some(align_to!(size + 2 * HEADER_SIZE, PAGE))
    );
  }

  #[test]
  fn test_region_size_overflow() {
    assert_eq!(manager().region_size(usize::MAX - HEADER_SIZE), None);
    assert_eq!(manager().region_size(usize::MAX / 2 + 1), None);
  }

  #[test]
  fn test_grow_doubles_with_heap_size() {
    let mut manager = manager();
    let mut free = FreeList::new();

    manager.grow(16, &mut free).unwrap();
    assert_eq!(manager.stats().heap_size, PAGE);

    // heap of one page: target is two pages, so the increment is one page
    assert_eq!(manager.region_size(16), Some(PAGE));
    manager.grow(16, &mut free).unwrap();

    // heap of two pages: target is four pages
    assert_eq!(manager.region_size(16), Some(2 * PAGE));
    manager.release_all();
  }

  #[test]
  fn test_grow_installs_boundary_blocks() {
    let mut manager = manager();
    let mut free = FreeList::new();

    let block = manager.grow(64, &mut free).unwrap();
    let region = manager.regions()[0];

    unsafe {
      assert_eq!(block, region.sentinel());
      assert!(block.is_sentinel());
      assert!(!block.is_allocated());
      assert_eq!(block.size(), PAGE - 2 * HEADER_SIZE);
      assert_eq!(block.next(), region.terminator());
      assert!(region.terminator().is_terminator());
      assert!(region.terminator().is_allocated());
      assert_eq!(region.terminator().previous(), block);
    }

    assert_eq!(free.head(), Some(block));
    assert!(region.contains(block));
    assert!(!region.contains(unsafe { Block::at(region.base().add(PAGE)) }));

    free.clear();
    manager.release_all();
  }

  #[test]
  fn test_release_region_updates_stats() {
    let mut manager = manager();
    let mut free = FreeList::new();

    let first = manager.grow(16, &mut free).unwrap();
    let second = manager.grow(16, &mut free).unwrap();

    unsafe {
      free.remove(first);
      manager.release_region(first);
    }

    assert_eq!(
      manager.stats(),
      RegionStats {
        heap_size: PAGE,
        regions: 1,
        maps: 2,
        unmaps: 1,
      }
    );
    assert_eq!(manager.regions()[0].sentinel(), second);
    assert_eq!(manager.source().unmaps(), 1);

    manager.release_all();
    assert_eq!(manager.stats().heap_size, 0);
    assert_eq!(manager.source().live(), 0);
  }

  #[test]
  fn test_map_failure_propagates() {
    let mut manager = RegionManager::new(PageSource::failing(PAGE), 32);
    let mut free = FreeList::new();

    let err = manager.grow(16, &mut free).unwrap_err();

    assert!(matches!(err, AllocError::MapFailed { size: PAGE, .. }));
    assert!(free.is_empty());
    assert_eq!(manager.stats(), RegionStats::default());
  }

  #[test]
  fn test_mmap_source_round_trip() {
    let mut source = MmapSource::new();
    let page = source.page_size();
    assert!(page.is_power_of_two());

    let base = source.map_region(page).unwrap();
    assert_eq!(base.as_ptr() as usize % page, 0);

    unsafe {
      base.write_bytes(0xAB, page);
      assert_eq!(*base.add(page - 1).as_ptr(), 0xAB);
      source.unmap_region(base, page);
    }
  }
}
