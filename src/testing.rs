//! In-process region source for tests.

use std::{
  alloc::{self, Layout},
  io,
  ptr::NonNull,
};

use crate::region::RegionSource;

/// Serves page-aligned regions from the system allocator and records every call.
#[derive(Debug)]
pub struct PageSource {
  page_size: usize,
  live: Vec<(usize, usize)>,
  maps: usize,
  unmaps: usize,
  failing: bool,
}

impl PageSource {
  pub fn new(page_size: usize) -> Self {
    Self {
      page_size,
      live: Vec::new(),
      maps: 0,
      unmaps: 0,
      failing: false,
    }
  }

  /// A source whose every `map_region` fails.
  pub fn failing(page_size: usize) -> Self {
    let mut source = Self::new(page_size);
    source.failing = true;
    source
  }

  pub fn set_failing(
    &mut self,
    failing: bool,
  ) {
    self.failing = failing;
  }

  pub fn maps(&self) -> usize {
    self.maps
  }

  pub fn unmaps(&self) -> usize {
    self.unmaps
  }

  pub fn live(&self) -> usize {
    self.live.len()
  }

  fn layout(
    &self,
    size: usize,
  ) -> Layout {
    Layout::from_size_align(size, self.page_size).unwrap()
  }
}

impl RegionSource for PageSource {
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn map_region(
    &mut self,
    size: usize,
  ) -> io::Result<NonNull<u8>> {
    assert_eq!(size % self.page_size, 0, "region of {size} bytes is not page sized");

    if self.failing {
      return Err(io::Error::from(io::ErrorKind::OutOfMemory));
    }

    let base = NonNull::new(unsafe { alloc::alloc_zeroed(self.layout(size)) })
      .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

    self.live.push((base.as_ptr() as usize, size));
    self.maps += 1;
    Ok(base)
  }

  unsafe fn unmap_region(
    &mut self,
    base: NonNull<u8>,
    size: usize,
  ) {
    let index = self
      .live
      .iter()
      .position(|&live| live == (base.as_ptr() as usize, size))
      .unwrap_or_else(|| panic!("unmap of {base:p} ({size} bytes) does not match a mapping"));

    self.live.swap_remove(index);
    self.unmaps += 1;
    unsafe { alloc::dealloc(base.as_ptr(), self.layout(size)) };
  }
}

impl Drop for PageSource {
  fn drop(&mut self) {
    let live: Vec<_> = self.live.drain(..).collect();
    for (base, size) in live {
      unsafe { alloc::dealloc(base as *mut u8, self.layout(size)) };
    }
  }
}
