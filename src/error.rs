use std::io;

/// Why [`Heap::allocate`](crate::Heap::allocate) could not hand out a block.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
  #[error("failed to map a {size} byte region")]
  MapFailed {
    size: usize,
    #[source]
    source: io::Error,
  },
  #[error("out of memory: no block of {size} bytes after growing the heap")]
  OutOfMemory { size: usize },
  #[error("allocation of {size} bytes overflows the address space")]
  SizeOverflow { size: usize },
}
