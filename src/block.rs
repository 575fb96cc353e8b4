use std::{mem, ptr::NonNull};

use crate::align;

/// Allocation state carried by every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
  Free,
  Allocated,
}

/// Boundary tag placed in front of every block.
///
/// `forward` and `backward` are byte distances between headers, so both
/// already include the size of the header they start from.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct Header {
  forward: usize,
  backward: usize,
  state: BlockState,
}

pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Smallest payload a block may carry: it must be able to hold a [`FreeNode`] once released.
pub const MIN_PAYLOAD: usize = align!(mem::size_of::<FreeNode>());

const _: () = assert!(HEADER_SIZE % align::ALIGNMENT == 0);

/// Links of the free list, stored in the payload of a free block.
#[derive(Debug)]
pub struct FreeNode {
  pub next: Option<Block>,
  pub prev: Option<Block>,
}

/// What the bytes after a header currently hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
  Occupied(NonNull<u8>),
  Free(NonNull<FreeNode>),
}

/// Handle to a block header living inside a mapped region.
///
/// Every method dereferences the header, so they are only sound while the
/// region holding the block is still mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(NonNull<Header>);

impl Block {
  /// # Safety
  ///
  /// `addr` must be 16-byte aligned and point at `HEADER_SIZE` writable bytes.
  pub unsafe fn at(addr: NonNull<u8>) -> Self {
    Self(addr.cast())
  }

  /// Recovers the header of a payload returned by [`Block::payload`].
  ///
  /// # Safety
  ///
  /// `payload` must come from a live block of this heap.
  pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
    Self(unsafe { payload.sub(HEADER_SIZE) }.cast())
  }

  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  pub fn as_ptr(self) -> *mut u8 {
    self.0.as_ptr().cast()
  }

  pub fn payload(self) -> NonNull<u8> {
    unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
  }

  /// Writes a whole header.
  ///
  /// # Safety
  ///
  /// The block must point at header storage inside a mapped region.
  pub unsafe fn pack(
    self,
    forward: usize,
    backward: usize,
    state: BlockState,
  ) {
    unsafe {
      self.0.write(Header {
        forward,
        backward,
        state,
      });
    }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn forward(self) -> usize {
    unsafe { (*self.0.as_ptr()).forward }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn backward(self) -> usize {
    unsafe { (*self.0.as_ptr()).backward }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn set_forward(
    self,
    forward: usize,
  ) {
    unsafe { (*self.0.as_ptr()).forward = forward }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn set_backward(
    self,
    backward: usize,
  ) {
    unsafe { (*self.0.as_ptr()).backward = backward }
  }

  /// Usable payload bytes.
  ///
  /// # Safety
  ///
  /// Must not be called on a terminator.
  pub unsafe fn size(self) -> usize {
    unsafe { self.forward() - HEADER_SIZE }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn state(self) -> BlockState {
    unsafe { (*self.0.as_ptr()).state }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn is_allocated(self) -> bool {
    unsafe { self.state() == BlockState::Allocated }
  }

  /// Changes the tag only; offsets are left untouched.
  ///
  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn set_state(
    self,
    state: BlockState,
  ) {
    unsafe { (*self.0.as_ptr()).state = state }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn is_terminator(self) -> bool {
    unsafe { self.forward() == 0 }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn is_sentinel(self) -> bool {
    unsafe { self.backward() == 0 }
  }

  /// # Safety
  ///
  /// Must not be called on a terminator.
  pub unsafe fn next(self) -> Self {
    unsafe { Self(self.0.byte_add(self.forward())) }
  }

  /// # Safety
  ///
  /// Must not be called on a sentinel.
  pub unsafe fn previous(self) -> Self {
    unsafe { Self(self.0.byte_sub(self.backward())) }
  }

  /// # Safety
  ///
  /// See [`Block::pack`].
  pub unsafe fn storage(self) -> Storage {
    unsafe {
      match self.state() {
        BlockState::Allocated => Storage::Occupied(self.payload()),
        BlockState::Free => Storage::Free(self.payload().cast()),
      }
    }
  }

  /// The free-list node of a free block.
  ///
  /// # Safety
  ///
  /// The block must be tagged free; an allocated payload belongs to its owner.
  pub unsafe fn free_node(self) -> NonNull<FreeNode> {
    match unsafe { self.storage() } {
      Storage::Free(node) => node,
      Storage::Occupied(_) => {
        unreachable!("free node read from allocated block {:p}", self.as_ptr())
      }
    }
  }

  /// Tags the block free and gives its payload an unlinked free node.
  ///
  /// # Safety
  ///
  /// The block must have at least [`MIN_PAYLOAD`] bytes of payload.
  pub unsafe fn mark_free(self) -> NonNull<FreeNode> {
    unsafe {
      self.set_state(BlockState::Free);
      let node = self.free_node();
      node.write(FreeNode {
        next: None,
        prev: None,
      });
      node
    }
  }

  /// Tags the block allocated and hands out its payload. The free node is
  /// dead from here on.
  ///
  /// # Safety
  ///
  /// The block must already be unlinked from the free list.
  pub unsafe fn mark_allocated(self) -> NonNull<u8> {
    unsafe {
      self.set_state(BlockState::Allocated);
      self.payload()
    }
  }
}
