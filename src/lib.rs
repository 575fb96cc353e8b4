//! # tagalloc - A Boundary-Tag Heap Allocator
//!
//! This crate provides a general-purpose heap built on **boundary tags** and
//! an **explicit free list**, drawing its memory from the OS with `mmap(2)`.
//!
//! ## Overview
//!
//! The heap is a set of independent regions. Each region starts with a
//! sentinel block, ends with a terminator header, and is carved into blocks
//! in between:
//!
//! ```text
//!   One Region:
//!
//!   ┌──────────┬──────────┬──────────┬──────────────────────────┬────────┐
//!   │ sentinel │  block   │  block   │        free block        │  term  │
//!   │ (alloc)  │  (free)  │ (alloc)  │                          │        │
//!   └──────────┴──────────┴──────────┴──────────────────────────┴────────┘
//!   ▲ backward == 0                                             ▲ forward == 0
//!
//!   Every header knows the distance to both neighbours, so a released block
//!   finds and merges with its free neighbours in O(1).
//! ```
//!
//! Free blocks are linked through their own payloads, across all regions:
//!
//! ```text
//!   head ──► ┌────────┐ ──► ┌────────┐ ──► ┌────────┐ ──► None
//!            │ free A │     │ free B │     │ free C │
//!   None ◄── └────────┘ ◄── └────────┘ ◄── └────────┘
//!             region 1       region 2       region 1
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Boundary-tag headers and block navigation
//!   ├── free_list  - Explicit doubly-linked free list
//!   ├── region     - OS regions, growth policy, mmap source
//!   ├── heap       - Heap: allocate / release / init
//!   ├── check      - Heap consistency checker
//!   ├── config     - HeapConfig, ReclaimPolicy
//!   └── error      - AllocError
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tagalloc::Heap;
//!
//! let mut heap = Heap::new();
//!
//! let ptr = heap.allocate(64).unwrap().cast::<u64>();
//!
//! unsafe {
//!     ptr.write(42);
//!     assert_eq!(ptr.read(), 42);
//!
//!     heap.release(ptr.cast());
//! }
//! ```
//!
//! ## How It Works
//!
//! Each block is a header followed by its payload:
//!
//! ```text
//!   ┌───────────────────────┬────────────────────────────────┐
//!   │    Block Header       │           Payload              │
//!   │  ┌─────────────────┐  │                                │
//!   │  │ forward         │  │  allocated: user data          │
//!   │  │ backward        │  │  free:      next / prev links  │
//!   │  │ state           │  │                                │
//!   │  └─────────────────┘  │                                │
//!   └───────────────────────┴────────────────────────────────┘
//!                           ▲
//!                           └── Pointer returned to user (16-byte aligned)
//! ```
//!
//! - **Allocate**: first-fit scan of the free list. A block with room to
//!   spare is split, leaving a free remainder. If nothing fits, a new region
//!   is mapped, doubling the heap each time up to a configurable cap.
//! - **Release**: the block is merged with a free successor and a free
//!   predecessor. A region left holding a single free block is unmapped,
//!   subject to the [`ReclaimPolicy`].
//!
//! ## Limitations
//!
//! - **Single-threaded only**: a `Heap` is neither `Send` nor `Sync`
//! - **No realloc/calloc**
//! - **Misuse is undetected**: double releases and foreign pointers corrupt
//!   the heap; [`Heap::check`] can find the damage afterwards
//! - **Unix-only** for the default [`MmapSource`]
//!
//! ## Safety
//!
//! Releasing memory requires `unsafe`: the heap cannot verify that a pointer
//! is one of its own live allocations.

pub mod align;
pub mod block;
pub mod check;
pub mod config;
pub mod error;
pub mod free_list;
pub mod heap;
pub mod region;

#[cfg(test)]
mod testing;

pub use check::Violation;
pub use config::{HeapConfig, ReclaimPolicy};
pub use error::AllocError;
pub use heap::Heap;
pub use region::{MmapSource, Region, RegionSource, RegionStats};
