//! strata: a thread-aware, segregated-fit `malloc` replacement.
//!
//! Memory is organised in three levels:
//!
//! - **Superblocks**: 4 MiB regions mapped from the OS, aligned to 2 MiB so the
//!   kernel can back them with transparent huge pages.
//! - **Blocks**: 64 KiB slices of a superblock, each dedicated to one size class
//!   and owned by one thread at a time.
//! - **Chunks**: user allocations carved out of a block, each preceded by a
//!   small checksummed header.
//!
//! The owning thread allocates and frees without synchronization. Other threads
//! return chunks through a lock-free per-block mailbox that the owner drains on
//! its slow path. Requests made before the heap is initialized (typically by
//! the dynamic linker when the library is preloaded) are served from a static
//! bootstrap buffer.
//!
//! # Usage (Rust)
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: strata::Strata = strata::Strata;
//! ```
//!
//! # Usage (C, with `--features c_api`)
//!
//! ```bash,ignore
//! LD_PRELOAD=libstrata.so ./your_program
//! ```
#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr,
};

mod block;
pub mod bootstrap;
mod chunk;
mod config;
mod error;
pub mod ffi;
mod heap;
mod large;
mod platform;
pub mod size_class;
mod stats;
mod superblock;
mod sync;

pub use error::HeapError;
pub use heap::{
  aligned_alloc, calloc, free, heap_walk, malloc, malloc_usable_size, memalign, posix_memalign,
  realloc, thread_stats,
};
pub use stats::{BlockInfo, CtlError, GlobalStats, ThreadStats, ctl, global_stats};

// =============================================================================
// Constants
// =============================================================================

/// Bytes mapped per superblock.
pub const SUPERBLOCK_SIZE: usize = 4 << 20; // 4MB
/// Alignment of every superblock (one transparent huge page).
pub const SUPERBLOCK_ALIGN: usize = 2 << 20; // 2MB

const BLOCK_SIZE_BITS: usize = 16;
/// Bytes per block.
pub const BLOCK_SIZE: usize = 1 << BLOCK_SIZE_BITS; // 64KB
const BLOCK_ALIGN_MASK: usize = !(BLOCK_SIZE - 1);
/// Blocks per superblock. Block 0 holds the superblock header and is never handed out.
pub const BLOCKS_PER_SUPERBLOCK: usize = SUPERBLOCK_SIZE / BLOCK_SIZE;

/// Alignment guaranteed for every pointer returned by the heap.
pub const MIN_ALIGN: usize = 16;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SUPERBLOCK_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_ALIGN.is_power_of_two());
const _: () = assert!(SUPERBLOCK_SIZE % SUPERBLOCK_ALIGN == 0);
const _: () = assert!(SUPERBLOCK_ALIGN % BLOCK_SIZE == 0);
const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(BLOCKS_PER_SUPERBLOCK >= 2);
const _: () = assert!(size_of::<superblock::Superblock>() <= BLOCK_SIZE);
const _: () = assert!(block::BLOCK_HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(chunk::CHUNK_HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(size_class::class_to_count(size_class::CLASS_COUNT - 1) >= 1);

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The heap as a Rust global allocator.
pub struct Strata;

unsafe impl GlobalAlloc for Strata {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      unsafe { malloc(layout.size()) }
    } else {
      unsafe { memalign(layout.align(), layout.size()) }
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { free(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return unsafe { realloc(ptr, new_size) };
    }

    let new_ptr = unsafe { memalign(layout.align(), new_size) };
    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { free(ptr) };
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return unsafe { calloc(1, layout.size()) };
    }

    let ptr = unsafe { memalign(layout.align(), layout.size()) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
