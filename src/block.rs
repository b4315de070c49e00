//! 64 KiB blocks: one size class, one owning thread.
//!
//! The owner allocates from a local free list, then from a bump cursor over the
//! never-used tail of the block. Foreign threads push freed chunks onto a
//! lock-free mailbox (`remote_free`) which the owner drains when it runs dry.
//!
//! Blocks are handled through raw pointers: the owner mutates cache line 0 with
//! plain writes while other threads touch the atomics on cache line 1.

use core::{
  mem::offset_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering},
};

use crate::{
  BLOCK_ALIGN_MASK, BLOCK_SIZE, HeapError,
  chunk::{self, CHUNK_HEADER_SIZE, ChunkHeader, ChunkState},
  size_class::{class_to_count, class_to_size},
  stats::BlockInfo,
  superblock::{NUMA_ANY, Superblock},
};

pub(crate) const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

const BLOCK_MAGIC: u64 = 0x5354_5241_5441_424b; // "STRATABK"

/// `owner` value of a block no thread owns.
pub(crate) const DETACHED: u64 = 0;

/// Dedicated to a class; cleared when the block goes back to its superblock.
pub(crate) const FLAG_ACTIVE: u8 = 1 << 0;
/// Owner exited with chunks still live; only a sweep may reclaim it.
pub(crate) const FLAG_ORPHANED: u8 = 1 << 1;
/// Token held by whoever currently queues or reclaims the block.
pub(crate) const FLAG_POOLED: u8 = 1 << 2;

#[repr(C, align(128))]
pub(crate) struct BlockHeader {
  // === Cache line 0: owner-thread hot path (no cross-thread writes) ===
  /// Locally freed chunks (payload pointers, safe-linked).
  pub(crate) local_free: *mut u8,
  /// Next never-used chunk payload.
  scan_ptr: *mut u8,
  /// One past the last whole chunk payload.
  scan_end: *mut u8,
  /// Safe-linking key.
  key: usize,
  stride: u32,
  /// Chunks the owner can hand out without draining.
  pub(crate) free_count: u32,
  pub(crate) max_count: u32,
  pub(crate) class: u8,
  _pad0: [u8; 19],

  // === Cache line 1: cross-thread fields ===
  /// Chunks freed by other threads (Treiber stack).
  pub(crate) remote_free: AtomicPtr<u8>,
  /// Owning thread id, or [`DETACHED`].
  pub(crate) owner: AtomicU64,
  /// Live chunks.
  pub(crate) used: AtomicU32,
  /// `class | max_count << 8`, readable by any thread.
  meta: AtomicU32,
  pub(crate) flags: AtomicU8,
  pub(crate) superblock: *mut Superblock,
  /// Intrusive link for class pools and superblock free lists.
  pub(crate) pool_next: *mut BlockHeader,
  magic: u64,
}

const _: () = assert!(BLOCK_HEADER_SIZE == 128);
const _: () = assert!(offset_of!(BlockHeader, remote_free) >= 64);

impl BlockHeader {
  /// Block containing `ptr`, found by address masking.
  #[inline(always)]
  pub(crate) fn containing(ptr: *const u8) -> *mut BlockHeader {
    (ptr as usize & BLOCK_ALIGN_MASK) as *mut BlockHeader
  }

  /// Class index, safe to read from any thread.
  #[inline]
  pub(crate) fn class_index(&self) -> usize {
    (self.meta.load(Ordering::Acquire) & 0xff) as usize
  }

  #[inline]
  fn chunk_limit(&self) -> usize {
    (self.meta.load(Ordering::Acquire) >> 8) as usize
  }

  #[inline]
  pub(crate) fn has_flag(&self, flag: u8) -> bool {
    self.flags.load(Ordering::Acquire) & flag != 0
  }

  /// Claims the pool token. Only the winner may queue or reclaim the block.
  #[inline]
  pub(crate) fn take_token(&self) -> bool {
    self.flags.fetch_or(FLAG_POOLED, Ordering::AcqRel) & FLAG_POOLED == 0
  }

  #[inline]
  pub(crate) fn release_token(&self) {
    self.flags.fetch_and(!FLAG_POOLED, Ordering::AcqRel);
  }
}

/// Resets a block handed out by its superblock. It belongs to no class yet.
pub(crate) unsafe fn carve(block: *mut BlockHeader, sb: *mut Superblock) {
  unsafe {
    (*block).local_free = null_mut();
    (*block).free_count = 0;
    (*block).max_count = 0;
    (*block).remote_free.store(null_mut(), Ordering::Relaxed);
    (*block).owner.store(DETACHED, Ordering::Relaxed);
    (*block).used.store(0, Ordering::Relaxed);
    (*block).meta.store(0, Ordering::Relaxed);
    (*block).flags.store(0, Ordering::Relaxed);
    (*block).superblock = sb;
    (*block).pool_next = null_mut();
    (*block).magic = BLOCK_MAGIC;
  }
}

/// Dedicates an empty block to `class` and hands it to thread `tid`.
pub(crate) unsafe fn init(block: *mut BlockHeader, class: usize, tid: u64, cookie: u64) {
  let stride = class_to_size(class) + CHUNK_HEADER_SIZE;
  let count = class_to_count(class);
  unsafe {
    let first = (block as *mut u8).add(BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE);
    (*block).local_free = null_mut();
    (*block).scan_ptr = first;
    (*block).scan_end = first.add(count * stride);
    (*block).key = chunk::mix64(cookie ^ block as u64) as usize;
    (*block).stride = stride as u32;
    (*block).free_count = count as u32;
    (*block).max_count = count as u32;
    (*block).class = class as u8;
    (*block).remote_free.store(null_mut(), Ordering::Relaxed);
    (*block).used.store(0, Ordering::Relaxed);
    (*block).meta.store(class as u32 | (count as u32) << 8, Ordering::Release);
    (*block).owner.store(tid, Ordering::Release);
    (*block).flags.fetch_or(FLAG_ACTIVE, Ordering::Release);
  }
}

#[inline]
unsafe fn in_chunk_area(block: *mut BlockHeader, ptr: *mut u8) -> bool {
  let first = block as usize + BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE;
  let addr = ptr as usize;
  if addr < first {
    return false;
  }
  let offset = addr - first;
  let stride = unsafe { (*block).stride } as usize;
  offset % stride == 0 && offset / stride < unsafe { (*block).max_count } as usize
}

/// Hands out one chunk of the block's class recording `size` as its requested
/// size. `Ok(None)` means the block is exhausted until the mailbox is drained.
#[inline]
pub(crate) unsafe fn block_alloc(block: *mut BlockHeader, size: usize, cookie: u64) -> Result<Option<NonNull<u8>>, HeapError> {
  unsafe {
    let head = (*block).local_free;
    if !head.is_null() {
      let next = chunk::get_link(head, (*block).key);
      if !next.is_null() && !in_chunk_area(block, next) {
        (*block).local_free = null_mut();
        return Err(HeapError::CorruptFreeList(block as usize));
      }
      let hdr = ChunkHeader::of(head);
      if !(*hdr).transition(ChunkState::Free, ChunkState::Allocated) {
        (*block).local_free = null_mut();
        return Err(HeapError::CorruptFreeList(block as usize));
      }
      (*block).local_free = next;
      ChunkHeader::resize(hdr, head, size, cookie);
      (*block).free_count -= 1;
      (*block).used.fetch_add(1, Ordering::Relaxed);
      return Ok(Some(NonNull::new_unchecked(head)));
    }

    // Bump allocate
    let ptr = (*block).scan_ptr;
    if ptr < (*block).scan_end {
      (*block).scan_ptr = ptr.add((*block).stride as usize);
      ChunkHeader::init(ChunkHeader::of(ptr), ptr, (*block).class as usize, size, cookie);
      (*block).free_count -= 1;
      (*block).used.fetch_add(1, Ordering::Relaxed);
      return Ok(Some(NonNull::new_unchecked(ptr)));
    }

    Ok(None)
  }
}

/// Checks that `ptr` is the payload of a chunk of `block` with an intact header.
pub(crate) unsafe fn validate<'a>(block: *mut BlockHeader, ptr: *mut u8, cookie: u64) -> Result<&'a ChunkHeader, HeapError> {
  unsafe {
    let magic = (*block).magic;
    if magic != BLOCK_MAGIC {
      return Err(if magic == 0 {
        HeapError::ForeignPointer(ptr as usize)
      } else {
        HeapError::BadBlockMagic(block as usize)
      });
    }
    if !(*block).has_flag(FLAG_ACTIVE) {
      return Err(HeapError::ForeignPointer(ptr as usize));
    }

    let class = (*block).class_index();
    let stride = class_to_size(class) + CHUNK_HEADER_SIZE;
    let first = block as usize + BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE;
    let addr = ptr as usize;
    if addr < first || (addr - first) % stride != 0 || (addr - first) / stride >= (*block).chunk_limit() {
      return Err(HeapError::ForeignPointer(addr));
    }

    let hdr = &*ChunkHeader::of(ptr);
    hdr.verify(ptr, cookie, class)?;
    Ok(hdr)
  }
}

/// Returns a chunk to its owner's local free list.
#[inline]
pub(crate) unsafe fn block_free(block: *mut BlockHeader, ptr: *mut u8, hdr: &ChunkHeader) -> Result<(), HeapError> {
  if !hdr.transition(ChunkState::Allocated, ChunkState::Free) {
    return Err(HeapError::DoubleFree(ptr as usize));
  }
  unsafe {
    chunk::set_link(ptr, (*block).local_free, (*block).key);
    (*block).local_free = ptr;
    (*block).free_count += 1;
    (*block).used.fetch_sub(1, Ordering::Release);
  }
  Ok(())
}

/// Pushes a chunk onto the block's mailbox from a foreign thread.
/// The caller settles `used` afterwards.
pub(crate) unsafe fn push_remote(block: *mut BlockHeader, ptr: *mut u8, hdr: &ChunkHeader) -> Result<(), HeapError> {
  if !hdr.transition(ChunkState::Allocated, ChunkState::Quarantine) {
    return Err(HeapError::DoubleFree(ptr as usize));
  }
  unsafe {
    let key = (*block).key;
    loop {
      let head = (*block).remote_free.load(Ordering::Relaxed);
      chunk::set_link(ptr, head, key);
      if (*block)
        .remote_free
        .compare_exchange_weak(head, ptr, Ordering::SeqCst, Ordering::Relaxed)
        .is_ok()
      {
        break;
      }
    }
  }
  Ok(())
}

/// Moves every chunk from the mailbox to the local free list. Owner only.
/// Returns the number of chunks recovered.
pub(crate) unsafe fn drain_remote(block: *mut BlockHeader) -> Result<u32, HeapError> {
  unsafe {
    let head = (*block).remote_free.swap(null_mut(), Ordering::Acquire);
    if head.is_null() {
      return Ok(0);
    }

    let key = (*block).key;
    let mut count = 0u32;
    let mut tail = head;
    loop {
      if !in_chunk_area(block, tail) || !(*ChunkHeader::of(tail)).transition(ChunkState::Quarantine, ChunkState::Free) {
        return Err(HeapError::CorruptFreeList(block as usize));
      }
      count += 1;
      let next = chunk::get_link(tail, key);
      if next.is_null() {
        break;
      }
      if count >= (*block).max_count {
        return Err(HeapError::CorruptFreeList(block as usize));
      }
      tail = next;
    }

    chunk::set_link(tail, (*block).local_free, key);
    (*block).local_free = head;
    (*block).free_count += count;
    Ok(count)
  }
}

/// Snapshot for heap walks. `None` for blocks not dedicated to a class.
pub(crate) unsafe fn info(block: *mut BlockHeader) -> Option<BlockInfo> {
  unsafe {
    let flags = (*block).flags.load(Ordering::Acquire);
    if flags & FLAG_ACTIVE == 0 {
      return None;
    }
    let class = (*block).class_index();
    Some(BlockInfo {
      addr: block as usize,
      block_size: BLOCK_SIZE,
      size_class: class,
      class_size: class_to_size(class),
      used_chunks: (*block).used.load(Ordering::Acquire) as usize,
      total_chunks: (*block).chunk_limit(),
      owner: (*block).owner.load(Ordering::Acquire),
      orphaned: flags & FLAG_ORPHANED != 0,
      pooled: flags & FLAG_POOLED != 0,
      numa_node: (*block).superblock.as_ref().map_or(NUMA_ANY, |sb| sb.numa_node),
    })
  }
}
