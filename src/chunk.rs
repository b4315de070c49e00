//! Chunk headers, checksums and safe-linked free-list links.
//!
//! Every chunk handed out by a block is preceded by a 16-byte [`ChunkHeader`].
//! While a chunk is free, its first word stores the next free chunk, XOR-masked
//! with the slot address and a per-block key so that a stray write cannot steer
//! the allocator to an arbitrary address.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::HeapError;

pub(crate) const CHUNK_HEADER_SIZE: usize = size_of::<ChunkHeader>();

const CHUNK_TAG: u32 = 0x4b4e_4843; // "CHNK"

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
  Free = 0,
  Allocated = 1,
  /// Freed by a foreign thread, waiting in the owner's mailbox.
  Quarantine = 2,
}

impl ChunkState {
  fn from_bits(bits: u16) -> Self {
    match bits {
      0 => Self::Free,
      1 => Self::Allocated,
      _ => Self::Quarantine,
    }
  }
}

#[repr(C)]
pub(crate) struct ChunkHeader {
  checksum: u32,
  class: u16,
  state: AtomicU16,
  /// Requested size.
  size: u32,
  tag: u32,
}

const _: () = assert!(CHUNK_HEADER_SIZE == 16);

impl ChunkHeader {
  /// Header of the chunk whose payload starts at `ptr`.
  #[inline(always)]
  pub(crate) fn of(ptr: *mut u8) -> *mut ChunkHeader {
    ptr.wrapping_sub(CHUNK_HEADER_SIZE).cast()
  }

  /// Stamps a newly carved chunk as allocated.
  #[inline]
  pub(crate) unsafe fn init(hdr: *mut ChunkHeader, ptr: *mut u8, class: usize, size: usize, cookie: u64) {
    unsafe {
      hdr.write(ChunkHeader {
        checksum: checksum(cookie, ptr, class, size),
        class: class as u16,
        state: AtomicU16::new(ChunkState::Allocated as u16),
        size: size as u32,
        tag: CHUNK_TAG,
      })
    };
  }

  /// Records a new requested size for a chunk the caller holds.
  #[inline]
  pub(crate) unsafe fn resize(hdr: *mut ChunkHeader, ptr: *mut u8, size: usize, cookie: u64) {
    unsafe {
      (*hdr).size = size as u32;
      (*hdr).checksum = checksum(cookie, ptr, (*hdr).class as usize, size);
    }
  }

  /// Checks tag, checksum and that the chunk belongs to `block_class`.
  pub(crate) fn verify(&self, ptr: *mut u8, cookie: u64, block_class: usize) -> Result<(), HeapError> {
    let class = self.class as usize;
    if self.tag != CHUNK_TAG || self.checksum != checksum(cookie, ptr, class, self.size as usize) {
      return Err(HeapError::ChecksumMismatch(ptr as usize));
    }
    if class != block_class {
      return Err(HeapError::ClassMismatch {
        ptr: ptr as usize,
        header: class,
        block: block_class,
      });
    }
    Ok(())
  }

  #[inline]
  pub(crate) fn class(&self) -> usize {
    self.class as usize
  }

  #[inline]
  pub(crate) fn size(&self) -> usize {
    self.size as usize
  }

  #[inline]
  pub(crate) fn state(&self) -> ChunkState {
    ChunkState::from_bits(self.state.load(Ordering::Acquire))
  }

  /// Moves the chunk from `from` to `to`. Fails if another thread got there first.
  #[inline]
  pub(crate) fn transition(&self, from: ChunkState, to: ChunkState) -> bool {
    self
      .state
      .compare_exchange(from as u16, to as u16, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }
}

/// The checksum covers everything but the state, which changes on every free.
#[inline]
fn checksum(cookie: u64, ptr: *mut u8, class: usize, size: usize) -> u32 {
  let h = mix64(cookie ^ ptr as u64 ^ ((class as u64) << 48) ^ ((size as u64) << 16));
  (h ^ (h >> 32)) as u32
}

/// SplitMix64 finalizer.
#[inline]
pub(crate) const fn mix64(mut x: u64) -> u64 {
  x ^= x >> 30;
  x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
  x ^= x >> 27;
  x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
  x ^ (x >> 31)
}

// =============================================================================
// Safe-Linking
// =============================================================================

/// Stores `next` in the free chunk at `slot`.
#[inline(always)]
pub(crate) unsafe fn set_link(slot: *mut u8, next: *mut u8, key: usize) {
  let masked = next as usize ^ (slot as usize >> 12) ^ key;
  unsafe { slot.cast::<usize>().write(masked) };
}

/// Reads back the successor stored by [`set_link`].
#[inline(always)]
pub(crate) unsafe fn get_link(slot: *mut u8, key: usize) -> *mut u8 {
  let masked = unsafe { slot.cast::<usize>().read() };
  (masked ^ (slot as usize >> 12) ^ key) as *mut u8
}
