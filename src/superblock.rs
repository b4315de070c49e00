//! Superblocks: 4 MiB, 2 MiB-aligned regions carved into 64 KiB blocks.
//!
//! The registry keeps every live superblock on one doubly linked list. Those
//! with blocks left to hand out sit in front of the full ones, so carving a
//! block only ever looks at the head. A static bitmap over 2 MiB regions tells
//! `free` whether a pointer lies inside any superblock without touching it.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{
  BLOCK_SIZE, BLOCKS_PER_SUPERBLOCK, HeapError, SUPERBLOCK_ALIGN, SUPERBLOCK_SIZE, align_up,
  block::{self, BlockHeader},
  platform::{self, Advice},
  stats::COUNTERS,
};

const SUPERBLOCK_MAGIC: u32 = 0x5354_5241; // "STRA"
const SUPERBLOCK_DEAD: u32 = 0xdead_beef;

/// No NUMA preference.
pub(crate) const NUMA_ANY: i32 = -1;

#[repr(C, align(64))]
pub(crate) struct Superblock {
  next: *mut Superblock,
  prev: *mut Superblock,
  /// Blocks currently handed out.
  pub(crate) used_blocks: AtomicUsize,
  pub(crate) numa_node: i32,
  magic: u32,
  /// Next never-carved block index. Guarded by the registry lock.
  carved: usize,
  /// Blocks given back since carving. Guarded by the registry lock.
  free_blocks: *mut BlockHeader,
}

impl Superblock {
  /// Maps a new superblock. Over-maps by the alignment and trims both ends so
  /// that exactly `SUPERBLOCK_SIZE` bytes stay mapped.
  pub(crate) fn acquire(numa_hint: i32, huge_pages: bool) -> Result<NonNull<Superblock>, HeapError> {
    let map_len = SUPERBLOCK_SIZE + SUPERBLOCK_ALIGN;
    let raw = unsafe { platform::map(map_len) };
    if raw.is_null() {
      return Err(HeapError::OutOfMemory(map_len));
    }

    let base = align_up(raw as usize, SUPERBLOCK_ALIGN);
    let head = base - raw as usize;
    let tail = map_len - head - SUPERBLOCK_SIZE;
    unsafe {
      if head > 0 {
        platform::unmap(raw, head);
      }
      if tail > 0 {
        platform::unmap((base + SUPERBLOCK_SIZE) as *mut u8, tail);
      }
    }

    if huge_pages && !unsafe { platform::advise(base as *mut u8, SUPERBLOCK_SIZE, Advice::HugePage) } {
      log::warn!("strata: MADV_HUGEPAGE refused for superblock {base:#x}");
    }

    let sb = base as *mut Superblock;
    unsafe {
      sb.write(Superblock {
        next: null_mut(),
        prev: null_mut(),
        used_blocks: AtomicUsize::new(0),
        numa_node: numa_hint,
        magic: SUPERBLOCK_MAGIC,
        carved: 1,
        free_blocks: null_mut(),
      })
    };
    REGIONS.mark(base, SUPERBLOCK_SIZE, true);
    COUNTERS.superblock_mapped();
    log::debug!("strata: mapped superblock {base:#x}");
    Ok(unsafe { NonNull::new_unchecked(sb) })
  }

  /// Returns the superblock to the OS. Refuses anything that does not carry
  /// a live superblock magic.
  pub(crate) unsafe fn release(sb: NonNull<Superblock>) -> Result<(), HeapError> {
    let sb = sb.as_ptr();
    unsafe {
      let magic = (*sb).magic;
      if magic != SUPERBLOCK_MAGIC {
        return Err(HeapError::BadSuperblockMagic {
          addr: sb as usize,
          found: magic,
        });
      }
      let used = (*sb).used_blocks.load(Ordering::Acquire);
      if used != 0 {
        log::warn!("strata: releasing superblock {sb:p} with {used} blocks in use");
      }
      (*sb).magic = SUPERBLOCK_DEAD;
      REGIONS.mark(sb as usize, SUPERBLOCK_SIZE, false);
      platform::unmap(sb.cast(), SUPERBLOCK_SIZE);
    }
    COUNTERS.superblock_unmapped();
    log::debug!("strata: unmapped superblock {sb:p}");
    Ok(())
  }

  #[inline]
  pub(crate) unsafe fn block_at(sb: *mut Superblock, index: usize) -> *mut BlockHeader {
    debug_assert!(index > 0 && index < BLOCKS_PER_SUPERBLOCK);
    (sb as usize + index * BLOCK_SIZE) as *mut BlockHeader
  }

  /// Blocks ever carved, including those given back.
  #[inline]
  pub(crate) unsafe fn carved(sb: *mut Superblock) -> usize {
    unsafe { (*sb).carved }
  }

  #[inline]
  unsafe fn has_capacity(sb: *mut Superblock) -> bool {
    unsafe { !(*sb).free_blocks.is_null() || (*sb).carved < BLOCKS_PER_SUPERBLOCK }
  }

  /// Hands out a given-back block, or carves the next untouched one.
  unsafe fn take(sb: *mut Superblock) -> Option<*mut BlockHeader> {
    unsafe {
      let block = if !(*sb).free_blocks.is_null() {
        let block = (*sb).free_blocks;
        (*sb).free_blocks = (*block).pool_next;
        block
      } else if (*sb).carved < BLOCKS_PER_SUPERBLOCK {
        let block = Self::block_at(sb, (*sb).carved);
        (*sb).carved += 1;
        block
      } else {
        return None;
      };
      block::carve(block, sb);
      (*sb).used_blocks.fetch_add(1, Ordering::Relaxed);
      COUNTERS.block_carved();
      Some(block)
    }
  }

  // Page advice over the block area. The header block is left alone.

  pub(crate) unsafe fn purge(sb: *mut Superblock) -> bool {
    unsafe { Self::advise_blocks(sb, Advice::Purge) }
  }

  pub(crate) unsafe fn prefetch(sb: *mut Superblock) -> bool {
    unsafe { Self::advise_blocks(sb, Advice::WillNeed) }
  }

  pub(crate) unsafe fn sequential(sb: *mut Superblock) -> bool {
    unsafe { Self::advise_blocks(sb, Advice::Sequential) }
  }

  pub(crate) unsafe fn random(sb: *mut Superblock) -> bool {
    unsafe { Self::advise_blocks(sb, Advice::Random) }
  }

  unsafe fn advise_blocks(sb: *mut Superblock, advice: Advice) -> bool {
    let start = (sb as usize + BLOCK_SIZE) as *mut u8;
    unsafe { platform::advise(start, SUPERBLOCK_SIZE - BLOCK_SIZE, advice) }
  }
}

// =============================================================================
// Region Map
// =============================================================================

const REGION_SHIFT: usize = SUPERBLOCK_ALIGN.trailing_zeros() as usize;
const ADDRESS_BITS: usize = 48;
const REGION_WORDS: usize = 1 << (ADDRESS_BITS - REGION_SHIFT - 6);

/// One bit per 2 MiB of user address space.
struct RegionMap {
  words: [AtomicU64; REGION_WORDS],
}

static REGIONS: RegionMap = RegionMap::new();

impl RegionMap {
  const fn new() -> Self {
    Self {
      words: [const { AtomicU64::new(0) }; REGION_WORDS],
    }
  }

  fn mark(&self, base: usize, len: usize, on: bool) {
    let first = base >> REGION_SHIFT;
    let last = (base + len - 1) >> REGION_SHIFT;
    for region in first..=last {
      let bit = 1u64 << (region & 63);
      let word = &self.words[region >> 6];
      if on {
        word.fetch_or(bit, Ordering::Release);
      } else {
        word.fetch_and(!bit, Ordering::Release);
      }
    }
  }

  #[inline]
  fn contains(&self, addr: usize) -> bool {
    let region = addr >> REGION_SHIFT;
    match self.words.get(region >> 6) {
      Some(word) => word.load(Ordering::Acquire) & (1u64 << (region & 63)) != 0,
      None => false,
    }
  }
}

/// Whether `ptr` lies inside a mapped superblock.
#[inline]
pub(crate) fn owns(ptr: *const u8) -> bool {
  REGIONS.contains(ptr as usize)
}

// =============================================================================
// Registry
// =============================================================================

/// The superblock list. Only reachable through the heap's registry lock.
pub(crate) struct Registry {
  head: *mut Superblock,
  tail: *mut Superblock,
  pub(crate) count: usize,
  /// Superblocks with no block handed out.
  pub(crate) empty: usize,
}

unsafe impl Send for Registry {}

impl Registry {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      tail: null_mut(),
      count: 0,
      empty: 0,
    }
  }

  pub(crate) unsafe fn insert(&mut self, sb: NonNull<Superblock>) {
    unsafe { self.push_front(sb.as_ptr()) };
    self.count += 1;
    self.empty += 1;
  }

  /// Carves a block from the first superblock with room. `None` when all are full.
  pub(crate) unsafe fn take_block(&mut self) -> Option<*mut BlockHeader> {
    let sb = self.head;
    unsafe {
      if sb.is_null() || !Superblock::has_capacity(sb) {
        return None;
      }
      let was_empty = (*sb).used_blocks.load(Ordering::Relaxed) == 0;
      let block = Superblock::take(sb)?;
      if was_empty {
        self.empty -= 1;
      }
      if !Superblock::has_capacity(sb) && self.tail != sb {
        self.unlink(sb);
        self.push_back(sb);
      }
      Some(block)
    }
  }

  /// Gives an unused block back to its superblock.
  pub(crate) unsafe fn return_block(&mut self, block: *mut BlockHeader) {
    unsafe {
      let sb = (*block).superblock;
      debug_assert_eq!((*sb).magic, SUPERBLOCK_MAGIC);

      #[cfg(feature = "release-mem")]
      platform::advise(block.cast(), BLOCK_SIZE, Advice::Purge);

      (*block).flags.store(0, Ordering::Release);
      (*block).pool_next = (*sb).free_blocks;
      (*sb).free_blocks = block;
      if (*sb).used_blocks.fetch_sub(1, Ordering::AcqRel) == 1 {
        self.empty += 1;
      }
      if self.head != sb {
        self.unlink(sb);
        self.push_front(sb);
      }
    }
    COUNTERS.block_returned();
  }

  /// Unlinks one empty superblock if more than `retain` are empty.
  pub(crate) unsafe fn evict_empty(&mut self, retain: usize) -> Option<NonNull<Superblock>> {
    if self.empty <= retain {
      return None;
    }
    let mut sb = self.tail;
    unsafe {
      while !sb.is_null() {
        if (*sb).used_blocks.load(Ordering::Acquire) == 0 {
          self.unlink(sb);
          self.count -= 1;
          self.empty -= 1;
          return NonNull::new(sb);
        }
        sb = (*sb).prev;
      }
    }
    None
  }

  /// Drops the physical pages of every empty superblock still mapped. Their
  /// blocks are forgotten and carved afresh on the next request.
  pub(crate) unsafe fn purge_empty(&mut self) -> usize {
    let mut purged = 0;
    let mut sb = self.head;
    while !sb.is_null() {
      unsafe {
        if (*sb).used_blocks.load(Ordering::Acquire) == 0 {
          (*sb).carved = 1;
          (*sb).free_blocks = null_mut();
          if Superblock::purge(sb) {
            purged += 1;
          }
        }
        sb = (*sb).next;
      }
    }
    purged
  }

  #[inline]
  pub(crate) fn first(&self) -> *mut Superblock {
    self.head
  }

  #[inline]
  pub(crate) unsafe fn next_of(sb: *mut Superblock) -> *mut Superblock {
    unsafe { (*sb).next }
  }

  /// Superblock with the lowest address above `after`.
  pub(crate) fn next_by_address(&self, after: usize) -> Option<*mut Superblock> {
    let mut best: Option<*mut Superblock> = None;
    let mut sb = self.head;
    while !sb.is_null() {
      if sb as usize > after && best.is_none_or(|b| (sb as usize) < b as usize) {
        best = Some(sb);
      }
      sb = unsafe { (*sb).next };
    }
    best
  }

  unsafe fn push_front(&mut self, sb: *mut Superblock) {
    unsafe {
      (*sb).prev = null_mut();
      (*sb).next = self.head;
      if self.head.is_null() {
        self.tail = sb;
      } else {
        (*self.head).prev = sb;
      }
    }
    self.head = sb;
  }

  unsafe fn push_back(&mut self, sb: *mut Superblock) {
    unsafe {
      (*sb).next = null_mut();
      (*sb).prev = self.tail;
      if self.tail.is_null() {
        self.head = sb;
      } else {
        (*self.tail).next = sb;
      }
    }
    self.tail = sb;
  }

  unsafe fn unlink(&mut self, sb: *mut Superblock) {
    unsafe {
      let (prev, next) = ((*sb).prev, (*sb).next);
      if prev.is_null() {
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if next.is_null() {
        self.tail = prev;
      } else {
        (*next).prev = prev;
      }
      (*sb).prev = null_mut();
      (*sb).next = null_mut();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquire_is_aligned_and_registered() {
    let sb = Superblock::acquire(NUMA_ANY, false).unwrap();
    let base = sb.as_ptr() as usize;
    assert_eq!(base % SUPERBLOCK_ALIGN, 0);
    assert!(owns(base as *const u8));
    assert!(owns((base + SUPERBLOCK_SIZE - 1) as *const u8));
    unsafe {
      assert_eq!((*sb.as_ptr()).numa_node, NUMA_ANY);
      assert_eq!(Superblock::carved(sb.as_ptr()), 1);
      // The whole region is writable.
      ((base + SUPERBLOCK_SIZE - 8) as *mut u64).write(1);
      Superblock::release(sb).unwrap();
    }
    assert!(!owns(base as *const u8));
  }

  #[test]
  fn release_refuses_bad_magic() {
    let sb = Superblock::acquire(NUMA_ANY, false).unwrap();
    unsafe {
      (*sb.as_ptr()).magic = 0x1234;
      assert_eq!(
        Superblock::release(sb),
        Err(HeapError::BadSuperblockMagic {
          addr: sb.as_ptr() as usize,
          found: 0x1234
        })
      );
      assert!(owns(sb.as_ptr() as *const u8));
      (*sb.as_ptr()).magic = SUPERBLOCK_MAGIC;
      Superblock::release(sb).unwrap();
    }
  }

  #[test]
  fn advice_covers_block_area() {
    let sb = Superblock::acquire(NUMA_ANY, false).unwrap();
    unsafe {
      let p = sb.as_ptr();
      assert!(Superblock::prefetch(p));
      assert!(Superblock::sequential(p));
      assert!(Superblock::random(p));
      let block = Superblock::block_at(p, 1) as *mut u64;
      block.write(9);
      assert!(Superblock::purge(p));
      assert_eq!(block.read(), 0);
      // Header survives the purge.
      assert_eq!((*p).magic, SUPERBLOCK_MAGIC);
      Superblock::release(sb).unwrap();
    }
  }

  #[test]
  fn registry_carves_returns_and_evicts() {
    let mut reg = Registry::new();
    unsafe {
      assert!(reg.take_block().is_none());
      let sb = Superblock::acquire(NUMA_ANY, false).unwrap();
      reg.insert(sb);
      assert_eq!((reg.count, reg.empty), (1, 1));

      let mut blocks = Vec::new();
      while let Some(b) = reg.take_block() {
        assert_eq!(b as usize % BLOCK_SIZE, 0);
        assert_eq!((*b).superblock, sb.as_ptr());
        blocks.push(b);
      }
      assert_eq!(blocks.len(), BLOCKS_PER_SUPERBLOCK - 1);
      assert_eq!(blocks[0], Superblock::block_at(sb.as_ptr(), 1));
      assert_eq!(reg.empty, 0);
      assert!(reg.evict_empty(0).is_none());

      let back = blocks.pop().unwrap();
      reg.return_block(back);
      assert_eq!(reg.take_block(), Some(back));

      for b in blocks.drain(..) {
        reg.return_block(b);
      }
      reg.return_block(back);
      assert_eq!(reg.empty, 1);
      assert_eq!((*sb.as_ptr()).used_blocks.load(Ordering::Relaxed), 0);
      assert!(reg.evict_empty(1).is_none());
      let evicted = reg.evict_empty(0).unwrap();
      assert_eq!(evicted, sb);
      assert_eq!(reg.count, 0);
      Superblock::release(evicted).unwrap();
    }
  }

  #[test]
  fn full_superblocks_move_behind_free_ones() {
    let mut reg = Registry::new();
    unsafe {
      let a = Superblock::acquire(NUMA_ANY, false).unwrap();
      reg.insert(a);
      let mut taken = Vec::new();
      while let Some(b) = reg.take_block() {
        taken.push(b);
      }
      let b = Superblock::acquire(NUMA_ANY, false).unwrap();
      reg.insert(b);
      assert_eq!(reg.first(), b.as_ptr());
      assert_eq!(Registry::next_of(b.as_ptr()), a.as_ptr());

      // A block coming back makes `a` the preferred source again.
      reg.return_block(taken[0]);
      assert_eq!(reg.first(), a.as_ptr());
      assert_eq!(reg.take_block(), Some(taken[0]));

      let lo = a.as_ptr().min(b.as_ptr());
      let hi = a.as_ptr().max(b.as_ptr());
      assert_eq!(reg.next_by_address(0), Some(lo));
      assert_eq!(reg.next_by_address(lo as usize), Some(hi));
      assert_eq!(reg.next_by_address(hi as usize), None);

      for blk in taken {
        reg.return_block(blk);
      }
      while let Some(sb) = reg.evict_empty(0) {
        Superblock::release(sb).unwrap();
      }
      assert_eq!(reg.count, 0);
    }
  }

  #[test]
  fn purge_empty_restarts_carving() {
    let mut reg = Registry::new();
    unsafe {
      let sb = Superblock::acquire(NUMA_ANY, false).unwrap();
      reg.insert(sb);
      let a = reg.take_block().unwrap();
      let b = reg.take_block().unwrap();
      (a as *mut u8).add(BLOCK_SIZE - 1).write(9);
      reg.return_block(b);
      reg.return_block(a);
      assert_eq!(Superblock::carved(sb.as_ptr()), 3);

      assert_eq!(reg.purge_empty(), 1);
      assert_eq!(Superblock::carved(sb.as_ptr()), 1);
      // Carving starts over from the first block, which reads back zeroed.
      let again = reg.take_block().unwrap();
      assert_eq!(again, a);
      assert_eq!((a as *mut u8).add(BLOCK_SIZE - 1).read(), 0);

      reg.return_block(again);
      let evicted = reg.evict_empty(0).unwrap();
      Superblock::release(evicted).unwrap();
    }
  }
}
