//! The process-wide heap and the malloc-family entry points.
//!
//! Each thread caches one block per size class. The fast path allocates from
//! that block without locks; exhaustion drains the block's mailbox, then
//! retires it and fetches another from the class pool or the superblock
//! registry.
//!
//! Blocks whose owner detached (retired them, or exited) are shared state.
//! A pool token in the block flags decides who may queue or reclaim such a
//! block, and an in-flight counter keeps superblocks mapped while another
//! thread may still be touching one of their blocks.

use core::{
  cell::{Cell, UnsafeCell},
  mem,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};
use std::sync::OnceLock;

use crate::{
  BLOCK_SIZE, BLOCKS_PER_SUPERBLOCK, HeapError, MIN_ALIGN, SUPERBLOCK_SIZE,
  block::{self, BlockHeader, DETACHED, FLAG_ACTIVE, FLAG_ORPHANED},
  bootstrap,
  chunk::{ChunkHeader, ChunkState},
  config::{self, Config},
  error::report,
  large, platform,
  size_class::{CLASS_COUNT, MAX_SIZE, class_to_size, size_to_class},
  stats::{BlockInfo, COUNTERS, ThreadStats},
  superblock::{self, NUMA_ANY, Registry, Superblock},
  sync::Locked,
};

// =============================================================================
// Init Gate
// =============================================================================

const UNINIT: u8 = 0;
const RUNNING: u8 = 1;
const READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNINIT);
static HEAP: OnceLock<Heap> = OnceLock::new();

/// Threads currently touching a block they do not own.
static REMOTE_INFLIGHT: AtomicUsize = AtomicUsize::new(0);

struct Inflight;

impl Inflight {
  #[inline]
  fn enter() -> Self {
    REMOTE_INFLIGHT.fetch_add(1, Ordering::SeqCst);
    Inflight
  }
}

impl Drop for Inflight {
  #[inline]
  fn drop(&mut self) {
    REMOTE_INFLIGHT.fetch_sub(1, Ordering::SeqCst);
  }
}

// =============================================================================
// Thread Cache
// =============================================================================

struct ThreadCache {
  /// Block currently serving each class, owned by this thread.
  blocks: [*mut BlockHeader; CLASS_COUNT],
  stats: ThreadStats,
}

impl ThreadCache {
  const fn new() -> Self {
    Self {
      blocks: [null_mut(); CLASS_COUNT],
      stats: ThreadStats::ZERO,
    }
  }
}

// No destructors: blocks of an exited thread are found and orphaned lazily.
thread_local! {
  static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's cache. `None` when called from inside another
/// `with_cache` (an allocation made by the allocator itself).
#[inline]
fn with_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
  IN_ALLOC.with(|busy| {
    if busy.replace(true) {
      return None;
    }
    let result = CACHE.with(|cache| f(unsafe { &mut *cache.get() }));
    busy.set(false);
    Some(result)
  })
}

impl ThreadStats {
  #[inline]
  fn record_alloc(&mut self, size: usize) {
    self.malloc_count += 1;
    self.bytes_allocated += size as u64;
  }

  #[inline]
  fn record_free(&mut self, size: usize, remote: bool) {
    self.free_count += 1;
    self.bytes_freed += size as u64;
    self.remote_frees += remote as u64;
  }
}

// =============================================================================
// Class Pools
// =============================================================================

/// Detached blocks of one class with chunks to give. Members hold the pool token.
struct BlockPool {
  head: *mut BlockHeader,
  len: usize,
}

unsafe impl Send for BlockPool {}

impl BlockPool {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  unsafe fn push(&mut self, block: *mut BlockHeader) {
    unsafe { (*block).pool_next = self.head };
    self.head = block;
    self.len += 1;
  }

  unsafe fn pop(&mut self) -> Option<*mut BlockHeader> {
    let block = self.head;
    if block.is_null() {
      return None;
    }
    self.head = unsafe { (*block).pool_next };
    self.len -= 1;
    Some(block)
  }

  fn take_all(&mut self) -> *mut BlockHeader {
    self.len = 0;
    mem::replace(&mut self.head, null_mut())
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Owner liveness probes per reap pass.
const REAP_BUDGET: usize = 32;

pub(crate) struct Heap {
  cookie: u64,
  huge_pages: bool,
  retain_superblocks: usize,
  registry: Locked<Registry>,
  pools: [Locked<BlockPool>; CLASS_COUNT],
  /// Set when an orphaned block became empty.
  sweep_requested: AtomicBool,
  /// Last block address a reap pass visited.
  reap_cursor: AtomicUsize,
}

impl Heap {
  /// The heap, initializing it on first use. `None` while initialization is
  /// running, on this thread or another: callers fall back to the bootstrap heap.
  #[inline]
  pub(crate) fn get() -> Option<&'static Heap> {
    match HEAP.get() {
      Some(heap) => Some(heap),
      None => Self::init(),
    }
  }

  #[cold]
  fn init() -> Option<&'static Heap> {
    if STATE
      .compare_exchange(UNINIT, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return HEAP.get();
    }
    let heap = HEAP.get_or_init(Heap::new);
    STATE.store(READY, Ordering::Release);
    Some(heap)
  }

  fn new() -> Self {
    let config = Config::from_env();
    config::set_abort_on_corruption(config.abort_on_corruption);
    let huge_pages = config.huge_pages.unwrap_or_else(platform::huge_pages_available);
    log::debug!(
      "strata: heap ready (huge pages: {huge_pages}, numa nodes: {}, retained superblocks: {})",
      platform::numa_node_count(),
      config.retain_superblocks
    );

    Self {
      cookie: platform::entropy(),
      huge_pages,
      retain_superblocks: config.retain_superblocks,
      registry: Locked::new(Registry::new()),
      pools: [const { Locked::new(BlockPool::new()) }; CLASS_COUNT],
      sweep_requested: AtomicBool::new(false),
      reap_cursor: AtomicUsize::new(0),
    }
  }

  fn malloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
    let Some(class) = size_to_class(size) else {
      return self.alloc_large(size, MIN_ALIGN);
    };
    with_cache(|cache| self.alloc_small(cache, class, size)).unwrap_or_else(|| self.alloc_large(size, MIN_ALIGN))
  }

  fn alloc_small(&self, cache: &mut ThreadCache, class: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
    let cached = cache.blocks[class];
    if !cached.is_null() {
      if let Some(ptr) = unsafe { self.alloc_from(cached, size)? } {
        cache.stats.cache_hits += 1;
        Self::note_small_alloc(cache, class, size);
        return Ok(ptr);
      }
      cache.blocks[class] = null_mut();
      unsafe { self.retire(cached) };
    }

    cache.stats.cache_misses += 1;
    let tid = platform::thread_id();
    loop {
      let block = self.alloc_block(class, tid)?;
      if let Some(ptr) = unsafe { block::block_alloc(block, size, self.cookie)? } {
        cache.blocks[class] = block;
        Self::note_small_alloc(cache, class, size);
        return Ok(ptr);
      }
      // An adopted block whose chunks were all claimed again before we drained it.
      unsafe { self.retire(block) };
    }
  }

  /// Allocates from an owned block, draining its mailbox once if it ran dry.
  #[inline]
  unsafe fn alloc_from(&self, block: *mut BlockHeader, size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
    unsafe {
      if let Some(ptr) = block::block_alloc(block, size, self.cookie)? {
        return Ok(Some(ptr));
      }
      if block::drain_remote(block)? == 0 {
        return Ok(None);
      }
      block::block_alloc(block, size, self.cookie)
    }
  }

  #[inline]
  fn note_small_alloc(cache: &mut ThreadCache, class: usize, size: usize) {
    cache.stats.record_alloc(size);
    COUNTERS.on_alloc(size, class_to_size(class));
  }

  fn alloc_large(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
    let (ptr, map_len) = large::alloc(size, align, self.cookie)?;
    COUNTERS.on_alloc(size, map_len);
    with_cache(|cache| cache.stats.record_alloc(size));
    Ok(ptr)
  }

  fn memalign(&self, align: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
    if align <= MIN_ALIGN {
      self.malloc(size)
    } else {
      self.alloc_large(size, align)
    }
  }

  /// Hands thread `tid` a block for `class`: a pooled block with free chunks
  /// first, then a block carved from the registry. Carving is preceded by a
  /// reap pass over blocks of exited threads.
  pub(crate) fn alloc_block(&self, class: usize, tid: u64) -> Result<*mut BlockHeader, HeapError> {
    if self.sweep_requested.swap(false, Ordering::AcqRel) {
      self.sweep(false);
      self.release_empty(self.retain_superblocks);
    }

    while let Some(block) = self.pools[class].with(|pool| unsafe { pool.pop() }) {
      unsafe {
        let claimed = (*block)
          .owner
          .compare_exchange(DETACHED, tid, Ordering::SeqCst, Ordering::Relaxed)
          .is_ok();
        (*block).release_token();
        if !claimed {
          continue;
        }
        if (*block).used.load(Ordering::SeqCst) == 0 {
          block::init(block, class, tid, self.cookie);
        } else if let Err(err) = block::drain_remote(block) {
          // Stays claimed by `tid` and never circulates again.
          report(err);
          continue;
        }
      }
      log::trace!("strata: thread {tid} adopted block {block:p} for class {class}");
      return Ok(block);
    }

    let reaped = self.reap(tid);
    if reaped > 0 {
      log::trace!("strata: reclaimed {reaped} blocks of exited threads");
    }
    let block = match self.registry.with(|reg| unsafe { reg.take_block() }) {
      Some(block) => block,
      None => {
        let sb = Superblock::acquire(NUMA_ANY, self.huge_pages)?;
        self
          .registry
          .with(|reg| unsafe {
            reg.insert(sb);
            reg.take_block()
          })
          .ok_or(HeapError::OutOfMemory(SUPERBLOCK_SIZE))?
      }
    };
    unsafe { block::init(block, class, tid, self.cookie) };
    log::trace!("strata: thread {tid} carved block {block:p} for class {class}");
    Ok(block)
  }

  /// Gives an empty, unowned block back to its superblock. The caller holds
  /// the block's pool token.
  pub(crate) unsafe fn free_block(&self, block: *mut BlockHeader) {
    self.registry.with(|reg| unsafe { reg.return_block(block) });
  }

  /// Detaches an owned block. The block stays wherever its chunks are.
  unsafe fn retire(&self, block: *mut BlockHeader) {
    let _inflight = Inflight::enter();
    unsafe {
      let max = (*block).max_count;
      (*block).owner.store(DETACHED, Ordering::SeqCst);
      let used = (*block).used.load(Ordering::SeqCst);
      let pending = !(*block).remote_free.load(Ordering::SeqCst).is_null();
      if pending || used < max {
        self.pool_push(block);
      }
    }
  }

  /// Queues a detached block on its class pool, unless it is already queued,
  /// was claimed meanwhile, or is orphaned.
  unsafe fn pool_push(&self, block: *mut BlockHeader) {
    unsafe {
      if !(*block).take_token() {
        return;
      }
      let flags = (*block).flags.load(Ordering::SeqCst);
      if (*block).owner.load(Ordering::SeqCst) != DETACHED || flags & FLAG_ORPHANED != 0 || flags & FLAG_ACTIVE == 0 {
        (*block).release_token();
        return;
      }
      let class = (*block).class_index();
      self.pools[class].with(|pool| pool.push(block));
    }
  }

  /// Detaches a block from an exited owner. It is reclaimed by a sweep once empty.
  unsafe fn orphan(&self, block: *mut BlockHeader, owner: u64) {
    unsafe {
      (*block).flags.fetch_or(FLAG_ORPHANED, Ordering::SeqCst);
      if (*block)
        .owner
        .compare_exchange(owner, DETACHED, Ordering::SeqCst, Ordering::Relaxed)
        .is_ok()
      {
        self.sweep_requested.store(true, Ordering::Release);
        log::debug!("strata: block {block:p} orphaned by exited thread {owner}");
      }
    }
  }

  unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
    if !superblock::owns(ptr) {
      let large = unsafe { large::free(ptr, self.cookie)? };
      COUNTERS.on_free(large.size, large.map_len);
      with_cache(|cache| cache.stats.record_free(large.size, false));
      return Ok(());
    }

    let block = BlockHeader::containing(ptr);
    unsafe {
      let hdr = block::validate(block, ptr, self.cookie)?;
      let (size, class) = (hdr.size(), hdr.class());
      let remote = (*block).owner.load(Ordering::Acquire) != platform::thread_id();
      if remote {
        self.free_remote(block, ptr, hdr)?;
      } else {
        block::block_free(block, ptr, hdr)?;
      }
      COUNTERS.on_free(size, class_to_size(class));
      with_cache(|cache| cache.stats.record_free(size, remote));
    }
    Ok(())
  }

  unsafe fn free_remote(&self, block: *mut BlockHeader, ptr: *mut u8, hdr: &ChunkHeader) -> Result<(), HeapError> {
    let _inflight = Inflight::enter();
    unsafe {
      block::push_remote(block, ptr, hdr)?;
      let prev = (*block).used.fetch_sub(1, Ordering::SeqCst);
      let owner = (*block).owner.load(Ordering::SeqCst);
      if owner == DETACHED {
        if !(*block).has_flag(FLAG_ORPHANED) {
          self.pool_push(block);
        } else if prev == 1 {
          self.sweep_requested.store(true, Ordering::Release);
        }
      } else if prev == 1 && !platform::thread_alive(owner) {
        self.orphan(block, owner);
      }
    }
    Ok(())
  }

  unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, HeapError> {
    if bootstrap::is_bootstrap_pointer(ptr) {
      let old = unsafe { bootstrap::size_of(ptr) };
      let new = self.malloc(new_size)?;
      unsafe { ptr::copy_nonoverlapping(ptr, new.as_ptr(), old.min(new_size)) };
      return Ok(new);
    }

    if superblock::owns(ptr) {
      let block = BlockHeader::containing(ptr);
      let hdr = unsafe { block::validate(block, ptr, self.cookie)? };
      if hdr.state() != ChunkState::Allocated {
        return Err(HeapError::DoubleFree(ptr as usize));
      }
      let (class, old) = (hdr.class(), hdr.size());
      if size_to_class(new_size) == Some(class) {
        unsafe { ChunkHeader::resize(ChunkHeader::of(ptr), ptr, new_size, self.cookie) };
        COUNTERS.on_free(old, class_to_size(class));
        COUNTERS.on_alloc(new_size, class_to_size(class));
        return Ok(unsafe { NonNull::new_unchecked(ptr) });
      }
      return unsafe { self.move_to(ptr, class_to_size(class), new_size) };
    }

    let old = unsafe { large::lookup(ptr, self.cookie)? };
    if new_size > MAX_SIZE {
      match unsafe { large::resize(ptr, new_size, self.cookie) } {
        Ok(new) => {
          let now = unsafe { large::lookup(new.as_ptr(), self.cookie)? };
          COUNTERS.on_free(old.size, old.map_len);
          COUNTERS.on_alloc(new_size, now.map_len);
          return Ok(new);
        }
        Err(HeapError::OutOfMemory(_)) => {}
        Err(err) => return Err(err),
      }
    }
    unsafe { self.move_to(ptr, old.usable, new_size) }
  }

  /// Reallocates by copy. `old_usable` bytes of `ptr` are readable.
  unsafe fn move_to(&self, ptr: *mut u8, old_usable: usize, new_size: usize) -> Result<NonNull<u8>, HeapError> {
    let new = self.malloc(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr, new.as_ptr(), old_usable.min(new_size));
      if let Err(err) = self.free(ptr) {
        report(err);
      }
    }
    Ok(new)
  }

  unsafe fn usable_size(&self, ptr: *mut u8) -> Result<usize, HeapError> {
    if superblock::owns(ptr) {
      let hdr = unsafe { block::validate(BlockHeader::containing(ptr), ptr, self.cookie)? };
      return Ok(class_to_size(hdr.class()));
    }
    Ok(unsafe { large::lookup(ptr, self.cookie)? }.usable)
  }

  // ===========================================================================
  // Reclamation
  // ===========================================================================

  /// Returns empty detached blocks to their superblocks. A deep sweep also
  /// probes the owners of owned blocks and orphans those that exited.
  fn sweep(&self, deep: bool) -> usize {
    let tid = platform::thread_id();
    self.registry.with(|reg| {
      let mut reclaimed = 0;
      let mut sb = reg.first();
      while !sb.is_null() {
        unsafe {
          let next = Registry::next_of(sb);
          for index in 1..Superblock::carved(sb) {
            let block = Superblock::block_at(sb, index);
            if self.try_reclaim(reg, block, deep, tid) {
              reclaimed += 1;
            }
          }
          sb = next;
        }
      }
      reclaimed
    })
  }

  unsafe fn try_reclaim(&self, reg: &mut Registry, block: *mut BlockHeader, deep: bool, tid: u64) -> bool {
    unsafe {
      if !(*block).has_flag(FLAG_ACTIVE) {
        return false;
      }
      let mut owner = (*block).owner.load(Ordering::SeqCst);
      if deep && owner != DETACHED && owner != tid && !platform::thread_alive(owner) {
        self.orphan(block, owner);
        owner = (*block).owner.load(Ordering::SeqCst);
      }
      if owner != DETACHED || (*block).used.load(Ordering::SeqCst) != 0 || !(*block).take_token() {
        return false;
      }
      reg.return_block(block);
      true
    }
  }

  /// Probes the owners of up to [`REAP_BUDGET`] blocks owned by other threads,
  /// in address order from where the last pass stopped. Blocks of exited
  /// owners are orphaned; the empty ones go back to their superblock.
  fn reap(&self, tid: u64) -> usize {
    let start = self.reap_cursor.load(Ordering::Relaxed);
    self.registry.with(|reg| {
      let (mut after, mut wrapped) = (start, false);
      let (mut probes, mut reclaimed) = (0, 0);
      'scan: while probes < REAP_BUDGET {
        // `after` is the last block visited, or the end of the last superblock.
        let Some(sb) = reg.next_by_address(after.saturating_sub(SUPERBLOCK_SIZE)) else {
          if wrapped {
            break;
          }
          (after, wrapped) = (0, true);
          continue;
        };
        let first = if (sb as usize) < after {
          (after - sb as usize) / BLOCK_SIZE + 1
        } else {
          1
        };
        unsafe {
          for index in first..Superblock::carved(sb) {
            let block = Superblock::block_at(sb, index);
            if wrapped && block as usize > start {
              break 'scan;
            }
            after = block as usize;
            let owner = (*block).owner.load(Ordering::SeqCst);
            if !(*block).has_flag(FLAG_ACTIVE) || owner == DETACHED || owner == tid {
              continue;
            }
            probes += 1;
            if self.try_reclaim(reg, block, true, tid) {
              reclaimed += 1;
            }
            if probes == REAP_BUDGET {
              break 'scan;
            }
          }
        }
        after = sb as usize + SUPERBLOCK_SIZE;
      }
      self.reap_cursor.store(after, Ordering::Relaxed);
      reclaimed
    })
  }

  /// Unmaps empty superblocks beyond `retain`. Skipped while any thread is
  /// inside a foreign block.
  fn release_empty(&self, retain: usize) -> usize {
    let mut released = 0;
    loop {
      let victim = self.registry.with(|reg| {
        if REMOTE_INFLIGHT.load(Ordering::SeqCst) != 0 {
          return None;
        }
        unsafe { reg.evict_empty(retain) }
      });
      let Some(sb) = victim else {
        break;
      };
      match unsafe { Superblock::release(sb) } {
        Ok(()) => released += 1,
        Err(err) => report(err),
      }
    }
    released
  }

  fn purge(&self) {
    let mut reclaimed = 0;
    for pool in &self.pools {
      let mut block = pool.with(|pool| pool.take_all());
      while !block.is_null() {
        unsafe {
          let next = (*block).pool_next;
          if (*block).used.load(Ordering::SeqCst) == 0 {
            self.free_block(block);
            reclaimed += 1;
          } else {
            pool.with(|pool| pool.push(block));
          }
          block = next;
        }
      }
    }
    reclaimed += self.sweep(true);
    let released = self.release_empty(self.retain_superblocks);
    let (advised, remaining) = self.registry.with(|reg| (unsafe { reg.purge_empty() }, reg.count));
    log::debug!(
      "strata: purge reclaimed {reclaimed} blocks, unmapped {released} superblocks, advised {advised}, {remaining} remain"
    );
  }

  /// Applies a page hint to every registered superblock. Returns how many
  /// the kernel accepted.
  fn advise(&self, hint: unsafe fn(*mut Superblock) -> bool) -> usize {
    self.registry.with(|reg| {
      let mut accepted = 0;
      let mut sb = reg.first();
      while !sb.is_null() {
        unsafe {
          accepted += hint(sb) as usize;
          sb = Registry::next_of(sb);
        }
      }
      accepted
    })
  }

  fn walk(&self, mut visit: impl FnMut(&BlockInfo)) {
    let mut after = 0;
    loop {
      let mut batch = [BlockInfo::EMPTY; BLOCKS_PER_SUPERBLOCK];
      let mut len = 0;
      // Copy under the lock, visit outside it: the visitor may allocate.
      let next = self.registry.with(|reg| {
        let sb = reg.next_by_address(after)?;
        unsafe {
          for index in 1..Superblock::carved(sb) {
            if let Some(info) = block::info(Superblock::block_at(sb, index)) {
              batch[len] = info;
              len += 1;
            }
          }
        }
        Some(sb as usize)
      });
      let Some(addr) = next else {
        break;
      };
      after = addr;
      for info in &batch[..len] {
        visit(info);
      }
    }
  }
}

// =============================================================================
// Public API
// =============================================================================

#[inline]
fn into_ptr(result: Result<NonNull<u8>, HeapError>) -> *mut u8 {
  match result {
    Ok(ptr) => ptr.as_ptr(),
    Err(err) => {
      report(err);
      null_mut()
    }
  }
}

/// Allocates `size` bytes aligned to 16. `malloc(0)` returns a unique
/// minimum-size allocation. Returns null on failure.
pub unsafe fn malloc(size: usize) -> *mut u8 {
  into_ptr(match Heap::get() {
    Some(heap) => heap.malloc(size),
    None => bootstrap::alloc(size),
  })
}

/// Frees `ptr`. Null and bootstrap pointers are ignored; pointers this heap
/// did not hand out are reported and left alone.
pub unsafe fn free(ptr: *mut u8) {
  if ptr.is_null() || bootstrap::is_bootstrap_pointer(ptr) {
    return;
  }
  let result = match Heap::get() {
    Some(heap) => unsafe { heap.free(ptr) },
    None => Err(HeapError::ForeignPointer(ptr as usize)),
  };
  if let Err(err) = result {
    report(err);
  }
}

/// Allocates zeroed memory for `count` elements of `size` bytes.
pub unsafe fn calloc(count: usize, size: usize) -> *mut u8 {
  let Some(total) = count.checked_mul(size) else {
    report(HeapError::SizeOverflow);
    return null_mut();
  };
  let ptr = unsafe { malloc(total) };
  // Fresh mappings and the bootstrap buffer are already zero.
  if !ptr.is_null() && superblock::owns(ptr) {
    unsafe { ptr::write_bytes(ptr, 0, total) };
  }
  ptr
}

/// Resizes `ptr` to `size` bytes, moving it if needed. `realloc(null, n)`
/// allocates; `realloc(p, 0)` frees and returns null.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return unsafe { malloc(size) };
  }
  if size == 0 {
    unsafe { free(ptr) };
    return null_mut();
  }
  into_ptr(match Heap::get() {
    Some(heap) => unsafe { heap.realloc(ptr, size) },
    None => migrate_bootstrap(ptr, size),
  })
}

/// Realloc while the heap is still initializing: only bootstrap pointers exist.
fn migrate_bootstrap(ptr: *mut u8, size: usize) -> Result<NonNull<u8>, HeapError> {
  if !bootstrap::is_bootstrap_pointer(ptr) {
    return Err(HeapError::ForeignPointer(ptr as usize));
  }
  let new = bootstrap::alloc(size)?;
  unsafe {
    let old = bootstrap::size_of(ptr);
    ptr::copy_nonoverlapping(ptr, new.as_ptr(), old.min(size));
  }
  Ok(new)
}

/// Allocates `size` bytes aligned to `align`, a power of two.
pub unsafe fn memalign(align: usize, size: usize) -> *mut u8 {
  if !align.is_power_of_two() {
    report(HeapError::InvalidAlignment(align));
    return null_mut();
  }
  into_ptr(match Heap::get() {
    Some(heap) => heap.memalign(align, size),
    None if align <= MIN_ALIGN => bootstrap::alloc(size),
    None => Err(HeapError::InvalidAlignment(align)),
  })
}

/// C11 `aligned_alloc`: same as [`memalign`].
pub unsafe fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
  unsafe { memalign(align, size) }
}

/// POSIX `posix_memalign`. `align` must be a power of two multiple of the
/// pointer size. Returns 0, `EINVAL` or `ENOMEM`; `*out` is only written on success.
pub unsafe fn posix_memalign(out: *mut *mut u8, align: usize, size: usize) -> i32 {
  if !align.is_power_of_two() || align % size_of::<*mut u8>() != 0 {
    return HeapError::InvalidAlignment(align).errno();
  }
  let ptr = unsafe { memalign(align, size) };
  if ptr.is_null() {
    return libc::ENOMEM;
  }
  unsafe { *out = ptr };
  0
}

/// Bytes usable at `ptr`, at least the size requested. 0 for null or foreign pointers.
pub unsafe fn malloc_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  if bootstrap::is_bootstrap_pointer(ptr) {
    return unsafe { bootstrap::size_of(ptr) };
  }
  let Some(heap) = HEAP.get() else {
    return 0;
  };
  match unsafe { heap.usable_size(ptr) } {
    Ok(size) => size,
    Err(err) => {
      report(err);
      0
    }
  }
}

/// Counters of the calling thread.
pub fn thread_stats() -> ThreadStats {
  with_cache(|cache| cache.stats).unwrap_or_default()
}

/// Calls `visit` once for every block currently dedicated to a size class.
/// Blocks are reported by ascending address; concurrent activity may be missed.
pub fn heap_walk(visit: impl FnMut(&BlockInfo)) {
  if let Some(heap) = HEAP.get() {
    heap.walk(visit);
  }
}

/// Returns unused blocks and superblocks to the OS.
pub(crate) fn purge() {
  if let Some(heap) = HEAP.get() {
    // Logging under the registry lock must not re-enter the small path.
    with_cache(|_| heap.purge());
  }
}

/// Applies `hint` to all superblocks. 0 before the heap exists.
pub(crate) fn advise(hint: unsafe fn(*mut Superblock) -> bool) -> usize {
  HEAP.get().map_or(0, |heap| heap.advise(hint))
}

/// Detaches the calling thread's cached blocks and zeroes its counters.
pub(crate) fn reset_thread() {
  let Some(heap) = HEAP.get() else {
    return;
  };
  with_cache(|cache| {
    for slot in cache.blocks.iter_mut() {
      let block = mem::replace(slot, null_mut());
      if !block.is_null() {
        unsafe { heap.retire(block) };
      }
    }
    cache.stats = ThreadStats::ZERO;
  });
}

/// Runs the init gate without allocating.
#[cfg_attr(not(any(test, feature = "c_api")), allow(dead_code))]
pub(crate) fn init() {
  let _ = Heap::get();
}

#[cfg(test)]
mod tests {
  use super::*;

  // Each test uses its own size class: tests run in parallel on one heap.

  #[test]
  fn init_gate_reaches_ready() {
    init();
    assert_eq!(STATE.load(Ordering::Acquire), READY);
    assert!(HEAP.get().is_some());
  }

  #[test]
  fn alloc_block_hands_out_owned_blocks() {
    init();
    let heap = HEAP.get().unwrap();
    let class = size_to_class(1800).unwrap();
    let tid = platform::thread_id();
    unsafe {
      let block = heap.alloc_block(class, tid).unwrap();
      assert_eq!((*block).owner.load(Ordering::Relaxed), tid);
      assert_eq!((*block).class_index(), class);
      assert_eq!((*block).free_count as usize, crate::size_class::class_to_count(class));
      assert_eq!((*block).used.load(Ordering::Relaxed), 0);
      assert!(block::info(block).is_some());

      (*block).owner.store(DETACHED, Ordering::SeqCst);
      assert!((*block).take_token());
      heap.free_block(block);
    }
  }

  #[test]
  fn same_thread_reuse_is_lifo() {
    unsafe {
      let a = malloc(900);
      let b = malloc(900);
      assert!(!a.is_null() && !b.is_null());
      assert_eq!(a as usize % MIN_ALIGN, 0);
      free(b);
      free(a);
      assert_eq!(malloc(900), a);
      assert_eq!(malloc(900), b);
      free(a);
      free(b);
    }
  }

  #[test]
  fn reentrant_requests_use_large_path() {
    init();
    let inner = with_cache(|_| unsafe {
      let p = malloc(24);
      assert!(!p.is_null());
      assert!(!superblock::owns(p));
      p as usize
    })
    .unwrap();
    unsafe { free(inner as *mut u8) };
  }

  #[test]
  fn remote_frees_wait_in_mailbox() {
    unsafe {
      let ptrs: Vec<usize> = (0..8).map(|_| malloc(1500) as usize).collect();
      let block = BlockHeader::containing(ptrs[0] as *const u8);
      assert!(ptrs.iter().all(|&p| BlockHeader::containing(p as *const u8) == block));
      let used_before = (*block).used.load(Ordering::Relaxed);

      let freed = ptrs.clone();
      std::thread::spawn(move || {
        for p in freed {
          free(p as *mut u8);
        }
        assert_eq!(thread_stats().remote_frees, 8);
      })
      .join()
      .unwrap();

      // Invisible to the owner until it drains.
      assert!(!(*block).remote_free.load(Ordering::Relaxed).is_null());
      assert!((*block).local_free.is_null());
      assert_eq!((*block).used.load(Ordering::Relaxed), used_before - 8);
      assert_eq!(block::drain_remote(block), Ok(8));
      for _ in 0..8 {
        let p = malloc(1500) as usize;
        assert!(ptrs.contains(&p));
      }
      for p in ptrs {
        free(p as *mut u8);
      }
    }
  }

  #[test]
  fn double_free_is_refused() {
    unsafe {
      let p = malloc(2800);
      free(p);
      let heap = HEAP.get().unwrap();
      assert_eq!(heap.free(p), Err(HeapError::DoubleFree(p as usize)));
      // The chunk is still handed out exactly once.
      let q = malloc(2800);
      assert_eq!(q, p);
      let r = malloc(2800);
      assert_ne!(r, q);
      free(q);
      free(r);
    }
  }

  #[test]
  fn foreign_pointers_are_refused() {
    init();
    let heap = HEAP.get().unwrap();
    let mut local = [0u64; 8];
    let p = unsafe { (local.as_mut_ptr() as *mut u8).add(32) };
    assert_eq!(unsafe { heap.free(p) }, Err(HeapError::ForeignPointer(p as usize)));
    unsafe { free(p) };
    assert_eq!(unsafe { malloc_usable_size(p) }, 0);
  }

  #[test]
  fn realloc_in_place_within_class() {
    unsafe {
      let p = malloc(3000);
      p.write_bytes(0xab, 3000);
      let q = realloc(p, 3070);
      assert_eq!(q, p);
      assert_eq!(malloc_usable_size(q), 3072);
      let r = realloc(q, 5000);
      assert_ne!(r, q);
      assert_eq!(r.add(2999).read(), 0xab);
      assert_eq!(malloc_usable_size(r), 5120);
      free(r);
    }
  }

  #[test]
  fn realloc_of_freed_chunk_is_refused() {
    unsafe {
      let p = malloc(3300);
      free(p);
      let heap = HEAP.get().unwrap();
      assert_eq!(heap.realloc(p, 3310), Err(HeapError::DoubleFree(p as usize)));
      assert_eq!(malloc(3300), p);
      free(p);
    }
  }

  #[test]
  fn realloc_large_and_back() {
    unsafe {
      let p = malloc(40_000);
      assert!(!superblock::owns(p));
      p.write_bytes(7, 40_000);
      let q = realloc(p, 3 << 20);
      assert_eq!(q.add(39_999).read(), 7);
      assert!(malloc_usable_size(q) >= 3 << 20);
      let r = realloc(q, 100);
      assert!(superblock::owns(r));
      assert_eq!(r.add(99).read(), 7);
      assert!(realloc(r, 0).is_null());

      let z = realloc(null_mut(), 0);
      assert!(!z.is_null());
      assert_eq!(malloc_usable_size(z), 16);
      free(z);
    }
  }

  #[test]
  fn calloc_zeroes_reused_chunks() {
    unsafe {
      let p = malloc(6000);
      p.write_bytes(0xff, 6000);
      free(p);
      let q = calloc(3, 2000);
      assert_eq!(q, p);
      assert!((0..6000).all(|i| q.add(i).read() == 0));
      free(q);
      assert!(calloc(usize::MAX, 2).is_null());
    }
  }

  #[test]
  fn aligned_requests() {
    unsafe {
      for align in [8, 16, 32, 4096] {
        let p = memalign(align, 100);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        free(p);
      }
      assert!(memalign(24, 10).is_null());

      let mut out = null_mut();
      assert_eq!(posix_memalign(&mut out, 256, 1000), 0);
      assert_eq!(out as usize % 256, 0);
      free(out);
      assert_eq!(posix_memalign(&mut out, 12, 8), libc::EINVAL);
      assert_eq!(posix_memalign(&mut out, 4, 8), libc::EINVAL);

      let p = aligned_alloc(64, 64);
      assert_eq!(p as usize % 64, 0);
      free(p);
    }
  }

  #[test]
  fn bootstrap_pointers_migrate() {
    init();
    let p = bootstrap::bootstrap_malloc(40);
    unsafe {
      p.write_bytes(3, 40);
      assert_eq!(malloc_usable_size(p), 40);
      free(p);
      let q = realloc(p, 10_000);
      assert!(superblock::owns(q));
      assert!((0..40).all(|i| q.add(i).read() == 3));
      free(q);
    }
  }

  #[test]
  fn retired_block_is_pooled_and_adopted() {
    let class = size_to_class(7000).unwrap();
    unsafe {
      let max = crate::size_class::class_to_count(class);
      let ptrs: Vec<usize> = (0..max).map(|_| malloc(7000) as usize).collect();
      let block = BlockHeader::containing(ptrs[0] as *const u8);
      // Exhausted: the next request retires `block` and takes a new one.
      let extra = malloc(7000);
      assert_ne!(BlockHeader::containing(extra), block);
      assert_eq!((*block).owner.load(Ordering::Relaxed), DETACHED);

      // A free from another thread queues the detached block for reuse.
      let p = ptrs[0];
      std::thread::spawn(move || free(p as *mut u8)).join().unwrap();
      assert!((*block).has_flag(crate::block::FLAG_POOLED));

      for &p in &ptrs[1..] {
        free(p as *mut u8);
      }
      free(extra);
    }
  }

  #[test]
  fn corrupt_mailbox_keeps_pooled_block_out_of_circulation() {
    init();
    let heap = HEAP.get().unwrap();
    let class = size_to_class(11_000).unwrap();
    let tid = platform::thread_id();
    unsafe {
      let bad = heap.alloc_block(class, tid).unwrap();
      let a = block::block_alloc(bad, 11_000, heap.cookie).unwrap().unwrap().as_ptr();
      let _b = block::block_alloc(bad, 11_000, heap.cookie).unwrap().unwrap();
      let hdr = block::validate(bad, a, heap.cookie).unwrap();
      block::push_remote(bad, a, hdr).unwrap();
      (*bad).used.fetch_sub(1, Ordering::SeqCst);
      // Use-after-free write over the mailbox link.
      a.cast::<usize>().write(0x4141_4141_4141);
      (*bad).owner.store(DETACHED, Ordering::SeqCst);
      heap.pool_push(bad);
      assert!((*bad).has_flag(crate::block::FLAG_POOLED));

      let good = heap.alloc_block(class, tid).unwrap();
      assert_ne!(good, bad);
      assert_eq!((*good).used.load(Ordering::SeqCst), 0);
      // Claimed while being drained, then dropped.
      assert_eq!((*bad).owner.load(Ordering::SeqCst), tid);
      assert!(!(*bad).has_flag(crate::block::FLAG_POOLED));

      (*good).owner.store(DETACHED, Ordering::SeqCst);
      assert!((*good).take_token());
      heap.free_block(good);
    }
  }

  #[test]
  fn reap_returns_empty_blocks_of_exited_threads() {
    init();
    let heap = HEAP.get().unwrap();
    let class = size_to_class(13_000).unwrap();
    let (addr, exited) = std::thread::spawn(|| unsafe {
      let p = malloc(13_000);
      free(p);
      (BlockHeader::containing(p) as usize, platform::thread_id())
    })
    .join()
    .unwrap();

    let block = addr as *mut BlockHeader;
    let held = || unsafe { block::info(block).is_some_and(|info| info.size_class == class && info.owner == exited) };
    let tid = platform::thread_id();
    for _ in 0..64 {
      if !held() {
        break;
      }
      heap.reap(tid);
    }
    assert!(!held());
  }
}
