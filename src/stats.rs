//! Counters, the `ctl` control interface and the types reported by heap walks.

use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crate::{BLOCK_SIZE, SUPERBLOCK_SIZE, bootstrap, config, heap, superblock::Superblock};

/// Per-thread counters. Exclude requests served while the thread was already
/// inside the allocator.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
  pub malloc_count: u64,
  pub free_count: u64,
  pub bytes_allocated: u64,
  pub bytes_freed: u64,
  /// Frees of chunks owned by another thread.
  pub remote_frees: u64,
  /// Small allocations served by the thread's cached block.
  pub cache_hits: u64,
  /// Small allocations that had to fetch a new block.
  pub cache_misses: u64,
}

impl ThreadStats {
  pub(crate) const ZERO: Self = Self {
    malloc_count: 0,
    free_count: 0,
    bytes_allocated: 0,
    bytes_freed: 0,
    remote_frees: 0,
    cache_hits: 0,
    cache_misses: 0,
  };
}

/// Process-wide counters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalStats {
  pub superblocks_allocated: u64,
  pub superblocks_active: u64,
  pub blocks_allocated: u64,
  pub blocks_active: u64,
  pub total_allocated_bytes: u64,
  pub total_freed_bytes: u64,
  pub peak_allocated_bytes: u64,
  /// Share of reserved chunk and mapping bytes not covered by requests.
  pub fragmentation_percent: u64,
  pub live_allocations: u64,
  /// Bytes currently mapped for superblocks and large allocations.
  pub mapped_bytes: u64,
}

/// One active block, as seen by [`heap_walk`](crate::heap_walk).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockInfo {
  pub addr: usize,
  pub block_size: usize,
  pub size_class: usize,
  pub class_size: usize,
  pub used_chunks: usize,
  pub total_chunks: usize,
  /// Owning thread id, 0 when detached.
  pub owner: u64,
  pub orphaned: bool,
  pub pooled: bool,
  /// NUMA hint of the enclosing superblock, -1 for none.
  pub numa_node: i32,
}

impl BlockInfo {
  pub(crate) const EMPTY: Self = Self {
    addr: 0,
    block_size: 0,
    size_class: 0,
    class_size: 0,
    used_chunks: 0,
    total_chunks: 0,
    owner: 0,
    orphaned: false,
    pooled: false,
    numa_node: -1,
  };
}

// =============================================================================
// Global Counters
// =============================================================================

pub(crate) struct Counters {
  superblocks_allocated: AtomicU64,
  superblocks_active: AtomicU64,
  blocks_allocated: AtomicU64,
  blocks_active: AtomicU64,
  allocated_bytes: AtomicU64,
  freed_bytes: AtomicU64,
  peak_bytes: AtomicU64,
  live_allocations: AtomicU64,
  /// Chunk or mapping bytes backing live allocations.
  reserved_bytes: AtomicU64,
  large_mapped: AtomicU64,
}

pub(crate) static COUNTERS: Counters = Counters::new();

impl Counters {
  const fn new() -> Self {
    Self {
      superblocks_allocated: AtomicU64::new(0),
      superblocks_active: AtomicU64::new(0),
      blocks_allocated: AtomicU64::new(0),
      blocks_active: AtomicU64::new(0),
      allocated_bytes: AtomicU64::new(0),
      freed_bytes: AtomicU64::new(0),
      peak_bytes: AtomicU64::new(0),
      live_allocations: AtomicU64::new(0),
      reserved_bytes: AtomicU64::new(0),
      large_mapped: AtomicU64::new(0),
    }
  }

  #[inline]
  pub(crate) fn on_alloc(&self, requested: usize, reserved: usize) {
    let total = self.allocated_bytes.fetch_add(requested as u64, Relaxed) + requested as u64;
    let live = total.saturating_sub(self.freed_bytes.load(Relaxed));
    self.peak_bytes.fetch_max(live, Relaxed);
    self.live_allocations.fetch_add(1, Relaxed);
    self.reserved_bytes.fetch_add(reserved as u64, Relaxed);
  }

  #[inline]
  pub(crate) fn on_free(&self, requested: usize, reserved: usize) {
    self.freed_bytes.fetch_add(requested as u64, Relaxed);
    self.live_allocations.fetch_sub(1, Relaxed);
    self.reserved_bytes.fetch_sub(reserved as u64, Relaxed);
  }

  pub(crate) fn superblock_mapped(&self) {
    self.superblocks_allocated.fetch_add(1, Relaxed);
    self.superblocks_active.fetch_add(1, Relaxed);
  }

  pub(crate) fn superblock_unmapped(&self) {
    self.superblocks_active.fetch_sub(1, Relaxed);
  }

  pub(crate) fn block_carved(&self) {
    self.blocks_allocated.fetch_add(1, Relaxed);
    self.blocks_active.fetch_add(1, Relaxed);
  }

  pub(crate) fn block_returned(&self) {
    self.blocks_active.fetch_sub(1, Relaxed);
  }

  pub(crate) fn large_mapped(&self, len: usize) {
    self.large_mapped.fetch_add(len as u64, Relaxed);
  }

  pub(crate) fn large_unmapped(&self, len: usize) {
    self.large_mapped.fetch_sub(len as u64, Relaxed);
  }

  pub(crate) fn snapshot(&self) -> GlobalStats {
    let allocated = self.allocated_bytes.load(Relaxed);
    let freed = self.freed_bytes.load(Relaxed);
    let live = allocated.saturating_sub(freed);
    let reserved = self.reserved_bytes.load(Relaxed);
    let superblocks_active = self.superblocks_active.load(Relaxed);
    GlobalStats {
      superblocks_allocated: self.superblocks_allocated.load(Relaxed),
      superblocks_active,
      blocks_allocated: self.blocks_allocated.load(Relaxed),
      blocks_active: self.blocks_active.load(Relaxed),
      total_allocated_bytes: allocated,
      total_freed_bytes: freed,
      peak_allocated_bytes: self.peak_bytes.load(Relaxed),
      fragmentation_percent: match reserved {
        0 => 0,
        r => r.saturating_sub(live) * 100 / r,
      },
      live_allocations: self.live_allocations.load(Relaxed),
      mapped_bytes: superblocks_active * SUPERBLOCK_SIZE as u64 + self.large_mapped.load(Relaxed),
    }
  }
}

/// Snapshot of the process-wide counters.
pub fn global_stats() -> GlobalStats {
  COUNTERS.snapshot()
}

// =============================================================================
// ctl
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CtlError {
  #[error("unknown ctl operation")]
  UnknownOperation,
  #[error("output buffer too small: {needed} bytes needed")]
  BufferTooSmall { needed: usize },
  #[error("ctl operation is read-only")]
  ReadOnly,
  #[error("invalid ctl input")]
  InvalidInput,
}

impl CtlError {
  pub const fn errno(&self) -> i32 {
    match self {
      Self::UnknownOperation => libc::ENOENT,
      Self::ReadOnly => libc::EPERM,
      Self::BufferTooSmall { .. } | Self::InvalidInput => libc::EINVAL,
    }
  }
}

/// Reads or writes a named allocator setting.
///
/// Values are native-endian `u64`s. Readable operations write into `out` and
/// return the number of bytes written (or needed, when `out` is `None`).
/// Commands take no buffers and return 0.
///
/// | Operation                 | Kind       | Value                               |
/// |---------------------------|------------|-------------------------------------|
/// | `stats.allocated`         | read       | live requested bytes                |
/// | `stats.active`            | read       | live allocations                    |
/// | `stats.resident`          | read       | mapped bytes plus bootstrap usage   |
/// | `stats.peak`              | read       | peak live requested bytes           |
/// | `stats.fragmentation`     | read       | wasted share of reserved bytes, %   |
/// | `bootstrap.used`          | read       | bytes taken from the bootstrap heap |
/// | `opt.block_size`          | read       | bytes per block                     |
/// | `opt.abort_on_corruption` | read/write | 0 or 1                              |
/// | `arena.purge`             | command    | return unused memory to the OS      |
/// | `thread.reset`            | command    | detach the caller's cached blocks   |
/// | `arena.prefetch`          | command    | `MADV_WILLNEED` on superblocks      |
/// | `arena.sequential`        | command    | `MADV_SEQUENTIAL` on superblocks    |
/// | `arena.random`            | command    | `MADV_RANDOM` on superblocks        |
///
/// Commands write nothing and return 0, except the three page hints which
/// store how many superblocks accepted the hint when `out` is given.
pub fn ctl(op: &str, out: Option<&mut [u8]>, input: Option<&[u8]>) -> Result<usize, CtlError> {
  match op {
    "arena.purge" => {
      heap::purge();
      Ok(0)
    }
    "thread.reset" => {
      heap::reset_thread();
      Ok(0)
    }
    "arena.prefetch" | "arena.sequential" | "arena.random" => {
      let hint: unsafe fn(*mut Superblock) -> bool = match op {
        "arena.prefetch" => Superblock::prefetch,
        "arena.sequential" => Superblock::sequential,
        _ => Superblock::random,
      };
      let accepted = heap::advise(hint) as u64;
      match out {
        Some(out) => write_u64(out, accepted),
        None => Ok(0),
      }
    }
    "opt.abort_on_corruption" => {
      let old = config::abort_on_corruption() as u64;
      if let Some(raw) = input {
        match read_u64(raw)? {
          0 => config::set_abort_on_corruption(false),
          1 => config::set_abort_on_corruption(true),
          _ => return Err(CtlError::InvalidInput),
        }
      }
      match out {
        Some(out) => write_u64(out, old),
        None => Ok(size_of::<u64>()),
      }
    }
    _ => {
      let value = stat(op).ok_or(CtlError::UnknownOperation)?;
      if input.is_some() {
        return Err(CtlError::ReadOnly);
      }
      match out {
        Some(out) => write_u64(out, value),
        None => Ok(size_of::<u64>()),
      }
    }
  }
}

fn stat(op: &str) -> Option<u64> {
  let stats = COUNTERS.snapshot();
  let live = stats.total_allocated_bytes.saturating_sub(stats.total_freed_bytes);
  let (bootstrap_used, _) = bootstrap::bootstrap_stats();
  Some(match op {
    "stats.allocated" => live,
    "stats.active" => stats.live_allocations,
    "stats.resident" => stats.mapped_bytes + bootstrap_used as u64,
    "stats.peak" => stats.peak_allocated_bytes,
    "stats.fragmentation" => stats.fragmentation_percent,
    "bootstrap.used" => bootstrap_used as u64,
    "opt.block_size" => BLOCK_SIZE as u64,
    _ => return None,
  })
}

fn read_u64(raw: &[u8]) -> Result<u64, CtlError> {
  match raw.len() {
    1 => Ok(raw[0] as u64),
    8 => Ok(u64::from_ne_bytes(raw.try_into().map_err(|_| CtlError::InvalidInput)?)),
    _ => Err(CtlError::InvalidInput),
  }
}

fn write_u64(out: &mut [u8], value: u64) -> Result<usize, CtlError> {
  const N: usize = size_of::<u64>();
  let Some(dst) = out.get_mut(..N) else {
    return Err(CtlError::BufferTooSmall { needed: N });
  };
  dst.copy_from_slice(&value.to_ne_bytes());
  Ok(N)
}
