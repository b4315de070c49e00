//! Thin wrappers over the OS primitives the heap needs: anonymous mappings,
//! page advice, thread identity, liveness probes and a few sysfs reads.

use core::{cell::Cell, ffi::CStr, ptr::null_mut};

pub(crate) const PAGE_SIZE: usize = 4096;

// =============================================================================
// Mappings
// =============================================================================

/// Maps `size` bytes of zeroed, private anonymous memory. Returns null on failure.
pub(crate) unsafe fn map(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn unmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Grows or shrinks a mapping, moving it if needed. Returns null on failure.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn remap(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
  let new = unsafe { libc::mremap(ptr.cast(), old_size, new_size, libc::MREMAP_MAYMOVE) };
  if new == libc::MAP_FAILED {
    null_mut()
  } else {
    new as *mut u8
  }
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn remap(_ptr: *mut u8, _old_size: usize, _new_size: usize) -> *mut u8 {
  null_mut()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advice {
  /// Ask for transparent huge page backing.
  HugePage,
  /// Drop the physical pages; the range reads back as zeroes.
  Purge,
  WillNeed,
  Sequential,
  Random,
}

/// Applies `advice` to a page-aligned range. Returns false if the kernel refused.
pub(crate) unsafe fn advise(ptr: *mut u8, len: usize, advice: Advice) -> bool {
  let flag = match advice {
    #[cfg(target_os = "linux")]
    Advice::HugePage => libc::MADV_HUGEPAGE,
    #[cfg(not(target_os = "linux"))]
    Advice::HugePage => return false,
    Advice::Purge => libc::MADV_DONTNEED,
    Advice::WillNeed => libc::MADV_WILLNEED,
    Advice::Sequential => libc::MADV_SEQUENTIAL,
    Advice::Random => libc::MADV_RANDOM,
  };
  unsafe { libc::madvise(ptr.cast(), len, flag) == 0 }
}

// =============================================================================
// Threads
// =============================================================================

/// Kernel id of the calling thread. Never 0, which the heap reserves for "no owner".
#[inline]
pub(crate) fn thread_id() -> u64 {
  thread_local! {
    static TID: Cell<u64> = const { Cell::new(0) };
  }
  TID.with(|tid| {
    let mut id = tid.get();
    if id == 0 {
      id = current_tid();
      tid.set(id);
    }
    id
  })
}

#[cfg(target_os = "linux")]
fn current_tid() -> u64 {
  unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> u64 {
  use core::sync::atomic::{AtomicU64, Ordering};

  static NEXT: AtomicU64 = AtomicU64::new(1);
  NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Whether thread `tid` of this process still exists.
///
/// A signal-0 `tgkill` only fails with `ESRCH` once the thread is gone. A
/// recycled tid reads as alive, which only delays reclamation.
#[cfg(target_os = "linux")]
pub(crate) fn thread_alive(tid: u64) -> bool {
  let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid as libc::pid_t, 0) };
  rc == 0 || errno() != libc::ESRCH
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn thread_alive(_tid: u64) -> bool {
  true
}

#[cfg(target_os = "linux")]
fn errno() -> i32 {
  unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "linux")]
pub(crate) fn set_errno(code: i32) {
  unsafe { *libc::__errno_location() = code };
}

#[cfg(target_os = "macos")]
pub(crate) fn set_errno(code: i32) {
  unsafe { *libc::__error() = code };
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub(crate) fn set_errno(_code: i32) {}

// =============================================================================
// Entropy
// =============================================================================

/// 64 bits of process entropy for checksums and free-list keys.
pub(crate) fn entropy() -> u64 {
  #[cfg(target_os = "linux")]
  {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::getrandom(buf.as_mut_ptr().cast(), buf.len(), libc::GRND_NONBLOCK) };
    if n == buf.len() as isize {
      return u64::from_ne_bytes(buf);
    }
    log::warn!("strata: getrandom unavailable, deriving cookie from pid and time");
  }

  let pid = unsafe { libc::getpid() } as u64;
  let now = unsafe { libc::time(null_mut()) } as u64;
  let stack = &pid as *const u64 as u64;
  crate::chunk::mix64(pid ^ now.rotate_left(32) ^ stack)
}

// =============================================================================
// System Topology
// =============================================================================

/// Reads a small sysfs/procfs file into `buf` without allocating.
fn read_file(path: &CStr, buf: &mut [u8]) -> Option<usize> {
  let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
  if fd < 0 {
    return None;
  }
  let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
  unsafe { libc::close(fd) };
  usize::try_from(n).ok()
}

/// True when THP is set to `always` or `madvise`.
pub(crate) fn huge_pages_available() -> bool {
  let mut buf = [0u8; 128];
  match read_file(c"/sys/kernel/mm/transparent_hugepage/enabled", &mut buf) {
    Some(n) => thp_enabled(&buf[..n]),
    None => false,
  }
}

fn thp_enabled(setting: &[u8]) -> bool {
  contains(setting, b"[always]") || contains(setting, b"[madvise]")
}

/// Number of online NUMA nodes, 1 when unknown.
pub(crate) fn numa_node_count() -> u32 {
  let mut buf = [0u8; 256];
  read_file(c"/sys/devices/system/node/online", &mut buf)
    .and_then(|n| count_node_list(&buf[..n]))
    .filter(|&n| n > 0)
    .unwrap_or(1)
}

/// Counts the entries of a kernel list such as `0-3,5,7-8`.
fn count_node_list(list: &[u8]) -> Option<u32> {
  let mut total = 0u32;
  for range in list.trim_ascii().split(|&b| b == b',') {
    if range.is_empty() {
      continue;
    }
    let mut ends = range.splitn(2, |&b| b == b'-');
    let lo = parse_u32(ends.next()?)?;
    let hi = match ends.next() {
      Some(hi) => parse_u32(hi)?,
      None => lo,
    };
    total = total.checked_add(hi.checked_sub(lo)? + 1)?;
  }
  Some(total)
}

fn parse_u32(digits: &[u8]) -> Option<u32> {
  if digits.is_empty() {
    return None;
  }
  digits.iter().try_fold(0u32, |acc, &d| {
    if !d.is_ascii_digit() {
      return None;
    }
    acc.checked_mul(10)?.checked_add((d - b'0') as u32)
  })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
  haystack.windows(needle.len()).any(|w| w == needle)
}
