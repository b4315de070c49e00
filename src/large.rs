//! Requests above the largest size class, or with alignment above 16, get a
//! dedicated mapping with a 32-byte header in front of the user pointer.

use core::ptr::NonNull;

use crate::{
  HeapError, MIN_ALIGN, align_up,
  chunk::mix64,
  platform::{self, PAGE_SIZE},
  stats::COUNTERS,
};

const LARGE_TAG: u32 = 0x4547_524c; // "LRGE"

#[repr(C)]
struct LargeHeader {
  /// Start of the mapping.
  base: *mut u8,
  map_len: usize,
  /// Requested size.
  size: usize,
  checksum: u32,
  tag: u32,
}

const LARGE_HEADER_SIZE: usize = size_of::<LargeHeader>();
const _: () = assert!(LARGE_HEADER_SIZE == 32);

/// A validated large allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Large {
  pub(crate) size: usize,
  pub(crate) map_len: usize,
  /// Bytes from the user pointer to the end of the mapping.
  pub(crate) usable: usize,
}

fn checksum(cookie: u64, base: *mut u8, map_len: usize, size: usize) -> u32 {
  let h = mix64(cookie ^ base as u64 ^ (map_len as u64).rotate_left(17) ^ (size as u64).rotate_left(41));
  (h ^ (h >> 32)) as u32
}

fn map_len_for(size: usize, align: usize) -> Result<usize, HeapError> {
  size
    .checked_add(LARGE_HEADER_SIZE + align - MIN_ALIGN + PAGE_SIZE - 1)
    .map(|n| n & !(PAGE_SIZE - 1))
    .filter(|&n| n <= isize::MAX as usize)
    .ok_or(HeapError::SizeOverflow)
}

unsafe fn header_of(ptr: *mut u8) -> *mut LargeHeader {
  unsafe { ptr.sub(LARGE_HEADER_SIZE).cast() }
}

unsafe fn stamp(ptr: *mut u8, base: *mut u8, map_len: usize, size: usize, cookie: u64) {
  unsafe {
    header_of(ptr).write(LargeHeader {
      base,
      map_len,
      size,
      checksum: checksum(cookie, base, map_len, size),
      tag: LARGE_TAG,
    })
  };
}

/// Maps a fresh zeroed region holding `size` bytes at alignment `align`.
/// Returns the user pointer and the mapped length.
pub(crate) fn alloc(size: usize, align: usize, cookie: u64) -> Result<(NonNull<u8>, usize), HeapError> {
  let align = align.max(MIN_ALIGN);
  let map_len = map_len_for(size, align)?;
  let base = unsafe { platform::map(map_len) };
  if base.is_null() {
    return Err(HeapError::OutOfMemory(map_len));
  }

  let ptr = align_up(base as usize + LARGE_HEADER_SIZE, align) as *mut u8;
  unsafe { stamp(ptr, base, map_len, size, cookie) };
  COUNTERS.large_mapped(map_len);
  log::trace!("strata: large alloc {size} bytes at {ptr:p} ({map_len} mapped)");
  Ok((unsafe { NonNull::new_unchecked(ptr) }, map_len))
}

/// Validates the header in front of `ptr`.
pub(crate) unsafe fn lookup(ptr: *mut u8, cookie: u64) -> Result<Large, HeapError> {
  let addr = ptr as usize;
  if addr % MIN_ALIGN != 0 || addr < PAGE_SIZE {
    return Err(HeapError::ForeignPointer(addr));
  }
  let hdr = unsafe { &*header_of(ptr) };
  if hdr.tag != LARGE_TAG {
    return Err(HeapError::ForeignPointer(addr));
  }
  let end = hdr.base as usize + hdr.map_len;
  if hdr.checksum != checksum(cookie, hdr.base, hdr.map_len, hdr.size) || addr >= end || addr < hdr.base as usize {
    return Err(HeapError::ChecksumMismatch(addr));
  }
  Ok(Large {
    size: hdr.size,
    map_len: hdr.map_len,
    usable: end - addr,
  })
}

/// Unmaps a large allocation.
pub(crate) unsafe fn free(ptr: *mut u8, cookie: u64) -> Result<Large, HeapError> {
  unsafe {
    let large = lookup(ptr, cookie)?;
    platform::unmap((*header_of(ptr)).base, large.map_len);
    COUNTERS.large_unmapped(large.map_len);
    Ok(large)
  }
}

/// Resizes in place when the mapping already fits, otherwise moves it with
/// `mremap`. Fails with `OutOfMemory` when the kernel cannot remap, leaving
/// the existing allocation intact.
pub(crate) unsafe fn resize(ptr: *mut u8, new_size: usize, cookie: u64) -> Result<NonNull<u8>, HeapError> {
  unsafe {
    let large = lookup(ptr, cookie)?;
    let hdr = header_of(ptr);
    let base = (*hdr).base;
    let offset = ptr as usize - base as usize;
    let new_len = offset
      .checked_add(new_size)
      .filter(|&n| n <= isize::MAX as usize - PAGE_SIZE)
      .map(|n| align_up(n, PAGE_SIZE))
      .ok_or(HeapError::SizeOverflow)?;

    if new_len <= large.map_len && new_len * 2 > large.map_len {
      stamp(ptr, base, large.map_len, new_size, cookie);
      return Ok(NonNull::new_unchecked(ptr));
    }

    let new_base = platform::remap(base, large.map_len, new_len);
    if new_base.is_null() {
      return Err(HeapError::OutOfMemory(new_len));
    }
    let new_ptr = new_base.add(offset);
    stamp(new_ptr, new_base, new_len, new_size, cookie);
    COUNTERS.large_unmapped(large.map_len);
    COUNTERS.large_mapped(new_len);
    log::trace!("strata: remapped {ptr:p} -> {new_ptr:p} ({new_len} mapped)");
    Ok(NonNull::new_unchecked(new_ptr))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const COOKIE: u64 = 0xfeed;

  #[test]
  fn maps_page_rounded_and_aligned() {
    unsafe {
      let p = alloc(100_000, MIN_ALIGN, COOKIE).unwrap().0.as_ptr();
      assert_eq!(p as usize % MIN_ALIGN, 0);
      let large = lookup(p, COOKIE).unwrap();
      assert_eq!(large.size, 100_000);
      assert_eq!(large.map_len % PAGE_SIZE, 0);
      assert!(large.usable >= 100_000);
      p.add(99_999).write(1);
      assert_eq!(free(p, COOKIE).unwrap().size, 100_000);

      for align in [64, 4096, 1 << 16] {
        let q = alloc(10, align, COOKIE).unwrap().0.as_ptr();
        assert_eq!(q as usize % align, 0);
        assert!(lookup(q, COOKIE).unwrap().usable >= 10);
        free(q, COOKIE).unwrap();
      }
    }
  }

  #[test]
  fn rejects_bad_headers() {
    unsafe {
      let p = alloc(50_000, MIN_ALIGN, COOKIE).unwrap().0.as_ptr();
      assert!(matches!(lookup(p, COOKIE ^ 1), Err(HeapError::ChecksumMismatch(_))));
      assert!(matches!(lookup(p.add(1), COOKIE), Err(HeapError::ForeignPointer(_))));
      free(p, COOKIE).unwrap();
    }
    assert_eq!(map_len_for(usize::MAX - 10, MIN_ALIGN), Err(HeapError::SizeOverflow));
  }

  #[test]
  fn resize_keeps_contents() {
    unsafe {
      let p = alloc(40_000, MIN_ALIGN, COOKIE).unwrap().0.as_ptr();
      for i in 0..40_000 {
        p.add(i).write(i as u8);
      }
      let q = match resize(p, 4 << 20, COOKIE) {
        Ok(q) => q.as_ptr(),
        Err(HeapError::OutOfMemory(_)) if cfg!(not(target_os = "linux")) => return,
        Err(err) => panic!("{err}"),
      };
      for i in (0..40_000).step_by(997) {
        assert_eq!(q.add(i).read(), i as u8);
      }
      assert_eq!(lookup(q, COOKIE).unwrap().size, 4 << 20);

      // Shrinking a little stays in place.
      let r = resize(q, (4 << 20) - 5000, COOKIE).unwrap().as_ptr();
      assert_eq!(r, q);
      free(r, COOKIE).unwrap();
    }
  }
}
