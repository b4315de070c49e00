//! C ABI.
//!
//! The `strata_*` introspection functions are always exported. With the
//! `c_api` feature the malloc family is also exported under the libc names,
//! so the cdylib can be preloaded in front of the system allocator.

use core::{
  ffi::{CStr, c_char, c_int, c_void},
  slice,
};

use crate::{BlockInfo, GlobalStats, ThreadStats, heap, platform, stats};

/// Visitor called by [`strata_heap_walk`] once per block: address, block size,
/// size class, used chunks, total chunks, user data.
pub type HeapVisitor = unsafe extern "C" fn(usize, usize, usize, usize, usize, *mut c_void);

/// Reads and/or writes a named control value.
///
/// With `oldp` and `oldlenp` set, the current value is written to `oldp` and
/// `*oldlenp` receives its length. With only `oldlenp` set, the needed length
/// is stored. `newp`/`newlen` supply a new value. Returns 0, or -1 with
/// `errno` set to `ENOENT`, `EPERM` or `EINVAL`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_ctl(
  name: *const c_char,
  oldp: *mut c_void,
  oldlenp: *mut usize,
  newp: *const c_void,
  newlen: usize,
) -> c_int {
  if name.is_null() {
    platform::set_errno(libc::EINVAL);
    return -1;
  }
  let Ok(name) = (unsafe { CStr::from_ptr(name) }).to_str() else {
    platform::set_errno(libc::ENOENT);
    return -1;
  };

  let out = match (oldp.is_null(), oldlenp.is_null()) {
    (false, false) => Some(unsafe { slice::from_raw_parts_mut(oldp.cast::<u8>(), *oldlenp) }),
    _ => None,
  };
  let input = (!newp.is_null()).then(|| unsafe { slice::from_raw_parts(newp.cast::<u8>(), newlen) });

  match stats::ctl(name, out, input) {
    Ok(len) => {
      if !oldlenp.is_null() {
        unsafe { *oldlenp = len };
      }
      0
    }
    Err(err) => {
      platform::set_errno(err.errno());
      -1
    }
  }
}

/// Copies the calling thread's counters to `out`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_thread_stats(out: *mut ThreadStats) {
  if !out.is_null() {
    unsafe { out.write(heap::thread_stats()) };
  }
}

/// Copies the process-wide counters to `out`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_global_stats(out: *mut GlobalStats) {
  if !out.is_null() {
    unsafe { out.write(stats::global_stats()) };
  }
}

/// Calls `visitor` for every block dedicated to a size class.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_heap_walk(visitor: Option<HeapVisitor>, userdata: *mut c_void) {
  let Some(visitor) = visitor else {
    return;
  };
  heap::heap_walk(|info: &BlockInfo| unsafe {
    visitor(
      info.addr,
      info.block_size,
      info.size_class,
      info.used_chunks,
      info.total_chunks,
      userdata,
    )
  });
}

// =============================================================================
// libc Names
// =============================================================================

#[cfg(feature = "c_api")]
mod exports {
  use core::ffi::c_void;

  use crate::{heap, platform};

  #[inline]
  fn check(ptr: *mut u8) -> *mut c_void {
    if ptr.is_null() {
      platform::set_errno(libc::ENOMEM);
    }
    ptr.cast()
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    check(unsafe { heap::malloc(size) })
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { heap::free(ptr.cast()) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    check(unsafe { heap::calloc(count, size) })
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let new = unsafe { heap::realloc(ptr.cast(), size) };
    if size == 0 && !ptr.is_null() {
      return new.cast();
    }
    check(new)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, align: usize, size: usize) -> i32 {
    unsafe { heap::posix_memalign(memptr.cast(), align, size) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    let ptr = unsafe { heap::aligned_alloc(align, size) };
    if ptr.is_null() && !align.is_power_of_two() {
      platform::set_errno(libc::EINVAL);
      return ptr.cast();
    }
    check(ptr)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    let ptr = unsafe { heap::memalign(align, size) };
    if ptr.is_null() && !align.is_power_of_two() {
      platform::set_errno(libc::EINVAL);
      return ptr.cast();
    }
    check(ptr)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    unsafe { heap::malloc_usable_size(ptr.cast()) }
  }

  /// Brings the heap up at load time, before `main` and other threads.
  #[cfg(target_os = "linux")]
  #[used]
  #[unsafe(link_section = ".init_array")]
  static INIT: extern "C" fn() = {
    extern "C" fn init() {
      heap::init();
    }
    init
  };
}
