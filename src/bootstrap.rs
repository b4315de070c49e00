//! Static bump heap for allocations made before the main heap is up.
//!
//! The dynamic linker and libc call `malloc` before constructors run, and the
//! heap's own initialization may allocate. Those requests are carved from a
//! 256 KiB buffer in `.bss`. Memory handed out here is never reclaimed; `free`
//! on it is accepted and ignored.

use core::{
  cell::UnsafeCell,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{HeapError, MIN_ALIGN, align_up, error::report};

pub const BOOTSTRAP_HEAP_SIZE: usize = 256 * 1024;

/// Each allocation is prefixed with its requested size.
const PREFIX: usize = MIN_ALIGN;

#[repr(C, align(16))]
pub(crate) struct BootstrapHeap<const N: usize> {
  buf: UnsafeCell<[u8; N]>,
  offset: AtomicUsize,
}

unsafe impl<const N: usize> Sync for BootstrapHeap<N> {}

impl<const N: usize> BootstrapHeap<N> {
  pub(crate) const fn new() -> Self {
    Self {
      buf: UnsafeCell::new([0; N]),
      offset: AtomicUsize::new(0),
    }
  }

  pub(crate) fn alloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
    let exhausted = |used: usize| HeapError::BootstrapExhausted {
      requested: size,
      used,
      capacity: N,
    };
    if size > N {
      return Err(exhausted(self.used()));
    }

    // A refused request leaves the offset alone: smaller ones may still fit.
    let need = align_up(size + PREFIX, MIN_ALIGN);
    let mut offset = self.offset.load(Ordering::Relaxed);
    loop {
      if need > N - offset {
        return Err(exhausted(offset));
      }
      match self
        .offset
        .compare_exchange_weak(offset, offset + need, Ordering::Relaxed, Ordering::Relaxed)
      {
        Ok(_) => break,
        Err(current) => offset = current,
      }
    }

    unsafe {
      let prefix = (self.buf.get() as *mut u8).add(offset);
      prefix.cast::<usize>().write(size);
      Ok(NonNull::new_unchecked(prefix.add(PREFIX)))
    }
  }

  #[inline]
  pub(crate) fn contains(&self, ptr: *const u8) -> bool {
    let start = self.buf.get() as usize;
    (start..start + N).contains(&(ptr as usize))
  }

  /// Requested size of an allocation made by [`Self::alloc`].
  pub(crate) unsafe fn size_of(&self, ptr: *const u8) -> usize {
    unsafe { ptr.sub(PREFIX).cast::<usize>().read() }
  }

  pub(crate) fn used(&self) -> usize {
    self.offset.load(Ordering::Relaxed)
  }
}

static BOOTSTRAP: BootstrapHeap<BOOTSTRAP_HEAP_SIZE> = BootstrapHeap::new();

/// Allocates from the static buffer. Returns null once it is exhausted.
pub fn bootstrap_malloc(size: usize) -> *mut u8 {
  match BOOTSTRAP.alloc(size) {
    Ok(ptr) => ptr.as_ptr(),
    Err(err) => {
      report(err);
      null_mut()
    }
  }
}

pub(crate) fn alloc(size: usize) -> Result<NonNull<u8>, HeapError> {
  BOOTSTRAP.alloc(size)
}

/// Accepts a pointer from the static buffer. The memory is not reused.
pub fn bootstrap_free(ptr: *mut u8) {
  if !ptr.is_null() && !BOOTSTRAP.contains(ptr) {
    log::warn!("strata: bootstrap_free called with foreign pointer {ptr:p}");
  }
}

#[inline]
pub fn is_bootstrap_pointer(ptr: *const u8) -> bool {
  BOOTSTRAP.contains(ptr)
}

/// Requested size of a bootstrap allocation.
pub(crate) unsafe fn size_of(ptr: *const u8) -> usize {
  unsafe { BOOTSTRAP.size_of(ptr) }
}

/// `(used, capacity)` of the static buffer in bytes.
pub fn bootstrap_stats() -> (usize, usize) {
  (BOOTSTRAP.used(), BOOTSTRAP_HEAP_SIZE)
}
